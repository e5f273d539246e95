//! Orchestrator (spec §4.I): top-level object wiring the Registry,
//! Supervisor, and Heartbeat; exposes `run`/`stop`; applies testing-mode
//! vhost namespacing once at construction, matching
//! `original_source/neon_mq_connector/connector.py::run`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{self, ResolvedMq};
use crate::connection::{self, ConnectionFactory};
use crate::envelope::{new_message_id, ConnectorId};
use crate::error::{ConnectorError, Result};
use crate::heartbeat::{Heartbeat, DEFAULT_SYNC_PERIOD};
use crate::registry::Registry;
use crate::supervisor::{Supervisor, DEFAULT_OBSERVE_PERIOD};
use crate::worker::ConsumerSpec;

pub struct Orchestrator {
    service_name: String,
    service_id: ConnectorId,
    vhost: String,
    factory: ConnectionFactory,
    registry: Arc<Registry>,
    supervisor: Option<Supervisor>,
    heartbeat: Option<Heartbeat>,
    observe_period: Duration,
    sync_period: Duration,
}

impl Orchestrator {
    /// Builds the orchestrator for `service_name` against `mq`. The testing-
    /// mode vhost rewrite (spec.md §6) is applied here, once, so `vhost()`
    /// already reflects it and a second construction with the same inputs
    /// is idempotent.
    pub fn new(mq: ResolvedMq, service_name: impl Into<String>, vhost: &str) -> Self {
        let service_name = service_name.into();
        let vhost = config::apply_testing_mode(vhost, &service_name);
        let factory = ConnectionFactory::new(mq);
        Self {
            service_name,
            service_id: new_message_id(),
            vhost,
            registry: Arc::new(Registry::new(factory.clone())),
            factory,
            supervisor: None,
            heartbeat: None,
            observe_period: DEFAULT_OBSERVE_PERIOD,
            sync_period: DEFAULT_SYNC_PERIOD,
        }
    }

    pub fn with_observe_period(mut self, period: Duration) -> Self {
        self.observe_period = period;
        self
    }

    pub fn with_sync_period(mut self, period: Duration) -> Self {
        self.sync_period = period;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn service_id(&self) -> ConnectorId {
        self.service_id
    }

    pub async fn register(&self, spec: ConsumerSpec, skip_if_exists: bool) -> Result<()> {
        self.registry.register(spec, skip_if_exists).await
    }

    /// Thin pass-through to `Registry::register_subscriber` (SPEC_FULL.md §10
    /// supplemented feature).
    #[allow(clippy::too_many_arguments)]
    pub async fn register_subscriber(
        &self,
        name: impl Into<String>,
        vhost: impl Into<String>,
        exchange: impl Into<String>,
        callback: crate::worker::ConsumerCallback,
        exchange_reset: bool,
        skip_if_exists: bool,
    ) -> Result<()> {
        self.registry
            .register_subscriber(name, vhost, exchange, callback, exchange_reset, skip_if_exists)
            .await
    }

    /// Waits for the broker (`wait_for_broker`, spec.md §4.B) then launches
    /// the requested subsystems (spec.md §4.I `run`).
    pub async fn run(
        &mut self,
        run_consumers: bool,
        run_heartbeat: bool,
        run_supervisor: bool,
        broker_wait_timeout_secs: u64,
    ) -> Result<()> {
        let reachable = connection::wait_for_broker(
            &self.factory.mq.host,
            self.factory.mq.port,
            broker_wait_timeout_secs,
        )
        .await;
        if !reachable {
            return Err(ConnectorError::BrokerUnavailable {
                host: self.factory.mq.host.clone(),
                port: self.factory.mq.port,
                reason: "not reachable before startup deadline".to_string(),
            });
        }

        if run_consumers {
            self.registry.run(&[]).await?;
        }
        if run_heartbeat {
            self.heartbeat = Some(Heartbeat::spawn(
                self.factory.clone(),
                self.vhost.clone(),
                self.service_name.clone(),
                self.service_id,
                self.sync_period,
            ));
        }
        if run_supervisor {
            self.supervisor = Some(Supervisor::spawn(self.registry.clone(), self.observe_period));
        }

        info!(service = %self.service_name, vhost = %self.vhost, "orchestrator_running");
        Ok(())
    }

    /// Stops consumers, cancels the heartbeat and supervisor, and joins
    /// every background task (spec.md §4.I `stop`).
    pub async fn stop(&mut self) -> Result<()> {
        let stop_result = self.registry.stop(&[]).await;
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.stop().await;
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        info!(service = %self.service_name, "orchestrator_stopped");
        stop_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_mq() -> ResolvedMq {
        ResolvedMq {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "guest".to_string(),
            password: "guest".to_string(),
        }
    }

    #[tokio::test]
    async fn run_fails_fast_when_broker_never_becomes_reachable() {
        let mut orchestrator = Orchestrator::new(unreachable_mq(), "orch-demo", "/");
        let err = orchestrator.run(false, false, false, 1).await.unwrap_err();
        assert!(matches!(err, ConnectorError::BrokerUnavailable { .. }));
    }

    #[test]
    fn without_testing_env_vars_vhost_is_unchanged() {
        let orchestrator = Orchestrator::new(unreachable_mq(), "orch-demo-service", "/orders");
        assert_eq!(orchestrator.vhost(), "/orders");
    }
}
