//! Supervisor (spec §4.F): a periodic task that restarts dead-but-expected-
//! alive consumers up to their restart budget. Cancellable via
//! `tokio_util::sync::CancellationToken`, not a `threading.Timer`-style
//! repeater (spec.md §9 design note) — shaped like `email-fetcher/src/main.rs`'s
//! `loop { select! { _ = signal::ctrl_c() => ..., _ = sleep(...) => ... } }`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ConnectorError;
use crate::registry::Registry;

pub const DEFAULT_OBSERVE_PERIOD: Duration = Duration::from_secs(20);

pub struct Supervisor {
    stop_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Spawns the periodic scan. The registry is scanned every
    /// `observe_period`; the interval's first (immediate) tick is consumed
    /// up front so the first real scan waits a full period, matching
    /// spec.md §4.F's "fires every `observe_period` seconds".
    pub fn spawn(registry: Arc<Registry>, observe_period: Duration) -> Self {
        let stop_token = CancellationToken::new();
        let token = stop_token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(observe_period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("supervisor_stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        scan_once(&registry).await;
                    }
                }
            }
        });

        Self { stop_token, task }
    }

    /// Cancels the supervisor and joins its task. Cancellation takes effect
    /// after the current tick completes (spec.md §5 cancellation contract).
    pub async fn stop(self) {
        self.stop_token.cancel();
        let _ = self.task.await;
    }
}

async fn scan_once(registry: &Registry) {
    for entry in registry.snapshot() {
        if !entry.started {
            continue;
        }
        if entry.alive && entry.consuming {
            continue;
        }
        if entry.restart_count >= entry.restart_budget {
            continue;
        }
        match registry.restart(&entry.name).await {
            Ok(()) => info!(consumer = %entry.name, "supervisor_restarted_consumer"),
            Err(ConnectorError::RestartBudgetExceeded { name, budget }) => {
                warn!(consumer = %name, budget, "restart budget exceeded");
            }
            Err(err) => warn!(consumer = %entry.name, %err, "supervisor restart failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedMq;
    use crate::connection::ConnectionFactory;
    use crate::worker::{ConsumerCallback, ConsumerSpec, Message};

    fn test_registry() -> Arc<Registry> {
        Arc::new(Registry::new(ConnectionFactory::new(ResolvedMq {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
        })))
    }

    #[tokio::test]
    async fn scan_skips_consumers_that_are_not_started() {
        let registry = test_registry();
        registry
            .register(
                ConsumerSpec::new(
                    "c1",
                    "/",
                    "q1",
                    ConsumerCallback::Blocking(Arc::new(|_m: &Message| Ok(()))),
                ),
                false,
            )
            .await
            .unwrap();

        scan_once(&registry).await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].restart_count, 0);
    }

    #[tokio::test]
    async fn spawn_and_stop_completes_without_a_registered_consumer() {
        let registry = test_registry();
        let supervisor = Supervisor::spawn(registry, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(5)).await;
        supervisor.stop().await;
    }
}
