//! Consumer Registry (spec §4.E): the process-wide `name -> (spec, worker,
//! restart-state)` map. Backed by `dashmap::DashMap` for the map itself
//! (grounded in `fc-queue/src/activemq.rs`'s use of `DashMap` for concurrent
//! delivery-tag bookkeeping), with an async mutex serializing the multi-step
//! register/stop/restart sequences end-to-end (spec.md invariant 1) — a
//! `tokio::sync::Mutex` rather than `parking_lot`'s, since those sequences
//! await worker joins and connects.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::ConnectionFactory;
use crate::error::{ConnectorError, Result};
use crate::worker::{self, ConsumerCallback, ConsumerSpec, ExchangeKindSpec, WorkerHandle};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    spec: Arc<ConsumerSpec>,
    worker: Option<WorkerHandle>,
    started: bool,
    restart_count: u32,
}

/// A point-in-time view of one consumer, handed to the Supervisor instead
/// of the live worker handle (arena + index design note, spec.md §9).
#[derive(Debug, Clone)]
pub struct ConsumerSnapshot {
    pub name: String,
    pub started: bool,
    pub restart_count: u32,
    pub restart_budget: u32,
    pub alive: bool,
    pub consuming: bool,
}

pub struct Registry {
    factory: ConnectionFactory,
    consumers: DashMap<String, Entry>,
    mutate: Mutex<()>,
}

impl Registry {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            consumers: DashMap::new(),
            mutate: Mutex::new(()),
        }
    }

    /// Registers `spec`. If a consumer of the same name already exists,
    /// `skip_if_exists` leaves it untouched; otherwise the prior worker is
    /// stopped before the new spec is installed (spec.md invariant 1).
    pub async fn register(&self, spec: ConsumerSpec, skip_if_exists: bool) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let name = spec.name.clone();

        if self.consumers.contains_key(&name) {
            if skip_if_exists {
                return Ok(());
            }
            self.stop_locked(&name).await?;
        }

        self.consumers.insert(
            name,
            Entry {
                spec: Arc::new(spec),
                worker: None,
                started: false,
                restart_count: 0,
            },
        );
        Ok(())
    }

    /// Registers a fanout-exchange subscriber on a client-generated,
    /// exclusive queue name `subscriber_<exchange>_<6-hex>` (SPEC_FULL.md §10
    /// supplemented feature), wrapping `register` with `exchange_type=fanout`
    /// and `queue_exclusive=true`. Matches
    /// `original_source/neon_mq_connector/connector.py::register_subscriber`,
    /// including its queue-naming scheme — the queue name is generated here,
    /// not server-assigned, so it is stable across a supervisor restart.
    pub async fn register_subscriber(
        &self,
        name: impl Into<String>,
        vhost: impl Into<String>,
        exchange: impl Into<String>,
        callback: ConsumerCallback,
        exchange_reset: bool,
        skip_if_exists: bool,
    ) -> Result<()> {
        let exchange = exchange.into();
        let queue = subscriber_queue_name(&exchange);
        let spec = ConsumerSpec::new(name, vhost, queue, callback)
            .with_exchange(exchange, ExchangeKindSpec::Fanout)
            .with_queue_exclusive(true)
            .with_exchange_reset(exchange_reset);
        self.register(spec, skip_if_exists).await
    }

    /// Launches every named consumer not currently alive, or every
    /// registered consumer when `names` is empty (spec.md §4.E `run`).
    pub async fn run(&self, names: &[String]) -> Result<()> {
        let _guard = self.mutate.lock().await;
        for name in self.target_names(names) {
            self.start_one(&name);
        }
        Ok(())
    }

    fn start_one(&self, name: &str) {
        let Some(mut entry) = self.consumers.get_mut(name) else {
            return;
        };
        let already_alive = entry.worker.as_ref().is_some_and(WorkerHandle::is_alive);
        if already_alive {
            return;
        }
        let handle = worker::spawn(entry.spec.clone(), self.factory.clone());
        entry.worker = Some(handle);
        entry.started = true;
        info!(consumer = name, "consumer_run");
    }

    /// Stops every named consumer, joining each with `DEFAULT_JOIN_TIMEOUT`
    /// (spec.md §4.E `stop`). Keeps stopping the remaining consumers even if
    /// one fails to join in time, surfacing the first failure.
    pub async fn stop(&self, names: &[String]) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let mut first_err = None;
        for name in self.target_names(names) {
            if let Err(err) = self.stop_locked(&name).await {
                warn!(consumer = %name, %err, "stop failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_locked(&self, name: &str) -> Result<()> {
        let worker = {
            let Some(mut entry) = self.consumers.get_mut(name) else {
                return Ok(());
            };
            entry.started = false;
            entry.worker.take()
        };
        if let Some(worker) = worker {
            worker.stop(DEFAULT_JOIN_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Restarts one consumer (spec.md §4.E `restart`, invoked by the
    /// Supervisor): checks the restart budget, stops the old worker,
    /// reinstantiates from the stored spec, starts it, bumps `restart_count`.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let _guard = self.mutate.lock().await;

        let (spec, restart_count, restart_budget) = {
            let Some(entry) = self.consumers.get(name) else {
                return Err(ConnectorError::ConfigMissing(format!(
                    "unknown consumer {name}"
                )));
            };
            (
                entry.spec.clone(),
                entry.restart_count,
                entry.spec.restart_budget,
            )
        };

        if restart_count >= restart_budget {
            return Err(ConnectorError::RestartBudgetExceeded {
                name: name.to_string(),
                budget: restart_budget,
            });
        }

        self.stop_locked(name).await?;

        let Some(mut entry) = self.consumers.get_mut(name) else {
            return Err(ConnectorError::ConfigMissing(format!(
                "unknown consumer {name}"
            )));
        };
        let handle = worker::spawn(spec, self.factory.clone());
        entry.worker = Some(handle);
        entry.started = true;
        entry.restart_count += 1;
        info!(
            consumer = name,
            restart_count = entry.restart_count,
            "consumer_restarted"
        );
        Ok(())
    }

    /// A consistent snapshot of every registered consumer, for the
    /// Supervisor to scan without holding the mutation lock (spec.md §4.E
    /// concurrency discipline: "readers take a consistent snapshot").
    pub fn snapshot(&self) -> Vec<ConsumerSnapshot> {
        self.consumers
            .iter()
            .map(|entry| ConsumerSnapshot {
                name: entry.key().clone(),
                started: entry.started,
                restart_count: entry.restart_count,
                restart_budget: entry.spec.restart_budget,
                alive: entry.worker.as_ref().is_some_and(WorkerHandle::is_alive),
                consuming: entry.worker.as_ref().is_some_and(WorkerHandle::is_consuming),
            })
            .collect()
    }

    fn target_names(&self, names: &[String]) -> Vec<String> {
        if names.is_empty() {
            self.consumers.iter().map(|e| e.key().clone()).collect()
        } else {
            names.to_vec()
        }
    }

    #[cfg(test)]
    fn queue_of(&self, name: &str) -> Option<String> {
        self.consumers.get(name).map(|e| e.spec.queue.clone())
    }
}

fn subscriber_queue_name(exchange: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("subscriber_{exchange}_{}", &hex[..6])
}
