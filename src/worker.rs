//! Consumer Worker (spec §4.D): one Tokio task per registered consumer.
//! Opens a channel, declares topology, runs a consume loop, and dispatches
//! each delivery to a user callback with ack/nack handled per `auto_ack`
//! and `ack_on_callback_error`.
//!
//! Grounded in `report-fast-renderer`'s vendored `cleanapp_rustlib::rabbitmq::
//! subscriber` (topology setup shape, `connect_channel`) and the
//! `rabbitmq-subscriber` vendored variant (retry-count headers, panic
//! catching, `PermanentError`-style nack decisions) — adapted to the state
//! machine spec.md §4.D prescribes (dead on channel close, no self-reconnect;
//! reconnection is the Supervisor's job, `src/supervisor.rs`).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ExchangeKind};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::ConnectionFactory;
use crate::error::{ConnectorError, Result};

pub const DEFAULT_PREFETCH: u16 = 50;
pub const DEFAULT_RESTART_BUDGET: u32 = 5;

/// Exchange kinds a consumer can bind to (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKindSpec {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKindSpec {
    pub(crate) fn as_lapin(self) -> ExchangeKind {
        match self {
            Self::Direct => ExchangeKind::Direct,
            Self::Fanout => ExchangeKind::Fanout,
            Self::Topic => ExchangeKind::Topic,
            Self::Headers => ExchangeKind::Headers,
        }
    }
}

/// A received delivery, handed to callbacks.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl Message {
    fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            body: delivery.data.clone(),
            routing_key: delivery.routing_key.to_string(),
            exchange: delivery.exchange.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        }
    }
}

pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Two dispatch flavors coexist (spec §4.D): a synchronous callback invoked
/// inline, or an async callback awaited per delivery. Both share the same
/// topology setup and worker state machine; the choice is made per
/// `ConsumerSpec` rather than by a separate worker type.
pub enum ConsumerCallback {
    Blocking(Arc<dyn Fn(&Message) -> CallbackResult + Send + Sync>),
    Async(Arc<dyn AsyncConsumerCallback>),
}

#[async_trait]
pub trait AsyncConsumerCallback: Send + Sync {
    async fn on_message(&self, message: &Message) -> CallbackResult;
}

/// Receives `(worker_name, error)` for failures the worker can't recover
/// from itself (spec §6 "error signalling").
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, worker_name: &str, err: &(dyn std::error::Error + 'static));
}

/// Default sink: logs through `tracing` and does nothing else.
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn on_error(&self, worker_name: &str, err: &(dyn std::error::Error + 'static)) {
        error!(worker = worker_name, %err, "consumer error");
    }
}

/// How to resolve a callback error into an ack decision (spec §9 Open
/// Question, resolved in SPEC_FULL.md §4.D). Default is `Requeue`, matching
/// the vendored subscriber's nack-and-requeue-until-retry-budget behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOnCallbackError {
    Ack,
    Nack,
    Requeue,
}

/// Immutable consumer configuration (spec §3). Replaced wholesale on
/// re-register, never mutated in place — the Registry holds it behind an
/// `Arc` so a supervisor restart can reuse the same spec without cloning it.
pub struct ConsumerSpec {
    pub name: String,
    pub vhost: String,
    pub queue: String,
    pub exchange: String,
    pub exchange_type: ExchangeKindSpec,
    pub queue_reset: bool,
    pub exchange_reset: bool,
    pub queue_exclusive: bool,
    pub auto_ack: bool,
    pub prefetch: u16,
    pub callback: ConsumerCallback,
    pub on_error: Arc<dyn ErrorSink>,
    pub restart_budget: u32,
    pub ack_on_callback_error: AckOnCallbackError,
}

impl ConsumerSpec {
    pub fn new(
        name: impl Into<String>,
        vhost: impl Into<String>,
        queue: impl Into<String>,
        callback: ConsumerCallback,
    ) -> Self {
        Self {
            name: name.into(),
            vhost: vhost.into(),
            queue: queue.into(),
            exchange: String::new(),
            exchange_type: ExchangeKindSpec::Direct,
            queue_reset: false,
            exchange_reset: false,
            queue_exclusive: false,
            auto_ack: false,
            prefetch: DEFAULT_PREFETCH,
            callback,
            on_error: Arc::new(TracingErrorSink),
            restart_budget: DEFAULT_RESTART_BUDGET,
            ack_on_callback_error: AckOnCallbackError::Requeue,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>, kind: ExchangeKindSpec) -> Self {
        self.exchange = exchange.into();
        self.exchange_type = kind;
        self
    }

    pub fn with_queue_reset(mut self, reset: bool) -> Self {
        self.queue_reset = reset;
        self
    }

    pub fn with_exchange_reset(mut self, reset: bool) -> Self {
        self.exchange_reset = reset;
        self
    }

    pub fn with_queue_exclusive(mut self, exclusive: bool) -> Self {
        self.queue_exclusive = exclusive;
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_on_error(mut self, on_error: Arc<dyn ErrorSink>) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_restart_budget(mut self, budget: u32) -> Self {
        self.restart_budget = budget;
        self
    }

    pub fn with_ack_on_callback_error(mut self, policy: AckOnCallbackError) -> Self {
        self.ack_on_callback_error = policy;
        self
    }
}

/// The worker's lifecycle state (spec.md §4.D state machine table, followed
/// literally — a channel closed by the broker lands on `Dead`, it does not
/// self-reconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Created,
    Starting,
    Consuming,
    Stopping,
    Terminated,
    Dead,
}

/// A running (or finished) worker. Held by the Registry; never shared
/// beyond it (arena + index design note, spec.md §9).
pub struct WorkerHandle {
    name: String,
    phase: Arc<RwLock<WorkerPhase>>,
    resolved_queue: Arc<RwLock<String>>,
    stop_token: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.read()
    }

    pub fn is_consuming(&self) -> bool {
        matches!(self.phase(), WorkerPhase::Consuming)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.phase(), WorkerPhase::Terminated | WorkerPhase::Dead)
    }

    /// The queue actually bound to, which may differ from `spec.queue` when
    /// the broker assigned the name (spec.md §4.D edge case).
    pub fn resolved_queue(&self) -> String {
        self.resolved_queue.read().clone()
    }

    /// Requests the worker to stop and joins it, surfacing `JoinTimeout` if
    /// it doesn't finish within `timeout` (spec.md §4.E `stop`).
    pub async fn stop(self, timeout: Duration) -> Result<()> {
        let name = self.name.clone();
        self.stop_token.cancel();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ConnectorError::JoinTimeout {
                name,
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

/// Spawns a worker for `spec`, connecting through `factory`.
pub fn spawn(spec: Arc<ConsumerSpec>, factory: ConnectionFactory) -> WorkerHandle {
    let name = spec.name.clone();
    let phase = Arc::new(RwLock::new(WorkerPhase::Created));
    let resolved_queue = Arc::new(RwLock::new(spec.queue.clone()));
    let stop_token = CancellationToken::new();

    let task = tokio::spawn(run_worker(
        spec,
        factory,
        phase.clone(),
        resolved_queue.clone(),
        stop_token.clone(),
    ));

    WorkerHandle {
        name,
        phase,
        resolved_queue,
        stop_token,
        task,
    }
}

async fn run_worker(
    spec: Arc<ConsumerSpec>,
    factory: ConnectionFactory,
    phase: Arc<RwLock<WorkerPhase>>,
    resolved_queue: Arc<RwLock<String>>,
    stop_token: CancellationToken,
) {
    *phase.write() = WorkerPhase::Starting;

    let (connection, channel, bound_queue) = match connect_and_setup(&spec, &factory).await {
        Ok(v) => v,
        Err(err) => {
            spec.on_error.on_error(&spec.name, &err);
            *phase.write() = WorkerPhase::Dead;
            return;
        }
    };

    *resolved_queue.write() = bound_queue.clone();
    *phase.write() = WorkerPhase::Consuming;
    info!(worker = %spec.name, queue = %bound_queue, "consumer_started");

    let outcome = consume_loop(&spec, &channel, &bound_queue, &phase, &stop_token).await;

    let _ = channel.close(200, "worker stopping").await;
    let _ = connection.close(200, "worker stopping").await;

    match outcome {
        ConsumeOutcome::StoppedByCaller => {
            *phase.write() = WorkerPhase::Terminated;
            info!(worker = %spec.name, "consumer_stopped");
        }
        ConsumeOutcome::ChannelClosed(err) | ConsumeOutcome::Fatal(err) => {
            spec.on_error.on_error(&spec.name, &err);
            *phase.write() = WorkerPhase::Dead;
        }
    }
}

async fn connect_and_setup(
    spec: &ConsumerSpec,
    factory: &ConnectionFactory,
) -> Result<(Connection, Channel, String)> {
    let connection = factory.connect(&spec.vhost).await?;
    let channel = connection.create_channel().await?;
    let bound_queue = setup_topology(&channel, spec).await?;
    Ok((connection, channel, bound_queue))
}

/// Declares/binds topology for one consumer (spec.md §4.D steps 2-4),
/// shared verbatim by both callback dispatch flavors (spec.md §9 factoring
/// note). Returns the queue actually bound (server-assigned if `spec.queue`
/// is empty).
async fn setup_topology(channel: &Channel, spec: &ConsumerSpec) -> Result<String> {
    channel
        .basic_qos(spec.prefetch, BasicQosOptions::default())
        .await?;

    if spec.queue_reset && !spec.queue.is_empty() {
        channel
            .queue_delete(&spec.queue, QueueDeleteOptions::default())
            .await?;
    }

    let queue = channel
        .queue_declare(
            &spec.queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: spec.queue_exclusive,
                auto_delete: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await?;
    let bound_queue = queue.name().to_string();

    if !spec.exchange.is_empty() {
        if spec.exchange_reset {
            channel
                .exchange_delete(&spec.exchange, ExchangeDeleteOptions::default())
                .await?;
        }
        channel
            .exchange_declare(
                &spec.exchange,
                spec.exchange_type.as_lapin(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        let routing_key = if spec.exchange_type == ExchangeKindSpec::Fanout {
            ""
        } else {
            bound_queue.as_str()
        };
        channel
            .queue_bind(
                &bound_queue,
                &spec.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(bound_queue)
}

enum ConsumeOutcome {
    StoppedByCaller,
    ChannelClosed(ConnectorError),
    Fatal(ConnectorError),
}

async fn consume_loop(
    spec: &ConsumerSpec,
    channel: &Channel,
    queue: &str,
    phase: &RwLock<WorkerPhase>,
    stop_token: &CancellationToken,
) -> ConsumeOutcome {
    let mut consumer = match channel
        .basic_consume(
            queue,
            &format!("worker-{}", spec.name),
            BasicConsumeOptions {
                no_local: false,
                no_ack: spec.auto_ack,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(c) => c,
        Err(err) => return ConsumeOutcome::Fatal(ConnectorError::Amqp(err)),
    };

    loop {
        tokio::select! {
            _ = stop_token.cancelled() => {
                *phase.write() = WorkerPhase::Stopping;
                return ConsumeOutcome::StoppedByCaller;
            }
            next = consumer.next() => {
                match next {
                    Some(Ok(delivery)) => dispatch(spec, channel, delivery).await,
                    Some(Err(err)) => return ConsumeOutcome::ChannelClosed(ConnectorError::Amqp(err)),
                    None => {
                        return ConsumeOutcome::ChannelClosed(ConnectorError::ChannelClosed(
                            format!("consumer stream ended for queue {queue}"),
                        ));
                    }
                }
            }
        }
    }
}

async fn dispatch(spec: &ConsumerSpec, channel: &Channel, delivery: Delivery) {
    let message = Message::from_delivery(&delivery);
    let delivery_tag = message.delivery_tag;

    let outcome: CallbackResult = match &spec.callback {
        ConsumerCallback::Blocking(f) => {
            std::panic::catch_unwind(AssertUnwindSafe(|| f(&message)))
                .unwrap_or_else(|payload| Err(panic_to_error(payload)))
        }
        ConsumerCallback::Async(cb) => AssertUnwindSafe(cb.on_message(&message))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_to_error(payload))),
    };

    if spec.auto_ack {
        if let Err(err) = &outcome {
            spec.on_error.on_error(&spec.name, err.as_ref());
        }
        return;
    }

    match outcome {
        Ok(()) => {
            if let Err(err) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                warn!(worker = %spec.name, %err, delivery_tag, "ack failed");
            }
        }
        Err(err) => {
            spec.on_error.on_error(&spec.name, err.as_ref());
            let ack_result = match spec.ack_on_callback_error {
                AckOnCallbackError::Ack => {
                    channel.basic_ack(delivery_tag, BasicAckOptions::default()).await
                }
                AckOnCallbackError::Nack => {
                    channel
                        .basic_nack(
                            delivery_tag,
                            BasicNackOptions {
                                multiple: false,
                                requeue: false,
                            },
                        )
                        .await
                }
                AckOnCallbackError::Requeue => {
                    channel
                        .basic_nack(
                            delivery_tag,
                            BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            },
                        )
                        .await
                }
            };
            if let Err(err) = ack_result {
                warn!(worker = %spec.name, %err, delivery_tag, "nack failed");
            }
        }
    }
}

fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> Box<dyn std::error::Error + Send + Sync> {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    };
    msg.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_maps_onto_lapin_kinds() {
        assert!(matches!(ExchangeKindSpec::Fanout.as_lapin(), ExchangeKind::Fanout));
        assert!(matches!(ExchangeKindSpec::Direct.as_lapin(), ExchangeKind::Direct));
        assert!(matches!(ExchangeKindSpec::Topic.as_lapin(), ExchangeKind::Topic));
        assert!(matches!(ExchangeKindSpec::Headers.as_lapin(), ExchangeKind::Headers));
    }

    #[test]
    fn panic_with_str_payload_is_captured() {
        let result = std::panic::catch_unwind(|| panic!("boom"));
        let err = panic_to_error(result.unwrap_err());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn consumer_spec_defaults_match_spec() {
        let spec = ConsumerSpec::new(
            "c1",
            "/",
            "q1",
            ConsumerCallback::Blocking(Arc::new(|_m: &Message| Ok(()))),
        );
        assert_eq!(spec.prefetch, DEFAULT_PREFETCH);
        assert_eq!(spec.restart_budget, DEFAULT_RESTART_BUDGET);
        assert_eq!(spec.ack_on_callback_error, AckOnCallbackError::Requeue);
        assert!(!spec.queue_exclusive);
    }

    #[test]
    fn worker_phase_alive_and_consuming_predicates() {
        let phase = Arc::new(RwLock::new(WorkerPhase::Consuming));
        let handle_phase = *phase.read();
        assert_eq!(handle_phase, WorkerPhase::Consuming);
    }
}
