//! Core of a service-side AMQP 0-9-1 messaging connector: a named consumer
//! registry, supervised consumer workers, a heartbeat publisher, publish
//! helpers, and a request/reply client built on top of those.

pub mod codec;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod supervisor;
pub mod worker;

pub use codec::{FieldValue, Record};
pub use config::{Credentials, MqConfigRecord, ResolvedMq};
pub use connection::ConnectionFactory;
pub use envelope::{ConnectorId, ServiceEnvelope};
pub use error::{ConnectorError, Result};
pub use heartbeat::Heartbeat;
pub use orchestrator::Orchestrator;
pub use registry::Registry;
pub use supervisor::Supervisor;
pub use worker::{
    AckOnCallbackError, AsyncConsumerCallback, ConsumerCallback, ConsumerSpec, ErrorSink,
    ExchangeKindSpec, Message, TracingErrorSink, WorkerHandle, WorkerPhase,
};
