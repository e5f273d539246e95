use thiserror::Error;

/// Error taxonomy for the connector core (spec §7).
///
/// `BrokerUnavailable` and `ChannelClosed` are recovered locally by retry/
/// supervisor up to their budgets; everything else is surfaced to the
/// caller that triggered it.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    #[error("invalid publish request: {0}")]
    InvalidRequest(String),

    #[error("broker rejected vhost {vhost:?}: {reason}")]
    InvalidVhost { vhost: String, reason: String },

    #[error("broker unavailable at {host}:{port}: {reason}")]
    BrokerUnavailable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("channel closed by broker: {0}")]
    ChannelClosed(String),

    #[error("callback failed: {0}")]
    CallbackFailure(String),

    #[error("worker {name:?} did not stop within {timeout_secs}s")]
    JoinTimeout { name: String, timeout_secs: u64 },

    #[error("consumer {name:?} exceeded restart budget ({budget})")]
    RestartBudgetExceeded { name: String, budget: u32 },

    #[error("timed out waiting for reply after {0}s")]
    Timeout(u64),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Codec-specific failures, kept distinct from `ConnectorError::Codec` so
/// `src/codec.rs` has no dependency on the broker-facing error type.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid record json: {0}")]
    Json(#[from] serde_json::Error),
}
