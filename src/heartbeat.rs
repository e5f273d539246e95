//! Heartbeat Publisher (spec §4.G): a periodic task announcing service
//! liveness to `<service_name>_sync` on the current vhost, matching
//! `MQConnector.sync()` in `original_source/neon_mq_connector/connector.py`.
//! Failures are retried via the Retry Policy; once retries are exhausted the
//! heartbeat stops itself without affecting the rest of the service
//! (spec.md §7 propagation policy).

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{FieldValue, Record};
use crate::connection::ConnectionFactory;
use crate::envelope::ConnectorId;
use crate::error::ConnectorError;
use crate::publisher;
use crate::retry;
use crate::worker::ExchangeKindSpec;

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(10);
const HEARTBEAT_EXPIRATION_MS: u64 = 5_000;
const HEARTBEAT_RETRY_ATTEMPTS: u32 = 3;
const HEARTBEAT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub struct Heartbeat {
    stop_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        factory: ConnectionFactory,
        vhost: String,
        service_name: String,
        service_id: ConnectorId,
        sync_period: Duration,
    ) -> Self {
        let stop_token = CancellationToken::new();
        let token = stop_token.clone();
        let destination = format!("{service_name}_sync");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("heartbeat_stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if !tick(&factory, &vhost, &destination, service_id).await {
                            warn!(destination = %destination, "heartbeat retries exhausted, stopping heartbeat");
                            return;
                        }
                    }
                }
            }
        });

        Self { stop_token, task }
    }

    /// Cancels the heartbeat and joins its task (spec.md §5 cancellation
    /// contract: immediate after the current tick).
    pub async fn stop(self) {
        self.stop_token.cancel();
        let _ = self.task.await;
    }
}

/// Converts a successful publish into a `bool` result for `retry::retry`'s
/// `R: From<T>` bound, since the heartbeat only cares whether the tick
/// ultimately succeeded.
struct TickOutcome(bool);

impl From<ConnectorId> for TickOutcome {
    fn from(_: ConnectorId) -> Self {
        TickOutcome(true)
    }
}

async fn tick(factory: &ConnectionFactory, vhost: &str, destination: &str, service_id: ConnectorId) -> bool {
    let outcome: TickOutcome = retry::retry(
        || async {
            let mut fields = Record::new();
            fields.insert(
                "service_id".to_string(),
                FieldValue::Text(service_id.to_string()),
            );
            fields.insert("time".to_string(), FieldValue::Int(now_unix_secs()));
            publisher::emit(
                factory,
                vhost,
                &fields,
                "",
                destination,
                ExchangeKindSpec::Direct,
                HEARTBEAT_EXPIRATION_MS,
            )
            .await
        },
        HEARTBEAT_RETRY_ATTEMPTS,
        HEARTBEAT_RETRY_BACKOFF,
        |err: &ConnectorError| warn!(%err, "heartbeat publish attempt failed"),
        || TickOutcome(false),
    )
    .await;
    outcome.0
}

fn now_unix_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedMq;
    use uuid::Uuid;

    #[test]
    fn now_unix_secs_is_a_plausible_recent_timestamp() {
        assert!(now_unix_secs() > 1_700_000_000);
    }

    #[tokio::test]
    async fn spawn_and_stop_is_clean_without_a_reachable_broker() {
        let factory = ConnectionFactory::new(ResolvedMq {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "guest".to_string(),
            password: "guest".to_string(),
        });
        let heartbeat = Heartbeat::spawn(
            factory,
            "/".to_string(),
            "demo".to_string(),
            Uuid::new_v4(),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        heartbeat.stop().await;
    }
}
