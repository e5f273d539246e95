//! Publisher API (spec §4.H): one-shot publish, fanout publish, and a
//! synchronous request/reply helper, all built directly on the Connection
//! Factory for short-lived publish sessions — matching `emit_mq_message`/
//! `publish_message`/`send_message` in
//! `original_source/neon_mq_connector/connector.py`.

use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};

use crate::codec::{self, FieldValue, Record};
use crate::connection::ConnectionFactory;
use crate::envelope::{new_message_id, ConnectorId};
use crate::error::{ConnectorError, Result};
use crate::worker::ExchangeKindSpec;

fn validate_payload(data: &Record) -> Result<()> {
    if data.is_empty() {
        Err(ConnectorError::InvalidRequest(
            "payload record must not be empty".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Publishes `data` over an already-open `channel`, injecting a fresh
/// `message_id` (spec.md invariant 4). (Re)declares `exchange`/`queue` when
/// given, binds with an empty routing key for fanout (spec.md §4.D edge
/// case), and sets the `expiration` property to `expiration_ms` (spec.md §6).
pub async fn publish_on_channel(
    channel: &Channel,
    message_id: ConnectorId,
    data: &Record,
    exchange: &str,
    queue: &str,
    exchange_type: ExchangeKindSpec,
    expiration_ms: u64,
) -> Result<()> {
    validate_payload(data)?;

    let mut record = data.clone();
    record.insert(
        "message_id".to_string(),
        FieldValue::Text(message_id.to_string()),
    );

    if !exchange.is_empty() {
        channel
            .exchange_declare(
                exchange,
                exchange_type.as_lapin(),
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
    }

    if !queue.is_empty() {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await?;

        if exchange_type == ExchangeKindSpec::Fanout {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
    }

    let body = codec::encode(&record);
    let properties = BasicProperties::default().with_expiration(expiration_ms.to_string().into());
    channel
        .basic_publish(exchange, queue, BasicPublishOptions::default(), &body, properties)
        .await?;
    Ok(())
}

/// Opens a short-lived connection on `vhost` and publishes `data`, returning
/// the generated `message_id` (spec.md §4.H `emit`).
pub async fn emit(
    factory: &ConnectionFactory,
    vhost: &str,
    data: &Record,
    exchange: &str,
    queue: &str,
    exchange_type: ExchangeKindSpec,
    expiration_ms: u64,
) -> Result<ConnectorId> {
    validate_payload(data)?;
    let connection = factory.connect(vhost).await?;
    let channel = connection.create_channel().await?;
    let message_id = new_message_id();

    let result =
        publish_on_channel(&channel, message_id, data, exchange, queue, exchange_type, expiration_ms)
            .await;

    let _ = channel.close(200, "publish done").await;
    let _ = connection.close(200, "publish done").await;

    result.map(|()| message_id)
}

/// Thin wrapper over `emit` with `exchange_type=fanout` and an empty queue
/// (spec.md §4.H `publish_fanout`).
pub async fn publish_fanout(
    factory: &ConnectionFactory,
    vhost: &str,
    data: &Record,
    exchange: &str,
    expiration_ms: u64,
) -> Result<ConnectorId> {
    emit(
        factory,
        vhost,
        data,
        exchange,
        "",
        ExchangeKindSpec::Fanout,
        expiration_ms,
    )
    .await
}

/// Resolves `vhost` (falling back to `default_vhost`) and delegates to
/// `emit`/`publish_fanout` (spec.md §4.H `send_message`).
#[allow(clippy::too_many_arguments)]
pub async fn send_message(
    factory: &ConnectionFactory,
    vhost: Option<&str>,
    default_vhost: &str,
    data: &Record,
    exchange: &str,
    queue: &str,
    exchange_type: ExchangeKindSpec,
    expiration_ms: u64,
) -> Result<ConnectorId> {
    let vhost = vhost.unwrap_or(default_vhost);
    if exchange_type == ExchangeKindSpec::Fanout {
        publish_fanout(factory, vhost, data, exchange, expiration_ms).await
    } else {
        emit(factory, vhost, data, exchange, queue, exchange_type, expiration_ms).await
    }
}

/// Synchronous request/reply over pub/sub (spec.md §4.H `request_reply`):
/// publishes `request` to `input_queue` with an embedded `message_id` and
/// `reply_to` (the declared reply queue's name), waits up to `timeout` for a
/// reply on `output_queue` (server-assigned when absent) whose embedded
/// `message_id` matches, and returns it. The responder on `input_queue` is
/// expected to read `reply_to` back out of the decoded request and publish
/// its reply there. A vhost the broker refuses surfaces as `InvalidVhost`
/// rather than `BrokerUnavailable` — this connect is a single attempt, not
/// wrapped in the Connection Factory's retry, since an invalid vhost will
/// never succeed on retry.
pub async fn request_reply(
    factory: &ConnectionFactory,
    vhost: &str,
    request: &Record,
    input_queue: &str,
    output_queue: Option<&str>,
    timeout: Duration,
) -> Result<Record> {
    let url = factory.mq.amqp_url(vhost);
    let connection = Connection::connect(&url, ConnectionProperties::default())
        .await
        .map_err(|err| ConnectorError::InvalidVhost {
            vhost: vhost.to_string(),
            reason: err.to_string(),
        })?;
    let channel = connection.create_channel().await.map_err(|err| ConnectorError::InvalidVhost {
        vhost: vhost.to_string(),
        reason: err.to_string(),
    })?;

    let (queue_name, exclusive) = match output_queue {
        Some(q) => (q.to_string(), false),
        None => (String::new(), true),
    };
    let declared = channel
        .queue_declare(
            &queue_name,
            QueueDeclareOptions {
                durable: false,
                exclusive,
                auto_delete: true,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await?;
    let reply_queue = declared.name().to_string();

    let mut consumer = channel
        .basic_consume(
            &reply_queue,
            "request-reply",
            BasicConsumeOptions {
                no_local: false,
                no_ack: true,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;

    let message_id = new_message_id();
    let mut outgoing = request.clone();
    outgoing.insert(
        "reply_to".to_string(),
        FieldValue::Text(reply_queue.clone()),
    );
    publish_on_channel(
        &channel,
        message_id,
        &outgoing,
        "",
        input_queue,
        ExchangeKindSpec::Direct,
        timeout.as_millis() as u64,
    )
    .await?;
    let expected = message_id.to_string();

    let reply = match tokio::time::timeout(timeout, wait_for_reply(&mut consumer, &expected)).await {
        Ok(result) => result?,
        Err(_) => return Err(ConnectorError::Timeout(timeout.as_secs())),
    };

    let _ = channel.close(200, "request-reply done").await;
    let _ = connection.close(200, "request-reply done").await;

    Ok(reply)
}

async fn wait_for_reply(consumer: &mut Consumer, expected_message_id: &str) -> Result<Record> {
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.map_err(ConnectorError::Amqp)?;
        let record = codec::decode(&delivery.data)?;
        if record.get("message_id").and_then(FieldValue::as_text) == Some(expected_message_id) {
            return Ok(record);
        }
    }
    Err(ConnectorError::ChannelClosed(
        "reply consumer stream ended".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_payload_rejects_empty_record() {
        let err = validate_payload(&Record::new()).unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidRequest(_)));
    }

    #[test]
    fn validate_payload_accepts_non_empty_record() {
        let mut record = Record::new();
        record.insert("data".to_string(), FieldValue::Text("hello".to_string()));
        assert!(validate_payload(&record).is_ok());
    }
}
