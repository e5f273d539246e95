//! Demo binary: publishes one message through the Publisher API, matching
//! the shape of `rabbitmq-publisher/src/main.rs`'s standalone publisher
//! binary.

use mq_connector::{ConnectionFactory, ExchangeKindSpec, FieldValue, MqConfigRecord, Record, ResolvedMq};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "publish_demo=info,mq_connector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service_name = std::env::var("SERVICE_NAME").unwrap_or_else(|_| "publish-demo".to_string());
    let vhost = std::env::var("MQ_VHOST").unwrap_or_else(|_| "/".to_string());
    let queue = std::env::var("MQ_QUEUE").unwrap_or_else(|_| "demo-queue".to_string());

    let config_json: serde_json::Value = match std::env::var("MQ_CONFIG_JSON") {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => serde_json::json!({}),
    };
    let config_record = MqConfigRecord::from_value(&config_json)
        .map_err(|err| anyhow::anyhow!("failed to interpret MQ_CONFIG_JSON: {err}"))?;
    let mq = ResolvedMq::resolve(&config_record, &service_name);
    let factory = ConnectionFactory::new(mq);

    let mut data = Record::new();
    data.insert(
        "greeting".to_string(),
        FieldValue::Text("hello from publish-demo".to_string()),
    );

    let message_id = mq_connector::publisher::emit(
        &factory,
        &vhost,
        &data,
        "",
        &queue,
        ExchangeKindSpec::Direct,
        4_000,
    )
    .await?;

    tracing::info!(%message_id, %queue, "published demo message");
    Ok(())
}
