//! Demo binary: registers one consumer and runs the connector's full
//! subsystem trio (consumer, heartbeat, supervisor), matching the shape of
//! `rabbitmq-subscriber/src/main.rs`'s standalone subscriber binary.

use std::sync::Arc;

use mq_connector::{
    AckOnCallbackError, ConsumerCallback, ConsumerSpec, Message, MqConfigRecord, Orchestrator,
    ResolvedMq,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consumer_demo=info,mq_connector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service_name = std::env::var("SERVICE_NAME").unwrap_or_else(|_| "consumer-demo".to_string());
    let vhost = std::env::var("MQ_VHOST").unwrap_or_else(|_| "/".to_string());
    let queue = std::env::var("MQ_QUEUE").unwrap_or_else(|_| "demo-queue".to_string());

    let config_json: serde_json::Value = match std::env::var("MQ_CONFIG_JSON") {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => serde_json::json!({}),
    };
    let config_record = MqConfigRecord::from_value(&config_json)
        .map_err(|err| anyhow::anyhow!("failed to interpret MQ_CONFIG_JSON: {err}"))?;
    let mq = ResolvedMq::resolve(&config_record, &service_name);

    let mut orchestrator = Orchestrator::new(mq, service_name.clone(), &vhost);
    let bound_vhost = orchestrator.vhost().to_string();

    let spec = ConsumerSpec::new(
        "demo-consumer",
        bound_vhost,
        queue,
        ConsumerCallback::Blocking(Arc::new(|message: &Message| {
            tracing::info!(
                routing_key = %message.routing_key,
                bytes = message.body.len(),
                "received delivery"
            );
            Ok(())
        })),
    )
    .with_ack_on_callback_error(AckOnCallbackError::Requeue);

    orchestrator.register(spec, false).await?;
    orchestrator.run(true, true, true, 30).await?;

    tracing::info!("consumer-demo running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    orchestrator.stop().await?;
    Ok(())
}
