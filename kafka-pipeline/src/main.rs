use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kafka_pipeline::config::Config;
use kafka_pipeline::kafka::KafkaTransportFactory;
use kafka_pipeline::pipelines::handler_fn;
use kafka_pipeline::subscription::{PayloadDecoder, SubscriptionManager, Utf8Decoder};
use kafka_pipeline::Message;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
        .add_directive("rdkafka=warn".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Kafka pipeline service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let factory = Arc::new(KafkaTransportFactory::new(config.consumer_config()));
    let manager =
        SubscriptionManager::new(factory).with_query_timeout(config.offset_query_timeout());

    manager.registry().register_message::<String>(
        "log",
        Arc::new(handler_fn(|message: Message<String>| async move {
            info!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                key = message.key(),
                value = %message.value(),
                "Received message"
            );
            Ok(())
        })),
    );

    let decoder: Arc<dyn PayloadDecoder<String>> = Arc::new(Utf8Decoder);
    let subscription = manager
        .subscribe_inline(&config.pipeline_policy, decoder)
        .await
        .with_context(|| format!("Failed to subscribe with policy {:?}", config.pipeline_policy))?;

    let Some(subscription) = subscription else {
        info!("Pipeline disabled by state policy, nothing to do");
        return Ok(());
    };
    info!(topic = subscription.topic(), "Pipeline running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if !manager.shutdown(config.shutdown_timeout()).await {
        warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Pipelines did not drain before the shutdown timeout"
        );
    }

    info!("Kafka pipeline service stopped");
    Ok(())
}
