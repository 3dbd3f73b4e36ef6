use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::config::ConsumerConfigBuilder;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-pipeline")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_client_id: Option<String>,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    // Pipeline configuration: an inline policy string, e.g.
    // "topic: events, buffer: 100, batch(50, 1000), retry(3, 200), commit() => log"
    #[envconfig(default = "topic: events, commit() => log")]
    pub pipeline_policy: String,

    #[envconfig(default = "5000")]
    pub offset_query_timeout_ms: u64,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Timeout for topic lookups and the offset queries run at assignment
    pub fn offset_query_timeout(&self) -> Duration {
        Duration::from_millis(self.offset_query_timeout_ms)
    }

    /// rdkafka client config shared by every subscription's consumer
    pub fn consumer_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_client_id(self.kafka_client_id.as_deref())
            .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms)
            .build()
    }
}
