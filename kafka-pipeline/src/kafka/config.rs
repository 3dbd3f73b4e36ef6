use rdkafka::ClientConfig;

/// rdkafka consumer configuration for pipeline subscriptions.
///
/// Commits are driven by the Commit stage, so auto commit and auto offset store
/// are always off. Partition assignment keeps the eager default strategy: start
/// offsets are seeded by re-assigning inside the rebalance callback, which the
/// cooperative protocol does not allow.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Group consumer with the pipeline defaults.
    ///
    /// Sets: auto.offset.store=false, auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Where to start when a partition has no committed offset and no offset
    /// policy seeds it ("earliest" or "latest").
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        if let Some(client_id) = client_id {
            self.config.set("client.id", client_id);
        }
        self
    }

    /// Set maximum wait time when fetch.min.bytes is not satisfied
    pub fn with_fetch_wait_max_ms(mut self, ms: u32) -> Self {
        self.config.set("fetch.wait.max.ms", ms.to_string());
        self
    }

    /// Set maximum time between poll() calls before consumer leaves group.
    /// A pipeline stalled on backpressure for longer than this loses its partitions.
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_defaults() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "pipelines").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("pipelines"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("partition.assignment.strategy"), None);
    }

    #[test]
    fn test_overrides() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "group")
            .with_tls(true)
            .with_offset_reset("earliest")
            .with_client_id(Some("pipeline-1"))
            .with_fetch_wait_max_ms(50)
            .with_max_poll_interval_ms(600000)
            .set("statistics.interval.ms", "0")
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("client.id"), Some("pipeline-1"));
        assert_eq!(config.get("fetch.wait.max.ms"), Some("50"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("600000"));
        assert_eq!(config.get("statistics.interval.ms"), Some("0"));
    }

    #[test]
    fn test_tls_disabled_sets_nothing() {
        let config = ConsumerConfigBuilder::new("kafka:9092", "group")
            .with_tls(false)
            .with_client_id(None)
            .build();
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("client.id"), None);
    }
}
