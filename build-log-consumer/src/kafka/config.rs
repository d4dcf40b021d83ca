use std::time::Duration;

use rdkafka::ClientConfig;

/// Connection and group settings for the build log consumer, detached from
/// the process environment so it can be built by hand in tests.
#[derive(Debug, Clone)]
pub struct GroupConsumerConfig {
    pub kafka_hosts: String,
    pub group_id: String,
    pub topic: String,
    pub client_id: Option<String>,
    pub tls: bool,
    pub ssl_ca_location: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub offset_reset: String,
    pub auto_commit_interval_ms: u32,
    /// Wait between a failed session and the next group join.
    pub rejoin_backoff: Duration,
}

impl GroupConsumerConfig {
    pub fn new(kafka_hosts: &str, group_id: &str, topic: &str) -> Self {
        Self {
            kafka_hosts: kafka_hosts.to_string(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            client_id: None,
            tls: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            offset_reset: "earliest".to_string(),
            auto_commit_interval_ms: 5000,
            rejoin_backoff: Duration::from_secs(1),
        }
    }

    /// rdkafka settings for the group consumer.
    ///
    /// Offsets are stored by hand once a message has been processed, and the
    /// stored offsets are committed by librdkafka's background timer.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("group.id", &self.group_id)
            .set("partition.assignment.strategy", "range")
            .set("auto.offset.reset", &self.offset_reset)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.auto_commit_interval_ms.to_string(),
            )
            .set("socket.timeout.ms", "30000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000");

        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }

        let sasl = match (&self.sasl_username, &self.sasl_password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        };

        if self.tls {
            let protocol = if sasl.is_some() { "sasl_ssl" } else { "ssl" };
            config.set("security.protocol", protocol);
            match &self.ssl_ca_location {
                Some(ca) => {
                    config.set("ssl.ca.location", ca);
                }
                None => {
                    config.set("enable.ssl.certificate.verification", "false");
                }
            }
        } else if sasl.is_some() {
            config.set("security.protocol", "sasl_plaintext");
        }

        if let Some((username, password)) = sasl {
            config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GroupConsumerConfig {
        GroupConsumerConfig::new("kafka:9092", "build-log-consumer", "build-logs")
    }

    #[test]
    fn test_group_defaults() {
        let config = base().client_config();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("build-log-consumer"));
        assert_eq!(config.get("partition.assignment.strategy"), Some("range"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("5000"));
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("client.id"), None);
    }

    #[test]
    fn test_tls_with_ca_and_sasl() {
        let config = GroupConsumerConfig {
            tls: true,
            ssl_ca_location: Some("/etc/kafka/ca.pem".to_string()),
            sasl_username: Some("builder".to_string()),
            sasl_password: Some("hunter2".to_string()),
            client_id: Some("ingest-1".to_string()),
            ..base()
        }
        .client_config();

        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("ssl.ca.location"), Some("/etc/kafka/ca.pem"));
        assert_eq!(config.get("enable.ssl.certificate.verification"), None);
        assert_eq!(config.get("sasl.mechanisms"), Some("PLAIN"));
        assert_eq!(config.get("sasl.username"), Some("builder"));
        assert_eq!(config.get("sasl.password"), Some("hunter2"));
        assert_eq!(config.get("client.id"), Some("ingest-1"));
    }

    #[test]
    fn test_tls_without_ca_skips_verification() {
        let config = GroupConsumerConfig { tls: true, ..base() }.client_config();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(
            config.get("enable.ssl.certificate.verification"),
            Some("false")
        );
        assert_eq!(config.get("sasl.mechanisms"), None);
    }

    #[test]
    fn test_sasl_needs_both_credentials() {
        let config = GroupConsumerConfig {
            sasl_username: Some("builder".to_string()),
            ..base()
        }
        .client_config();

        assert_eq!(config.get("sasl.username"), None);
        assert_eq!(config.get("security.protocol"), None);
    }
}
