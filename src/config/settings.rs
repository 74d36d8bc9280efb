use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{self, PushConfig};

/// Top-level configuration settings for the application.
///
/// Includes broker tuning, logging and the topics to pre-provision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
    pub topics: Vec<TopicDefinition>,
}

/// Configuration settings for the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Smallest ack deadline subscriptions may request. At least 1.
    pub min_ack_deadline_secs: u64,
    /// Zero keeps streaming pulls open indefinitely.
    pub stream_timeout_secs: u64,
}

impl BrokerSettings {
    pub fn min_ack_deadline(&self) -> Duration {
        Duration::from_secs(self.min_ack_deadline_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

/// A topic to create at startup, with its subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDefinition {
    pub name: String,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionDefinition {
    pub name: String,
    /// Push endpoint. Recorded on the subscription only.
    pub endpoint: String,
    /// Zero uses the broker default.
    pub ack_deadline_seconds: i32,
    pub retain_acked_messages: bool,
    pub message_retention_secs: Option<u64>,
}

impl SubscriptionDefinition {
    pub fn to_subscription(&self, topic: &str) -> protocol::Subscription {
        protocol::Subscription {
            push_config: (!self.endpoint.is_empty()).then(|| PushConfig {
                push_endpoint: self.endpoint.clone(),
                ..Default::default()
            }),
            ack_deadline_seconds: self.ack_deadline_seconds,
            retain_acked_messages: self.retain_acked_messages,
            message_retention_duration: self.message_retention_secs.map(Duration::from_secs),
            ..protocol::Subscription::new(self.name.clone(), topic)
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub topics: Option<Vec<TopicDefinition>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub min_ack_deadline_secs: Option<u64>,
    pub stream_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                min_ack_deadline_secs: 10,
                stream_timeout_secs: 0,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            topics: Vec::new(),
        }
    }
}

impl PartialSettings {
    /// Overlays whatever was provided onto the defaults.
    pub fn merge(self) -> Settings {
        let default = Settings::default();
        Settings {
            broker: BrokerSettings {
                min_ack_deadline_secs: self
                    .broker
                    .as_ref()
                    .and_then(|b| b.min_ack_deadline_secs)
                    .unwrap_or(default.broker.min_ack_deadline_secs),
                stream_timeout_secs: self
                    .broker
                    .as_ref()
                    .and_then(|b| b.stream_timeout_secs)
                    .unwrap_or(default.broker.stream_timeout_secs),
            },
            logging: LoggingSettings {
                level: self
                    .logging
                    .and_then(|l| l.level)
                    .unwrap_or(default.logging.level),
            },
            topics: self.topics.unwrap_or(default.topics),
        }
    }
}
