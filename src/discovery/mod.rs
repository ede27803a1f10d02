//! Queue discovery.
//!
//! Provides the interfaces the bridge uses to find MassTransit error queues:
//! - `QueueInformationProvider`: enumerate queue names, check existence
//! - `QueueLengthProvider`: message count of a queue
//! - `QueueFilter`: which enumerated names are error queues to bridge
//!
//! Implementations:
//! - In-memory broker (`bus::channel`)
//! - RabbitMQ management API (`rabbitmq`, amqp feature)
//! - SQS `ListQueues` (`bus::sqs`, sqs feature)
//! - Plain text file (`file`)

mod file;
#[cfg(feature = "amqp")]
mod rabbitmq;

pub use file::FileQueueInformationProvider;
#[cfg(feature = "amqp")]
pub use rabbitmq::RabbitMqManagementClient;

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use regex::Regex;

use crate::config::BridgeConfig;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur while discovering queues.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Queue listing request failed: {0}")]
    Request(String),

    #[error("Unexpected queue listing response: {0}")]
    Response(String),

    #[error("Failed to read queue file '{path}': {message}")]
    File { path: String, message: String },

    #[error("Queue discovery is not configured: {0}")]
    Config(String),
}

/// Lists the queues of a broker.
#[async_trait]
pub trait QueueInformationProvider: Send + Sync {
    /// Lazily enumerate queue names. Each call queries the source again.
    fn queues(&self) -> BoxStream<'_, Result<String>>;

    /// Whether a queue with this name currently exists.
    async fn exists(&self, name: &str) -> Result<bool>;
}

/// Reports how many messages a queue holds.
#[async_trait]
pub trait QueueLengthProvider: Send + Sync {
    async fn length(&self, name: &str) -> Result<u64>;
}

/// Suffixes MassTransit uses for its error queues.
pub const ERROR_QUEUE_SUFFIXES: &[&str] = &["_error", "_skipped"];

/// Whether a queue name follows the MassTransit error queue convention.
pub fn is_error_queue_name(name: &str) -> bool {
    ERROR_QUEUE_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Selects the queues the bridge should ingest.
///
/// Without a pattern the MassTransit naming convention applies. Excluded
/// names never match, whatever the pattern says.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pattern: Option<Regex>,
    excluded: BTreeSet<String>,
}

impl QueueFilter {
    /// Match `_error` and `_skipped` queues.
    pub fn error_queue_convention() -> Self {
        Self::default()
    }

    /// Match queues against a regular expression.
    pub fn from_pattern(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: Some(Regex::new(pattern)?),
            excluded: BTreeSet::new(),
        })
    }

    /// Filter for the bridge: the configured pattern (or the convention)
    /// minus the bridge's own queues.
    pub fn from_config(config: &BridgeConfig) -> std::result::Result<Self, regex::Error> {
        let filter = match &config.queue_filter {
            Some(pattern) => Self::from_pattern(pattern)?,
            None => Self::error_queue_convention(),
        };
        Ok(filter.excluding([
            config.error_queue.clone(),
            config.return_queue.clone(),
            config.poison_queue(),
            config.control_queue.clone(),
        ]))
    }

    pub fn excluding<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn is_match(&self, name: &str) -> bool {
        if self.excluded.contains(name) {
            return false;
        }
        match &self.pattern {
            Some(pattern) => pattern.is_match(name),
            None => is_error_queue_name(name),
        }
    }
}

/// Enumerate the provider and keep the names the filter accepts.
pub async fn discover(
    provider: &dyn QueueInformationProvider,
    filter: &QueueFilter,
) -> Result<BTreeSet<String>> {
    provider
        .queues()
        .try_filter(|name| futures::future::ready(filter.is_match(name)))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};

    struct StaticQueues(Vec<&'static str>);

    #[async_trait]
    impl QueueInformationProvider for StaticQueues {
        fn queues(&self) -> BoxStream<'_, Result<String>> {
            stream::iter(self.0.iter().map(|q| Ok(q.to_string()))).boxed()
        }

        async fn exists(&self, name: &str) -> Result<bool> {
            Ok(self.0.iter().any(|q| *q == name))
        }
    }

    #[test]
    fn test_user_filter() {
        let cases = [
            ("^This", true),
            ("Is", true),
            ("Test$", true),
            ("^Test", false),
            ("Development", false),
            ("This$", false),
        ];
        for (pattern, expected) in cases {
            let filter = QueueFilter::from_pattern(pattern).unwrap();
            assert_eq!(filter.is_match("ThisIsATest"), expected, "pattern {}", pattern);
        }
    }

    #[test]
    fn test_error_queue_convention() {
        let filter = QueueFilter::error_queue_convention();
        assert!(filter.is_match("orders_error"));
        assert!(filter.is_match("orders_skipped"));
        assert!(!filter.is_match("orders"));
        assert!(!filter.is_match("orders_error_archive"));
    }

    #[test]
    fn test_bridge_queues_are_excluded() {
        let config = BridgeConfig {
            queue_filter: Some(".*".to_string()),
            ..BridgeConfig::new("Retry.Return")
        };
        let filter = QueueFilter::from_config(&config).unwrap();

        assert!(filter.is_match("orders_error"));
        assert!(!filter.is_match("error"));
        assert!(!filter.is_match("Retry.Return"));
        assert!(!filter.is_match("Retry.Return.poison"));
        assert!(!filter.is_match("Particular.ServiceControl"));
    }

    #[tokio::test]
    async fn test_discover_applies_filter() {
        let provider = StaticQueues(vec!["orders_error", "orders", "billing_skipped", "error"]);
        let found = discover(&provider, &QueueFilter::error_queue_convention())
            .await
            .unwrap();

        assert_eq!(
            found,
            BTreeSet::from(["billing_skipped".to_string(), "orders_error".to_string()])
        );
    }
}
