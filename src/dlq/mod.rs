//! Poison queue handling.
//!
//! Messages that cannot be translated, or whose dispatch keeps failing past
//! the retry budget, are moved unmodified to `<return queue>.poison`.
//!
//! ## Decision
//!
//! - Conversion failure: poison immediately (translation is deterministic)
//! - Any other failure: retry with backoff while `failures <= max_retries`,
//!   then poison

use std::time::Duration;

use tracing::{error, warn};

use crate::bus::{MessageEnvelope, OutgoingMessage, TransportOperation, PROPERTY_MESSAGE_ID};
use crate::error::BridgeError;
use crate::utils::retry::RetryConfig;

/// What to do with a message after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry { delay: Duration },
    Poison,
}

/// Decides between retry and poison for failed messages.
#[derive(Debug, Clone)]
pub struct PoisonPolicy {
    retry: RetryConfig,
}

impl PoisonPolicy {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Classify a failure for a message that has now failed `failures` times.
    pub fn decide(&self, error: &BridgeError, failures: u32) -> RecoveryAction {
        if error.is_conversion_failure() {
            error!(
                failures,
                error = %error,
                "Message cannot be converted, moving to poison queue"
            );
            return RecoveryAction::Poison;
        }

        if !self.retry.should_retry(failures) {
            error!(
                failures,
                max_retries = self.retry.max_retries,
                error = %error,
                "Retries exhausted, moving to poison queue"
            );
            return RecoveryAction::Poison;
        }

        let delay = self.retry.delay_for_failure(failures);
        warn!(
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Message processing failed, retrying"
        );
        RecoveryAction::Retry { delay }
    }
}

/// Send the received message, headers and body untouched, to the poison queue.
pub fn poison_operation(envelope: &MessageEnvelope, poison_queue: &str) -> TransportOperation {
    TransportOperation::new(
        poison_queue,
        OutgoingMessage {
            message_id: envelope.native_message_id.clone(),
            headers: envelope.headers.clone(),
            body: envelope.body.clone(),
        },
    )
    .with_property(PROPERTY_MESSAGE_ID, envelope.native_message_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Headers, TransportError};
    use crate::error::ConversionError;

    fn policy(max_retries: u32) -> PoisonPolicy {
        PoisonPolicy::new(RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_retries,
            jitter: 0.0,
        })
    }

    fn transport_error() -> BridgeError {
        TransportError::Dispatch {
            destination: "error".to_string(),
            message: "broker unavailable".to_string(),
        }
        .into()
    }

    #[test]
    fn test_conversion_failure_is_poisoned_immediately() {
        let error: BridgeError = ConversionError::InvalidFormat("no marker".to_string()).into();
        assert_eq!(policy(15).decide(&error, 1), RecoveryAction::Poison);
    }

    #[test]
    fn test_transport_failure_is_retried_with_backoff() {
        assert_eq!(
            policy(15).decide(&transport_error(), 1),
            RecoveryAction::Retry {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            policy(15).decide(&transport_error(), 3),
            RecoveryAction::Retry {
                delay: Duration::from_millis(40)
            }
        );
    }

    #[test]
    fn test_poison_threshold() {
        let policy = policy(15);
        assert!(matches!(
            policy.decide(&transport_error(), 15),
            RecoveryAction::Retry { .. }
        ));
        assert_eq!(policy.decide(&transport_error(), 16), RecoveryAction::Poison);
    }

    #[test]
    fn test_poison_operation_keeps_message_untouched() {
        let mut headers = Headers::new();
        headers.insert("MT-Reason".to_string(), "fault".to_string());
        let envelope = MessageEnvelope::new("native-7", headers.clone(), b"raw".to_vec(), "orders_error");

        let operation = poison_operation(&envelope, "Retry.Return.poison");

        assert_eq!(operation.destination, "Retry.Return.poison");
        assert_eq!(operation.message.headers, headers);
        assert_eq!(operation.message.body.as_ref(), b"raw");
        assert_eq!(operation.native_message_id(), "native-7");
    }
}
