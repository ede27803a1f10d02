//! Delivery loop shared by every receiver.
//!
//! A received message is handed to the handler on a fresh copy each
//! attempt so a failed attempt never leaks header mutations into the
//! retry or into the poison queue.

use tokio::sync::watch;
use tracing::debug;

use super::{ErrorContext, ErrorHandleResult, MessageEnvelope, MessageHandler};

/// What the receiver should do with the native message afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed or handled by the error policy: acknowledge.
    Completed,
    /// The receiver is stopping during a retry delay: give it back to the
    /// broker unacknowledged.
    Abandoned,
}

/// Run the handler for one message until it succeeds, the error policy
/// handles it, or `stop` fires while waiting to retry.
pub async fn deliver(
    handler: &dyn MessageHandler,
    received: MessageEnvelope,
    stop: &mut watch::Receiver<bool>,
) -> DeliveryOutcome {
    let mut failures = received.immediate_failures;

    loop {
        let mut attempt = received.clone();
        attempt.immediate_failures = failures;

        let error = match handler.on_message(&mut attempt).await {
            Ok(()) => return DeliveryOutcome::Completed,
            Err(e) => e,
        };

        failures += 1;
        let mut pristine = received.clone();
        pristine.immediate_failures = failures;

        let decision = handler
            .on_error(ErrorContext {
                envelope: &pristine,
                error: &error,
            })
            .await;

        match decision {
            ErrorHandleResult::Handled => return DeliveryOutcome::Completed,
            ErrorHandleResult::RetryRequired { delay } => {
                debug!(
                    native_id = %received.native_message_id,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying message"
                );
                if *stop.borrow() {
                    return DeliveryOutcome::Abandoned;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => return DeliveryOutcome::Abandoned,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Headers;
    use crate::error::{BridgeError, ConversionError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails a fixed number of times, then succeeds.
    struct FlakyHandler {
        fail_times: u32,
        calls: AtomicU32,
        seen_failures: Mutex<Vec<u32>>,
        retry_until: u32,
    }

    impl FlakyHandler {
        fn new(fail_times: u32, retry_until: u32) -> Self {
            Self {
                fail_times,
                calls: AtomicU32::new(0),
                seen_failures: Mutex::new(Vec::new()),
                retry_until,
            }
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn on_message(&self, envelope: &mut MessageEnvelope) -> Result<(), BridgeError> {
            envelope.headers.insert("mutated".to_string(), "yes".to_string());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(ConversionError::InvalidFormat("boom".to_string()).into())
            } else {
                Ok(())
            }
        }

        async fn on_error(&self, context: ErrorContext<'_>) -> ErrorHandleResult {
            assert!(!context.envelope.headers.contains_key("mutated"));
            self.seen_failures
                .lock()
                .unwrap()
                .push(context.envelope.immediate_failures);
            if context.envelope.immediate_failures >= self.retry_until {
                ErrorHandleResult::Handled
            } else {
                ErrorHandleResult::RetryRequired {
                    delay: Duration::from_millis(1),
                }
            }
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new("native-1", Headers::new(), b"body".to_vec(), "orders_error")
    }

    #[tokio::test]
    async fn test_deliver_succeeds_after_retries() {
        let handler = FlakyHandler::new(2, 10);
        let (_tx, mut stop) = watch::channel(false);

        let outcome = deliver(&handler, envelope(), &mut stop).await;

        assert_eq!(outcome, DeliveryOutcome::Completed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*handler.seen_failures.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_deliver_stops_when_handled() {
        let handler = FlakyHandler::new(u32::MAX, 3);
        let (_tx, mut stop) = watch::channel(false);

        let outcome = deliver(&handler, envelope(), &mut stop).await;

        assert_eq!(outcome, DeliveryOutcome::Completed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deliver_abandons_on_stop() {
        let handler = FlakyHandler::new(u32::MAX, u32::MAX);
        let (tx, mut stop) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = deliver(&handler, envelope(), &mut stop).await;

        assert_eq!(outcome, DeliveryOutcome::Abandoned);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
