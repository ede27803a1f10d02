//! Per-message routing and error policy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::bus::{
    ErrorContext, ErrorHandleResult, MessageDispatcher, MessageEnvelope, MessageHandler,
};
use crate::dlq::{poison_operation, PoisonPolicy, RecoveryAction};
use crate::error::BridgeError;
use crate::translate::adapter::FailureAdapter;

/// Which way a receiver's messages travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// MassTransit error queue to ServiceControl.
    Forward,
    /// ServiceControl retry back to the MassTransit input queue.
    Return,
}

/// Translates, dispatches, and retries or poisons on failure.
pub struct BridgeHandler {
    direction: Direction,
    adapter: FailureAdapter,
    dispatcher: Arc<dyn MessageDispatcher>,
    policy: PoisonPolicy,
    poison_queue: String,
}

impl BridgeHandler {
    pub fn new(
        direction: Direction,
        adapter: FailureAdapter,
        dispatcher: Arc<dyn MessageDispatcher>,
        policy: PoisonPolicy,
        poison_queue: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            adapter,
            dispatcher,
            policy,
            poison_queue: poison_queue.into(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

#[async_trait]
impl MessageHandler for BridgeHandler {
    async fn on_message(&self, envelope: &mut MessageEnvelope) -> Result<(), BridgeError> {
        let operation = match self.direction {
            Direction::Forward => self.adapter.forward_to_target(envelope)?,
            Direction::Return => self.adapter.return_to_source(envelope)?,
        };
        self.dispatcher.dispatch(vec![operation]).await?;
        Ok(())
    }

    async fn on_error(&self, context: ErrorContext<'_>) -> ErrorHandleResult {
        let failures = context.envelope.immediate_failures;
        match self.policy.decide(context.error, failures) {
            RecoveryAction::Retry { delay } => ErrorHandleResult::RetryRequired { delay },
            RecoveryAction::Poison => {
                let operation = poison_operation(context.envelope, &self.poison_queue);
                match self.dispatcher.dispatch(vec![operation]).await {
                    Ok(()) => {
                        warn!(
                            native_id = %context.envelope.native_message_id,
                            queue = %context.envelope.receive_address,
                            poison_queue = %self.poison_queue,
                            failures,
                            "Moved message to poison queue"
                        );
                        ErrorHandleResult::Handled
                    }
                    Err(e) => {
                        error!(
                            native_id = %context.envelope.native_message_id,
                            poison_queue = %self.poison_queue,
                            error = %e,
                            "Failed to move message to poison queue, retrying"
                        );
                        ErrorHandleResult::RetryRequired {
                            delay: self.policy.retry_config().delay_for_failure(failures),
                        }
                    }
                }
            }
        }
    }
}
