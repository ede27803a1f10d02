//! Mock dispatcher for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MessageDispatcher, Result, TransportError, TransportOperation};

/// Records dispatched operations instead of sending them.
#[derive(Default)]
pub struct MockDispatcher {
    dispatched: RwLock<Vec<TransportOperation>>,
    fail_on_dispatch: RwLock<bool>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_dispatch(&self, fail: bool) {
        *self.fail_on_dispatch.write().await = fail;
    }

    pub async fn dispatched_count(&self) -> usize {
        self.dispatched.read().await.len()
    }

    pub async fn dispatched(&self) -> Vec<TransportOperation> {
        self.dispatched.read().await.clone()
    }

    pub async fn take_dispatched(&self) -> Vec<TransportOperation> {
        std::mem::take(&mut *self.dispatched.write().await)
    }
}

#[async_trait]
impl MessageDispatcher for MockDispatcher {
    async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<()> {
        if *self.fail_on_dispatch.read().await {
            let destination = operations
                .first()
                .map(|op| op.destination.clone())
                .unwrap_or_default();
            return Err(TransportError::Dispatch {
                destination,
                message: "Mock dispatch failure".to_string(),
            });
        }
        self.dispatched.write().await.extend(operations);
        Ok(())
    }
}
