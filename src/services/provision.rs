//! Queue provisioning and broker health checks.
//!
//! Provisioning creates the return queue and the poison queue and nothing
//! else. It is safe to run against queues that already exist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{
    CriticalErrorHook, HostSettings, ReceiveSettings, TransportError, TransportFactory,
};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Receiver id of the return queue consumer.
pub const RETURN_RECEIVER_ID: &str = "Return";

/// Creates the bridge's own queues.
pub struct QueueProvisioner {
    return_queue: String,
    poison_queue: String,
    control_queue: String,
    factory: Arc<dyn TransportFactory>,
    hook: Option<CriticalErrorHook>,
}

impl QueueProvisioner {
    pub fn new(config: &BridgeConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            return_queue: config.return_queue.clone(),
            poison_queue: config.poison_queue(),
            control_queue: config.control_queue.clone(),
            factory,
            hook: None,
        }
    }

    /// Also forward critical transport errors to `hook`.
    pub fn with_critical_error_hook(mut self, hook: CriticalErrorHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn return_receiver(&self) -> ReceiveSettings {
        ReceiveSettings::new(RETURN_RECEIVER_ID, &self.return_queue, &self.poison_queue)
    }

    /// Host settings whose critical-error callback flips `failed` and
    /// forwards to the caller's hook.
    fn host_settings(&self, setup: bool, failed: Arc<AtomicBool>) -> HostSettings {
        let forward = self.hook.clone();
        let hook: CriticalErrorHook = Arc::new(move |message: &str, error: &TransportError| {
            error!(error = %error, "Critical error while creating queues: {}", message);
            failed.store(true, Ordering::SeqCst);
            if let Some(forward) = &forward {
                forward(message, error);
            }
        });
        HostSettings::new(format!("Queue creator for {}", self.return_queue), setup)
            .with_critical_error_hook(hook)
    }

    /// Declare the return and poison queues.
    ///
    /// Returns `false` when the broker reported a critical error. Opens no
    /// receivers and sends nothing.
    pub async fn try_provision(&self) -> bool {
        info!(
            return_queue = %self.return_queue,
            poison_queue = %self.poison_queue,
            "Creating queues if they don't already exist"
        );

        let failed = Arc::new(AtomicBool::new(false));
        let host = self.host_settings(true, failed.clone());

        match self
            .factory
            .create(
                host.clone(),
                vec![self.return_receiver()],
                vec![self.poison_queue.clone()],
            )
            .await
        {
            Ok(infrastructure) => {
                if let Err(e) = infrastructure.shutdown().await {
                    warn!(error = %e, "Failed to release provisioning transport");
                }
            }
            Err(e) => host.raise_critical("Queue provisioning failed", &e),
        }

        let succeeded = !failed.load(Ordering::SeqCst);
        if succeeded {
            info!("Queues provisioned");
        }
        succeeded
    }

    /// Connect without creating anything and check that the return queue
    /// can be consumed.
    pub async fn health_check(&self) -> Result<()> {
        let failed = Arc::new(AtomicBool::new(false));
        let host = self.host_settings(false, failed.clone());

        let infrastructure = self
            .factory
            .create(
                host,
                vec![self.return_receiver()],
                vec![self.control_queue.clone()],
            )
            .await?;
        infrastructure.shutdown().await?;

        if failed.load(Ordering::SeqCst) {
            return Err(BridgeError::Provisioning(self.return_queue.clone()));
        }
        info!(return_queue = %self.return_queue, "Health check passed");
        Ok(())
    }
}

#[cfg(all(test, feature = "channel"))]
mod tests {
    use super::*;
    use crate::bus::InMemoryBroker;
    use std::sync::atomic::AtomicU32;

    fn config() -> BridgeConfig {
        BridgeConfig::new("Retry.Return")
    }

    #[tokio::test]
    async fn test_provision_creates_return_and_poison_queues() {
        let broker = InMemoryBroker::new();
        let provisioner = QueueProvisioner::new(&config(), Arc::new(broker.clone()));

        assert!(provisioner.try_provision().await);
        assert_eq!(broker.names(), vec!["Retry.Return", "Retry.Return.poison"]);
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let broker = InMemoryBroker::new();
        let provisioner = QueueProvisioner::new(&config(), Arc::new(broker.clone()));

        assert!(provisioner.try_provision().await);
        broker
            .enqueue("Retry.Return", Default::default(), b"pending".to_vec())
            .unwrap();
        assert!(provisioner.try_provision().await);

        assert_eq!(broker.depth("Retry.Return"), 1);
    }

    #[tokio::test]
    async fn test_provision_failure_reports_to_hook() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let provisioner = QueueProvisioner::new(&config(), Arc::new(broker)).with_critical_error_hook(
            Arc::new(move |_message: &str, _error: &TransportError| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!provisioner.try_provision().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let broker = InMemoryBroker::new();
        let provisioner = QueueProvisioner::new(&config(), Arc::new(broker.clone()));

        assert!(matches!(
            provisioner.health_check().await,
            Err(BridgeError::Transport(TransportError::QueueNotFound(_)))
        ));

        assert!(provisioner.try_provision().await);
        assert!(provisioner.health_check().await.is_ok());
    }
}
