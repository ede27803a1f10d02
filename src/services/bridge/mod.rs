//! Bridging service.
//!
//! Owns the receiver topology: the return-queue receiver plus one receiver
//! per discovered MassTransit error queue. Every rescan tick compares the
//! discovered queues with the current snapshot and, when they differ,
//! stops the whole generation of receivers before starting the next one.
//!
//! ## States
//!
//! `Idle -> Provisioning -> Listening <-> Reconciling -> Draining -> Stopped`
//!
//! The current state, generation and listening queues are published on a
//! watch channel.

mod handler;
mod topology;

pub use handler::{BridgeHandler, Direction};
pub use topology::TopologySnapshot;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{
    Broker, CriticalErrorHook, HostSettings, MessageHandler, MessageReceiver, ReceiveSettings,
    TransportError, TransportInfrastructure,
};
use crate::config::{BridgeConfig, ConfigError};
use crate::diagnostics::DiagnosticsData;
use crate::discovery::{self, QueueFilter};
use crate::dlq::PoisonPolicy;
use crate::error::{BridgeError, Result};
use crate::services::provision::{QueueProvisioner, RETURN_RECEIVER_ID};
use crate::translate::adapter::FailureAdapter;
use crate::utils::retry::RetryConfig;

/// Lifecycle state of the bridging service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceState {
    #[default]
    Idle,
    Provisioning,
    Listening,
    Reconciling,
    Draining,
    Stopped,
}

/// Published view of the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Incremented every time a new set of receivers is started.
    pub generation: u64,
    /// Queues with a running receiver, the return queue included.
    pub listening: BTreeSet<String>,
}

/// One set of receivers and the transport that owns them.
struct Generation {
    infrastructure: Box<dyn TransportInfrastructure>,
    receivers: Vec<Arc<dyn MessageReceiver>>,
}

/// Moves faults from MassTransit error queues to ServiceControl and
/// retries back.
pub struct BridgeService {
    config: BridgeConfig,
    broker: Broker,
    filter: QueueFilter,
    adapter: FailureAdapter,
    policy: PoisonPolicy,
    diagnostics: Arc<DiagnosticsData>,
    status: watch::Sender<ServiceStatus>,
}

impl BridgeService {
    pub fn new(
        config: BridgeConfig,
        broker: Broker,
        diagnostics: Arc<DiagnosticsData>,
    ) -> Result<Self> {
        let filter = QueueFilter::from_config(&config).map_err(|e| ConfigError::Invalid {
            field: "queue_filter",
            reason: e.to_string(),
        })?;
        let adapter = FailureAdapter::new(&config.error_queue, &config.return_queue, broker.kind());
        let policy = PoisonPolicy::new(RetryConfig::from_config(&config));
        let (status, _) = watch::channel(ServiceStatus::default());

        Ok(Self {
            config,
            broker,
            filter,
            adapter,
            policy,
            diagnostics,
            status,
        })
    }

    /// Subscribe to state changes.
    pub fn status(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Run until `shutdown` fires or the transport reports a critical error.
    ///
    /// With a provisioner the return and poison queues are created first;
    /// a failed provisioning ends the run with an error.
    pub async fn run(
        &self,
        provisioner: Option<&QueueProvisioner>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Some(provisioner) = provisioner {
            self.set_state(ServiceState::Provisioning);
            if !provisioner.try_provision().await {
                self.set_state(ServiceState::Stopped);
                return Err(BridgeError::Provisioning(self.config.return_queue.clone()));
            }
        }

        let (critical_tx, mut critical_rx) = mpsc::unbounded_channel::<String>();
        let hook: CriticalErrorHook = Arc::new(move |message: &str, error: &TransportError| {
            error!(error = %error, "Critical transport error: {}", message);
            let _ = critical_tx.send(format!("{}: {}", message, error));
        });

        let discovered = self.discover().await.unwrap_or_default();
        let (generation, mut snapshot) = match self.start_generation(discovered, &hook).await {
            Ok(started) => started,
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };
        let mut current = Some(generation);
        self.set_state(ServiceState::Listening);

        let period = self.config.queue_scan_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, draining receivers");
                break Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile(&mut current, &mut snapshot, &hook).await;
                }
                Some(message) = critical_rx.recv() => {
                    break Err(BridgeError::Transport(TransportError::Connection(message)));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, draining receivers");
                        break Ok(());
                    }
                }
            }
        };

        self.set_state(ServiceState::Draining);
        if let Some(generation) = current.take() {
            self.stop_generation(generation).await;
        }
        self.status.send_modify(|status| {
            status.state = ServiceState::Stopped;
            status.listening.clear();
        });
        info!("Bridging service stopped");
        outcome
    }

    async fn discover(&self) -> Option<BTreeSet<String>> {
        debug!("Checking for changes in error queues");
        match discovery::discover(self.broker.queues.as_ref(), &self.filter).await {
            Ok(queues) => Some(queues),
            Err(e) => {
                warn!(error = %e, "Failure querying the queue information");
                None
            }
        }
    }

    /// Previously missing queues that exist now.
    async fn recovered(&self, not_found: &BTreeSet<String>) -> BTreeSet<String> {
        let mut recovered = BTreeSet::new();
        for queue in not_found {
            match self.broker.queues.exists(queue).await {
                Ok(true) => {
                    info!(queue = %queue, "Queue now exists");
                    recovered.insert(queue.clone());
                }
                Ok(false) => {}
                Err(e) => warn!(queue = %queue, error = %e, "Failed to check queue existence"),
            }
        }
        recovered
    }

    async fn reconcile(
        &self,
        current: &mut Option<Generation>,
        snapshot: &mut TopologySnapshot,
        hook: &CriticalErrorHook,
    ) {
        self.set_state(ServiceState::Reconciling);

        let Some(discovered) = self.discover().await else {
            self.set_state(ServiceState::Listening);
            return;
        };
        let recovered = self.recovered(&snapshot.not_found).await;

        if current.is_some() && !snapshot.requires_restart(&discovered, &recovered) {
            debug!(queues = discovered.len(), "No changes in error queues");
            self.set_state(ServiceState::Listening);
            return;
        }

        info!(
            previous = snapshot.discovered.len(),
            discovered = discovered.len(),
            recovered = recovered.len(),
            "Changes detected, restarting receivers"
        );
        if let Some(generation) = current.take() {
            self.stop_generation(generation).await;
        }

        match self.start_generation(discovered, hook).await {
            Ok((generation, next)) => {
                *current = Some(generation);
                *snapshot = next;
            }
            Err(e) => {
                error!(error = %e, "Failed to start receivers, retrying on next scan");
                self.status.send_modify(|status| status.listening.clear());
            }
        }
        self.set_state(ServiceState::Listening);
    }

    fn handler(
        &self,
        direction: Direction,
        infrastructure: &dyn TransportInfrastructure,
    ) -> Arc<dyn MessageHandler> {
        Arc::new(BridgeHandler::new(
            direction,
            self.adapter.clone(),
            infrastructure.dispatcher(),
            self.policy.clone(),
            self.config.poison_queue(),
        ))
    }

    async fn start_generation(
        &self,
        discovered: BTreeSet<String>,
        hook: &CriticalErrorHook,
    ) -> Result<(Generation, TopologySnapshot)> {
        let poison_queue = self.config.poison_queue();
        let mut not_found = BTreeSet::new();
        let mut settings = vec![ReceiveSettings::new(
            RETURN_RECEIVER_ID,
            &self.config.return_queue,
            &poison_queue,
        )];

        for queue in &discovered {
            match self.broker.queues.exists(queue).await {
                Ok(true) => {
                    info!(queue = %queue, "Listening to error queue");
                    settings.push(ReceiveSettings::new(queue, queue, &poison_queue));
                }
                Ok(false) => {
                    warn!(queue = %queue, "Error queue not found, will check again on next scan");
                    not_found.insert(queue.clone());
                }
                Err(e) => {
                    warn!(
                        queue = %queue,
                        error = %e,
                        "Failed to check error queue, will check again on next scan"
                    );
                    not_found.insert(queue.clone());
                }
            }
        }

        let host = HostSettings::new(&self.config.return_queue, false)
            .with_critical_error_hook(hook.clone());
        let infrastructure = match self
            .broker
            .factory
            .create(
                host,
                settings,
                vec![self.config.error_queue.clone(), poison_queue],
            )
            .await
        {
            Ok(infrastructure) => infrastructure,
            Err(e) => {
                self.publish_ingestion(&discovered, &discovered);
                return Err(e.into());
            }
        };

        let receivers = infrastructure.receivers();
        let generation = Generation {
            infrastructure,
            receivers,
        };

        let mut listening = BTreeSet::new();
        for receiver in generation.receivers.clone() {
            let direction = if receiver.id() == RETURN_RECEIVER_ID {
                Direction::Return
            } else {
                Direction::Forward
            };
            let handler = self.handler(direction, generation.infrastructure.as_ref());
            if let Err(e) = receiver.start(handler).await {
                error!(queue = %receiver.receive_address(), error = %e, "Failed to start receiver");
                self.stop_generation(generation).await;
                self.publish_ingestion(&discovered, &discovered);
                return Err(e.into());
            }
            listening.insert(receiver.receive_address().to_string());
        }
        self.publish_ingestion(&discovered, &not_found);

        self.status.send_modify(|status| {
            status.generation += 1;
            status.listening = listening.clone();
        });
        let generation_number = self.status.borrow().generation;
        info!(
            generation = generation_number,
            receivers = listening.len(),
            not_found = not_found.len(),
            "Receivers started"
        );

        Ok((generation, TopologySnapshot::new(discovered, not_found)))
    }

    /// Report the discovered queues to the heartbeat; `idle` ones are not
    /// being consumed.
    fn publish_ingestion(&self, discovered: &BTreeSet<String>, idle: &BTreeSet<String>) {
        self.diagnostics.set_error_queues(discovered.clone());
        self.diagnostics.clear_not_found();
        for queue in idle {
            self.diagnostics.add_not_found(queue.clone());
        }
    }

    /// Stop every receiver in parallel, then release the transport.
    async fn stop_generation(&self, generation: Generation) {
        let results = futures::future::join_all(
            generation.receivers.iter().map(|receiver| receiver.stop()),
        )
        .await;
        for (receiver, result) in generation.receivers.iter().zip(results) {
            if let Err(e) = result {
                warn!(queue = %receiver.receive_address(), error = %e, "Failed to stop receiver");
            }
        }
        if let Err(e) = generation.infrastructure.shutdown().await {
            warn!(error = %e, "Failed to shut down transport");
        }
    }
}
