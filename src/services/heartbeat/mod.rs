//! Heartbeat reporting to ServiceControl.
//!
//! Every interval the reporter sends the connector version, the discovered
//! error queues with their ingestion state, and the recent WARN/ERROR log
//! entries to the ServiceControl control queue. Payloads are shrunk to fit
//! `MAX_HEARTBEAT_SIZE` before sending. A failed send is logged and the
//! next tick tries again.

mod reducer;

pub use reducer::{reduce, reduce_to, MAX_HEARTBEAT_SIZE};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::control_message;
use crate::bus::{HostSettings, MessageDispatcher, TransportFactory};
use crate::config::BridgeConfig;
use crate::diagnostics::{DiagnosticsData, LogEntry};
use crate::error::Result;

/// Message type ServiceControl expects for connector heartbeats.
pub const HEARTBEAT_MESSAGE_TYPE: &str =
    "ServiceControl.Connector.MassTransit.MassTransitConnectorHeartbeat";

/// Version reported in heartbeats.
pub const CONNECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An error queue as reported to ServiceControl.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorQueue {
    pub name: String,
    pub ingesting: bool,
}

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    pub version: String,
    pub error_queues: Vec<ErrorQueue>,
    pub logs: Vec<LogEntry>,
    pub sent_date_time_offset: DateTime<Utc>,
}

impl Heartbeat {
    /// Snapshot the diagnostics into a payload.
    pub fn from_diagnostics(diagnostics: &DiagnosticsData) -> Self {
        Self {
            version: CONNECTOR_VERSION.to_string(),
            error_queues: diagnostics
                .ingestion_status()
                .into_iter()
                .map(|(name, ingesting)| ErrorQueue { name, ingesting })
                .collect(),
            logs: diagnostics.recent_logs(),
            sent_date_time_offset: Utc::now(),
        }
    }
}

/// Periodically sends heartbeats to the control queue.
pub struct HeartbeatReporter {
    control_queue: String,
    sender: String,
    interval: Duration,
    diagnostics: Arc<DiagnosticsData>,
    factory: Arc<dyn TransportFactory>,
}

impl HeartbeatReporter {
    pub fn new(
        config: &BridgeConfig,
        diagnostics: Arc<DiagnosticsData>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            control_queue: config.control_queue.clone(),
            sender: config.return_queue.clone(),
            interval: config.heartbeat_interval(),
            diagnostics,
            factory,
        }
    }

    /// Build, reduce and send one heartbeat.
    pub async fn send_once(&self, dispatcher: &dyn MessageDispatcher) -> Result<()> {
        let heartbeat = reduce(Heartbeat::from_diagnostics(&self.diagnostics))?;
        let queues = heartbeat.error_queues.len();
        let logs = heartbeat.logs.len();

        let operation = control_message(
            &self.control_queue,
            HEARTBEAT_MESSAGE_TYPE,
            &self.sender,
            &heartbeat,
        )?;
        let size = operation.message.body.len();

        dispatcher.dispatch(vec![operation]).await?;
        debug!(queues, logs, size, "Heartbeat sent");
        Ok(())
    }

    /// Send a heartbeat immediately and then every interval until
    /// `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let host = HostSettings::new(format!("{} heartbeat", self.sender), false);
        let infrastructure = self
            .factory
            .create(host, Vec::new(), vec![self.control_queue.clone()])
            .await?;
        let dispatcher = infrastructure.dispatcher();

        info!(
            control_queue = %self.control_queue,
            interval_secs = self.interval.as_secs_f64(),
            "Heartbeat reporter started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send_once(dispatcher.as_ref()).await {
                        error!(error = %e, "Failed to send heartbeat");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Stopping heartbeat reporter");
        infrastructure.shutdown().await?;
        Ok(())
    }
}
