//! Poison queue custom check.
//!
//! Periodically reads the poison queue length and reports the result to
//! ServiceControl as a custom check: passing while the queue is empty,
//! failed with the message count otherwise.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{control_message, machine_name};
use crate::bus::{HostSettings, MessageDispatcher, TransportFactory};
use crate::config::BridgeConfig;
use crate::discovery::QueueLengthProvider;
use crate::error::Result;

/// Message type ServiceControl expects for custom check reports.
pub const CUSTOM_CHECK_MESSAGE_TYPE: &str =
    "ServiceControl.Plugin.CustomChecks.Messages.ReportCustomCheckResult";

pub const CUSTOM_CHECK_ID: &str = "Poison queue";
pub const CUSTOM_CHECK_CATEGORY: &str = "MassTransit";

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    Pass,
    Failed(String),
}

/// Custom check report as ServiceControl reads it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportCustomCheckResult {
    pub host_id: Uuid,
    pub custom_check_id: String,
    pub category: String,
    pub has_failed: bool,
    pub failure_reason: Option<String>,
    pub reported_at: DateTime<Utc>,
    pub endpoint_name: String,
    pub host: String,
}

/// Stable host identifier for an endpoint on a machine.
pub fn host_id(host: &str, endpoint: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}/{}", host, endpoint).as_bytes())
}

/// Reports the poison queue length to ServiceControl.
pub struct PoisonQueueCheck {
    poison_queue: String,
    control_queue: String,
    endpoint: String,
    interval: Duration,
    lengths: Arc<dyn QueueLengthProvider>,
    factory: Arc<dyn TransportFactory>,
}

impl PoisonQueueCheck {
    pub fn new(
        config: &BridgeConfig,
        lengths: Arc<dyn QueueLengthProvider>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            poison_queue: config.poison_queue(),
            control_queue: config.control_queue.clone(),
            endpoint: config.return_queue.clone(),
            interval: config.custom_checks_interval(),
            lengths,
            factory,
        }
    }

    pub async fn perform(&self) -> CheckResult {
        match self.lengths.length(&self.poison_queue).await {
            Ok(0) => CheckResult::Pass,
            Ok(length) => CheckResult::Failed(format!(
                "Queue `{}` has {} messages that could not be forwarded to ServiceControl.",
                self.poison_queue, length
            )),
            Err(e) => {
                warn!(queue = %self.poison_queue, error = %e, "Failed to read poison queue length");
                CheckResult::Failed(format!(
                    "Unable to read the length of queue `{}`: {}",
                    self.poison_queue, e
                ))
            }
        }
    }

    pub fn report(&self, result: CheckResult) -> ReportCustomCheckResult {
        let host = machine_name();
        let (has_failed, failure_reason) = match result {
            CheckResult::Pass => (false, None),
            CheckResult::Failed(reason) => (true, Some(reason)),
        };
        ReportCustomCheckResult {
            host_id: host_id(&host, &self.endpoint),
            custom_check_id: CUSTOM_CHECK_ID.to_string(),
            category: CUSTOM_CHECK_CATEGORY.to_string(),
            has_failed,
            failure_reason,
            reported_at: Utc::now(),
            endpoint_name: self.endpoint.clone(),
            host,
        }
    }

    /// Run the check once and send the report.
    pub async fn check_once(&self, dispatcher: &dyn MessageDispatcher) -> Result<CheckResult> {
        let result = self.perform().await;
        let report = self.report(result.clone());
        let operation = control_message(
            &self.control_queue,
            CUSTOM_CHECK_MESSAGE_TYPE,
            &self.endpoint,
            &report,
        )?;
        dispatcher.dispatch(vec![operation]).await?;
        debug!(failed = report.has_failed, "Custom check reported");
        Ok(result)
    }

    /// Check every interval until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let host = HostSettings::new(format!("{} custom checks", self.endpoint), false);
        let infrastructure = self
            .factory
            .create(host, Vec::new(), vec![self.control_queue.clone()])
            .await?;
        let dispatcher = infrastructure.dispatcher();

        info!(
            poison_queue = %self.poison_queue,
            interval_secs = self.interval.as_secs_f64(),
            "Poison queue check started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once(dispatcher.as_ref()).await {
                        error!(error = %e, "Failed to report custom check");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Stopping poison queue check");
        infrastructure.shutdown().await?;
        Ok(())
    }
}
