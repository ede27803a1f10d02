//! Long-running services of the bridge.
//!
//! - `bridge`: discovery, receivers and message routing
//! - `provision`: creation of the bridge's own queues
//! - `heartbeat`: periodic status report to ServiceControl
//! - `custom_check`: poison queue length report to ServiceControl

pub mod bridge;
pub mod custom_check;
pub mod heartbeat;
pub mod provision;

pub use bridge::{BridgeService, ServiceState, ServiceStatus};
pub use custom_check::PoisonQueueCheck;
pub use heartbeat::HeartbeatReporter;
pub use provision::QueueProvisioner;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::{Headers, OutgoingMessage, TransportOperation, PROPERTY_MESSAGE_ID};
use crate::translate::headers::{masstransit as mt, nservicebus as nsb};
use crate::translate::to_wire_format;

/// Name of the machine the bridge runs on.
pub fn machine_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Build a JSON message for the ServiceControl control queue.
///
/// ServiceControl dispatches on `NServiceBus.EnclosedMessageTypes`, so the
/// fully qualified .NET type name goes there.
pub(crate) fn control_message<T: Serialize>(
    destination: &str,
    message_type: &str,
    sender: &str,
    payload: &T,
) -> serde_json::Result<TransportOperation> {
    let body = serde_json::to_vec(payload)?;
    let message_id = Uuid::new_v4().to_string();

    let mut headers = Headers::new();
    headers.insert(nsb::MESSAGE_ID.to_string(), message_id.clone());
    headers.insert(nsb::ENCLOSED_MESSAGE_TYPES.to_string(), message_type.to_string());
    headers.insert(nsb::CONTENT_TYPE.to_string(), mt::JSON_CONTENT_TYPE.to_string());
    headers.insert(nsb::MESSAGE_INTENT.to_string(), "Send".to_string());
    headers.insert(nsb::TIME_SENT.to_string(), to_wire_format(Utc::now()));
    headers.insert(nsb::ORIGINATING_ENDPOINT.to_string(), sender.to_string());
    headers.insert(nsb::ORIGINATING_MACHINE.to_string(), machine_name());

    Ok(TransportOperation::new(
        destination,
        OutgoingMessage {
            message_id: message_id.clone(),
            headers,
            body: body.into(),
        },
    )
    .with_property(PROPERTY_MESSAGE_ID, message_id))
}
