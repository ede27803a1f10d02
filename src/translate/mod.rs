//! Header translation between MassTransit and NServiceBus conventions.
//!
//! MassTransit writes faults in one of two shapes:
//! - **Envelope**: the body is a JSON envelope holding the message
//!   metadata; only the `MT-*` fault headers travel as headers.
//! - **Flat headers**: raw JSON body, all metadata in headers. Recognized
//!   by the presence of the `MessageId` header.
//!
//! Both shapes are read into the same metadata record before the
//! NServiceBus headers are written, so the output does not depend on the
//! shape the fault arrived in.

pub mod adapter;
pub mod headers;
mod time;

pub use adapter::FailureAdapter;
pub use time::{parse_timestamp, to_timespan, to_wire_format, WIRE_FORMAT};

use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::bus::MessageEnvelope;
use crate::error::ConversionError;
use headers::{masstransit as mt, nservicebus as nsb, servicecontrol as sc};

/// ServiceControl headers that must survive the return trip.
const PRESERVED_ON_RETURN: &[&str] = &[
    sc::RETRY_ACKNOWLEDGEMENT_QUEUE,
    sc::RETRY_UNIQUE_MESSAGE_ID,
];

/// Strip NServiceBus and ServiceControl headers so the message looks like
/// one MassTransit produced. Idempotent.
pub fn to_source_schema(envelope: &mut MessageEnvelope) {
    envelope.headers.retain(|key, _| {
        let foreign = key.starts_with(nsb::PREFIX) || key.starts_with(sc::PREFIX);
        !foreign || PRESERVED_ON_RETURN.contains(&key.as_str())
    });
}

/// Rewrite a MassTransit fault into the headers ServiceControl expects.
///
/// Fails only when the fault marker is missing or an envelope body cannot
/// be read; every other missing field is logged and skipped.
pub fn to_target_schema(envelope: &mut MessageEnvelope) -> Result<(), ConversionError> {
    match envelope.header(mt::REASON) {
        Some(reason) if reason == mt::FAULT_REASON => {}
        Some(reason) => {
            return Err(ConversionError::InvalidFormat(format!(
                "'{}' is '{}', expected '{}'",
                mt::REASON,
                reason,
                mt::FAULT_REASON
            )))
        }
        None => {
            return Err(ConversionError::InvalidFormat(format!(
                "'{}' header is missing",
                mt::REASON
            )))
        }
    }

    let has_envelope = !envelope.headers.contains_key(mt::MESSAGE_ID);
    let metadata = if has_envelope {
        MessageMetadata::from_envelope_body(envelope)?
    } else {
        MessageMetadata::from_headers(envelope)
    };

    let content_type = if has_envelope {
        mt::ENVELOPE_CONTENT_TYPE
    } else {
        mt::JSON_CONTENT_TYPE
    };
    set(envelope, nsb::CONTENT_TYPE, content_type);

    write_message_headers(envelope, &metadata);
    write_fault_headers(envelope, &metadata);
    Ok(())
}

/// Queue name from a MassTransit or ServiceControl address.
///
/// Absolute URIs (`rabbitmq://host/vhost/orders`, `queue:orders`) yield their
/// last path segment; anything else is already a queue name, even when it
/// contains a colon (`host:5672`).
pub fn queue_name_from_address(address: &str) -> String {
    let address = address.trim();
    if !is_uri_address(address) {
        return address.to_string();
    }
    match reqwest::Url::parse(address) {
        Ok(url) => url
            .path()
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| address.to_string()),
        Err(_) => address.to_string(),
    }
}

/// MassTransit short address schemes.
const ADDRESS_SCHEMES: [&str; 3] = ["queue:", "exchange:", "topic:"];

fn is_uri_address(address: &str) -> bool {
    address.contains("://")
        || ADDRESS_SCHEMES
            .iter()
            .any(|scheme| address.starts_with(scheme))
}

// ============================================================================
// Metadata extraction
// ============================================================================

/// Message metadata read from either fault shape.
#[derive(Debug, Default)]
struct MessageMetadata {
    message_id: Option<String>,
    message_types: Vec<String>,
    sent_time: Option<String>,
    conversation_id: Option<String>,
    correlation_id: Option<String>,
    expiration_time: Option<String>,
    source_address: Option<String>,
    machine_name: Option<String>,
}

/// The subset of the MassTransit JSON envelope the bridge reads.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MassTransitEnvelope {
    message_id: Option<String>,
    conversation_id: Option<String>,
    correlation_id: Option<String>,
    source_address: Option<String>,
    message_type: Vec<String>,
    sent_time: Option<String>,
    expiration_time: Option<String>,
    host: Option<HostInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostInfo {
    #[serde(rename = "machineName", alias = "MachineName")]
    machine_name: Option<String>,
}

impl MessageMetadata {
    fn from_envelope_body(envelope: &MessageEnvelope) -> Result<Self, ConversionError> {
        let body: MassTransitEnvelope = serde_json::from_slice(&envelope.body).map_err(|e| {
            ConversionError::InvalidFormat(format!("body is not a MassTransit envelope: {}", e))
        })?;

        Ok(Self {
            message_id: body.message_id,
            message_types: body.message_type,
            sent_time: body.sent_time,
            conversation_id: body.conversation_id,
            correlation_id: body.correlation_id,
            expiration_time: body.expiration_time,
            source_address: body.source_address,
            machine_name: body.host.and_then(|h| h.machine_name),
        })
    }

    fn from_headers(envelope: &MessageEnvelope) -> Self {
        let header = |key: &str| envelope.header(key).map(str::to_string);

        let machine_name = envelope
            .header(mt::HOST_INFO)
            .and_then(|info| match serde_json::from_str::<HostInfo>(info) {
                Ok(host) => host.machine_name,
                Err(e) => {
                    warn!(error = %e, "Unreadable {} header", mt::HOST_INFO);
                    None
                }
            })
            .or_else(|| header(mt::HOST_MACHINE_NAME));

        Self {
            message_id: header(mt::MESSAGE_ID),
            message_types: envelope
                .header(mt::MESSAGE_TYPE)
                .map(|types| {
                    types
                        .split(';')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sent_time: header(mt::SENT_TIME),
            conversation_id: header(mt::CONVERSATION_ID),
            correlation_id: header(mt::CORRELATION_ID),
            expiration_time: header(mt::EXPIRATION_TIME),
            source_address: header(mt::SOURCE_ADDRESS),
            machine_name,
        }
    }
}

// ============================================================================
// Header population
// ============================================================================

fn set(envelope: &mut MessageEnvelope, key: &str, value: impl Into<String>) {
    envelope.headers.insert(key.to_string(), value.into());
}

fn write_message_headers(envelope: &mut MessageEnvelope, metadata: &MessageMetadata) {
    let message_id = match &metadata.message_id {
        Some(id) => id.clone(),
        None => {
            warn!(
                native_id = %envelope.native_message_id,
                "Fault has no message id, using the native id"
            );
            envelope.native_message_id.clone()
        }
    };
    set(envelope, nsb::MESSAGE_ID, message_id);

    if metadata.message_types.is_empty() {
        warn!(native_id = %envelope.native_message_id, "Fault has no message type");
    } else {
        set(
            envelope,
            nsb::ENCLOSED_MESSAGE_TYPES,
            metadata.message_types.join(","),
        );
    }

    let fault_time = envelope.header(mt::FAULT_TIMESTAMP).and_then(parse_timestamp);
    let sent = match metadata.sent_time.as_deref().and_then(parse_timestamp) {
        Some(sent) => Some(sent),
        None => {
            warn!(
                native_id = %envelope.native_message_id,
                "Fault has no readable sent time, using the fault timestamp"
            );
            fault_time
        }
    };
    if let Some(sent) = sent {
        set(envelope, nsb::TIME_SENT, to_wire_format(sent));
    }

    match &metadata.conversation_id {
        Some(conversation_id) => set(envelope, nsb::CONVERSATION_ID, conversation_id.clone()),
        None => warn!(native_id = %envelope.native_message_id, "Fault has no conversation id"),
    }
    if let Some(correlation_id) = &metadata.correlation_id {
        set(envelope, nsb::CORRELATION_ID, correlation_id.clone());
    }

    if let Some(expires) = metadata.expiration_time.as_deref().and_then(parse_timestamp) {
        let from = sent.unwrap_or_else(Utc::now);
        set(envelope, nsb::TIME_TO_BE_RECEIVED, to_timespan(expires - from));
    }

    match &metadata.source_address {
        Some(source) => set(envelope, nsb::ORIGINATING_ENDPOINT, source.clone()),
        None => warn!(native_id = %envelope.native_message_id, "Fault has no source address"),
    }
    match &metadata.machine_name {
        Some(machine) => set(envelope, nsb::ORIGINATING_MACHINE, machine.clone()),
        None => warn!(native_id = %envelope.native_message_id, "Fault has no host machine name"),
    }
}

fn write_fault_headers(envelope: &mut MessageEnvelope, metadata: &MessageMetadata) {
    if let Some(retries) = envelope.header(mt::FAULT_RETRY_COUNT).map(str::to_string) {
        set(envelope, nsb::DELAYED_RETRIES, retries);
    }

    let input_address = match envelope.header(mt::FAULT_INPUT_ADDRESS) {
        Some(address) => address.to_string(),
        None => {
            // Only reached for faults MassTransit wrote without an input
            // address; the receive queue is the best remaining guess.
            let receive_address = envelope.receive_address.clone();
            warn!(
                native_id = %envelope.native_message_id,
                receive_address = %receive_address,
                "Fault has no input address, falling back to the receive address"
            );
            set(
                envelope,
                mt::FAULT_INPUT_ADDRESS,
                format!("queue:{}", receive_address),
            );
            receive_address
        }
    };
    set(envelope, nsb::PROCESSING_ENDPOINT, input_address.clone());
    set(envelope, nsb::FAILED_QUEUE, input_address);

    let processing_machine = envelope
        .header(mt::HOST_MACHINE_NAME)
        .map(str::to_string)
        .or_else(|| metadata.machine_name.clone());
    if let Some(machine) = processing_machine {
        set(envelope, nsb::PROCESSING_MACHINE, machine);
    }

    for (source, target) in [
        (mt::FAULT_EXCEPTION_TYPE, nsb::EXCEPTION_TYPE),
        (mt::FAULT_MESSAGE, nsb::EXCEPTION_MESSAGE),
        (mt::FAULT_STACK_TRACE, nsb::EXCEPTION_STACK_TRACE),
    ] {
        match envelope.header(source).map(str::to_string) {
            Some(value) => set(envelope, target, value),
            None => warn!(
                native_id = %envelope.native_message_id,
                header = source,
                "Fault header missing"
            ),
        }
    }

    let failed_at = match envelope.header(mt::FAULT_TIMESTAMP).and_then(parse_timestamp) {
        Some(failed_at) => failed_at,
        None => {
            warn!(
                native_id = %envelope.native_message_id,
                "Fault has no readable timestamp, using the current time"
            );
            Utc::now()
        }
    };
    set(envelope, nsb::TIME_OF_FAILURE, to_wire_format(failed_at));
}

#[cfg(test)]
mod tests;
