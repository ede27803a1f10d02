//! Builds the transport operations for both bridge directions.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::headers::{nservicebus as nsb, servicecontrol as sc};
use super::{queue_name_from_address, to_source_schema, to_target_schema};
use crate::bus::{
    BrokerKind, MessageEnvelope, OutgoingMessage, TransportOperation, PROPERTY_CONTENT_TYPE,
    PROPERTY_MESSAGE_ID,
};
use crate::error::ConversionError;

/// Turns received envelopes into sends for ServiceControl or back to
/// MassTransit.
#[derive(Debug, Clone)]
pub struct FailureAdapter {
    error_queue: String,
    return_queue: String,
    broker: BrokerKind,
}

impl FailureAdapter {
    pub fn new(
        error_queue: impl Into<String>,
        return_queue: impl Into<String>,
        broker: BrokerKind,
    ) -> Self {
        Self {
            error_queue: error_queue.into(),
            return_queue: return_queue.into(),
            broker,
        }
    }

    /// Translate a MassTransit fault and address it to the ServiceControl
    /// error queue. Retries requested from ServiceControl come back through
    /// the return queue.
    pub fn forward_to_target(
        &self,
        envelope: &mut MessageEnvelope,
    ) -> Result<TransportOperation, ConversionError> {
        to_target_schema(envelope)?;

        envelope
            .headers
            .insert(sc::RETRY_TO.to_string(), self.return_queue.clone());

        let message_id = envelope
            .header(nsb::MESSAGE_ID)
            .unwrap_or(&envelope.native_message_id)
            .to_string();

        info!(
            native_id = %envelope.native_message_id,
            message_id = %message_id,
            content_hash = %content_hash(&envelope.body),
            length = envelope.body.len(),
            destination = %self.error_queue,
            "Forwarding fault to ServiceControl"
        );

        Ok(TransportOperation::new(
            self.error_queue.clone(),
            OutgoingMessage {
                message_id,
                headers: envelope.headers.clone(),
                body: envelope.body.clone(),
            },
        ))
    }

    /// Translate a ServiceControl retry back into a MassTransit message for
    /// the queue it originally failed in.
    pub fn return_to_source(
        &self,
        envelope: &mut MessageEnvelope,
    ) -> Result<TransportOperation, ConversionError> {
        let target_address = envelope
            .header(sc::TARGET_ENDPOINT_ADDRESS)
            .ok_or_else(|| ConversionError::MissingHeader(sc::TARGET_ENDPOINT_ADDRESS.to_string()))?;
        let destination = queue_name_from_address(target_address);

        let content_type = envelope.headers.remove(nsb::CONTENT_TYPE);
        let message_id = envelope
            .header(nsb::MESSAGE_ID)
            .unwrap_or(&envelope.native_message_id)
            .to_string();

        to_source_schema(envelope);

        let ack_queue = envelope
            .headers
            .get_mut(sc::RETRY_ACKNOWLEDGEMENT_QUEUE)
            .ok_or_else(|| {
                ConversionError::MissingHeader(sc::RETRY_ACKNOWLEDGEMENT_QUEUE.to_string())
            })?;
        let prefix = self.broker.queue_address_prefix();
        if !ack_queue.starts_with(prefix) {
            *ack_queue = format!("{}{}", prefix, ack_queue);
        }

        debug!(
            native_id = %envelope.native_message_id,
            message_id = %message_id,
            destination = %destination,
            "Returning retried message to MassTransit"
        );

        let mut operation = TransportOperation::new(
            destination,
            OutgoingMessage {
                message_id: message_id.clone(),
                headers: envelope.headers.clone(),
                body: envelope.body.clone(),
            },
        )
        .with_property(PROPERTY_MESSAGE_ID, message_id);
        if let Some(content_type) = content_type {
            operation = operation.with_property(PROPERTY_CONTENT_TYPE, content_type);
        }
        Ok(operation)
    }
}

/// Hex SHA-256 of a message body, for correlating log lines.
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
