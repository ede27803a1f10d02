//! Amazon SQS transport.
//!
//! Headers travel as SQS message attributes. SQS allows at most ten
//! attributes per message, so larger header sets are packed into a single
//! `Headers` attribute holding a JSON object. Bodies that are not valid
//! UTF-8 are base64 encoded and flagged with a `Body-Encoding` attribute.
//!
//! The transport also answers queue listing (`ListQueues`) and queue
//! length (`ApproximateNumberOfMessages`) for discovery and the poison
//! queue check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use base64::prelude::*;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    deliver, BrokerKind, DeliveryOutcome, Headers, HostSettings, MessageDispatcher,
    MessageEnvelope, MessageHandler, MessageReceiver, ReceiveSettings, Result, TransportError,
    TransportFactory, TransportInfrastructure, TransportOperation, PROPERTY_CONTENT_TYPE,
};
use crate::config::SqsConfig;
use crate::dlq::poison_operation;
use crate::discovery::{self, DiscoveryError, QueueInformationProvider, QueueLengthProvider};
use crate::translate::queue_name_from_address;
use crate::utils::bootstrap::connect_with_retry;

/// SQS limit on message attributes per message.
pub const MAX_MESSAGE_ATTRIBUTES: usize = 10;
/// Attribute holding all headers as JSON when they do not fit one per
/// attribute.
pub const HEADERS_ATTRIBUTE: &str = "Headers";
/// Attribute marking a base64 encoded body.
pub const BODY_ENCODING_ATTRIBUTE: &str = "Body-Encoding";
/// Attribute carrying the content type.
pub const CONTENT_TYPE_ATTRIBUTE: &str = "Content-Type";

const BASE64_ENCODING: &str = "base64";

/// Connection attempts before `create` gives up.
const CONNECT_ATTEMPTS: u32 = 5;

/// Consecutive receive failures before the receiver reports a critical
/// error.
const MAX_RECEIVE_FAILURES: u32 = 5;

// ============================================================================
// Attribute encoding
// ============================================================================

/// Attributes for an outgoing message, as name/value strings.
///
/// One attribute per header while everything fits in the SQS limit (and
/// no header value is empty, which SQS rejects); otherwise all headers go
/// into `HEADERS_ATTRIBUTE` as JSON.
pub fn encode_attributes(
    headers: &Headers,
    content_type: Option<&str>,
    base64_body: bool,
) -> serde_json::Result<HashMap<String, String>> {
    let mut attributes = HashMap::new();
    if let Some(content_type) = content_type {
        attributes.insert(CONTENT_TYPE_ATTRIBUTE.to_string(), content_type.to_string());
    }
    if base64_body {
        attributes.insert(BODY_ENCODING_ATTRIBUTE.to_string(), BASE64_ENCODING.to_string());
    }

    let fits = attributes.len() + headers.len() <= MAX_MESSAGE_ATTRIBUTES;
    if fits && headers.values().all(|value| !value.is_empty()) {
        attributes.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    } else {
        attributes.insert(HEADERS_ATTRIBUTE.to_string(), serde_json::to_string(headers)?);
    }
    Ok(attributes)
}

/// Headers from received attributes. A packed `Headers` attribute is
/// unpacked; transport attributes are dropped.
pub fn decode_headers(attributes: &HashMap<String, String>) -> serde_json::Result<Headers> {
    let mut headers = Headers::new();
    for (name, value) in attributes {
        match name.as_str() {
            HEADERS_ATTRIBUTE => {
                let packed: Headers = serde_json::from_str(value)?;
                headers.extend(packed);
            }
            BODY_ENCODING_ATTRIBUTE | CONTENT_TYPE_ATTRIBUTE => {}
            _ => {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    Ok(headers)
}

/// Message body text and whether it had to be base64 encoded.
pub fn encode_body(body: &[u8]) -> (String, bool) {
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (BASE64_STANDARD.encode(body), true),
    }
}

pub fn decode_body(
    body: &str,
    attributes: &HashMap<String, String>,
) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    match attributes.get(BODY_ENCODING_ATTRIBUTE).map(String::as_str) {
        Some(BASE64_ENCODING) => BASE64_STANDARD.decode(body),
        _ => Ok(body.as_bytes().to_vec()),
    }
}

fn string_attributes(message: &aws_sdk_sqs::types::Message) -> HashMap<String, String> {
    message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .string_value()
                        .map(|v| (name.clone(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Transport
// ============================================================================

/// SQS transport factory and queue information provider.
#[derive(Clone)]
pub struct SqsTransport {
    client: SqsClient,
    config: SqsConfig,
    /// Queue URLs by queue name.
    queue_urls: Arc<RwLock<HashMap<String, String>>>,
}

impl SqsTransport {
    /// Load AWS configuration and build the client.
    pub async fn connect(config: SqsConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let client = SqsClient::new(&aws_config);

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Configured AWS SQS client"
        );

        Self {
            client,
            config,
            queue_urls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// URL of an existing queue, or `None` when it does not exist.
    async fn find_queue_url(&self, name: &str) -> Result<Option<String>> {
        if let Some(url) = self.queue_urls.read().await.get(name) {
            return Ok(Some(url.clone()));
        }

        match self.client.get_queue_url().queue_name(name).send().await {
            Ok(output) => {
                let url = output
                    .queue_url()
                    .ok_or_else(|| {
                        TransportError::Connection("SQS get_queue_url returned no URL".to_string())
                    })?
                    .to_string();
                self.queue_urls
                    .write()
                    .await
                    .insert(name.to_string(), url.clone());
                Ok(Some(url))
            }
            Err(e)
                if e
                    .as_service_error()
                    .map(|se| se.is_queue_does_not_exist())
                    .unwrap_or(false) =>
            {
                Ok(None)
            }
            Err(e) => Err(TransportError::Connection(format!(
                "Failed to resolve queue '{}': {}",
                name, e
            ))),
        }
    }

    async fn queue_url(&self, name: &str) -> Result<String> {
        self.find_queue_url(name)
            .await?
            .ok_or_else(|| TransportError::QueueNotFound(name.to_string()))
    }

    /// Create the queue if missing. Idempotent.
    async fn ensure_queue(&self, name: &str) -> Result<()> {
        let output = self
            .client
            .create_queue()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| TransportError::Setup(format!("Failed to create queue '{}': {}", name, e)))?;
        if let Some(url) = output.queue_url() {
            self.queue_urls
                .write()
                .await
                .insert(name.to_string(), url.to_string());
        }
        debug!(queue = %name, "SQS queue ensured");
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        self.client
            .list_queues()
            .max_results(1)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Connection(format!("SQS is unreachable: {}", e)))
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[async_trait]
impl MessageDispatcher for SqsTransport {
    async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<()> {
        for operation in operations {
            let destination = operation.destination.clone();
            let failed = |message: String| TransportError::Dispatch {
                destination: destination.clone(),
                message,
            };

            let queue_url = self.queue_url(&operation.destination).await?;
            let (body, base64_body) = encode_body(&operation.message.body);
            let attributes = encode_attributes(
                &operation.message.headers,
                operation.property(PROPERTY_CONTENT_TYPE),
                base64_body,
            )
            .map_err(|e| failed(format!("Failed to encode headers: {}", e)))?;

            let mut message_attributes = HashMap::new();
            for (name, value) in attributes {
                let attribute = MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .map_err(|e| failed(format!("Failed to build attribute: {}", e)))?;
                message_attributes.insert(name, attribute);
            }

            self.client
                .send_message()
                .queue_url(queue_url)
                .message_body(body)
                .set_message_attributes(Some(message_attributes))
                .send()
                .await
                .map_err(|e| failed(format!("Failed to send: {}", e)))?;
            debug!(destination = %operation.destination, "Sent to SQS queue");
        }
        Ok(())
    }
}

// ============================================================================
// Receive
// ============================================================================

struct SqsReceiver {
    transport: SqsTransport,
    host: HostSettings,
    settings: ReceiveSettings,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SqsReceiver {
    fn new(transport: SqsTransport, host: HostSettings, settings: ReceiveSettings) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            transport,
            host,
            settings,
            stop_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }
}

/// A received message whose headers or body could not be decoded, kept
/// exactly as it arrived.
#[derive(Debug)]
struct UnreadableMessage {
    envelope: MessageEnvelope,
    reason: String,
}

fn decode_message(
    attributes: &HashMap<String, String>,
    body: &str,
    native_id: &str,
    address: &str,
) -> std::result::Result<MessageEnvelope, UnreadableMessage> {
    let decoded = decode_headers(attributes)
        .map_err(|e| format!("unreadable headers: {}", e))
        .and_then(|headers| {
            decode_body(body, attributes)
                .map(|body| (headers, body))
                .map_err(|e| format!("unreadable body: {}", e))
        });
    match decoded {
        Ok((headers, body)) => Ok(MessageEnvelope::new(native_id, headers, body, address)),
        Err(reason) => {
            let raw: Headers = attributes
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            Err(UnreadableMessage {
                envelope: MessageEnvelope::new(native_id, raw, body.as_bytes().to_vec(), address),
                reason,
            })
        }
    }
}

async fn receive_loop(
    transport: SqsTransport,
    host: HostSettings,
    queue_url: String,
    settings: ReceiveSettings,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) {
    let address = settings.receive_address.clone();
    let client = transport.client.clone();
    let mut failures = 0u32;

    'receive: loop {
        if *stop.borrow() {
            break;
        }

        let request = client
            .receive_message()
            .queue_url(&queue_url)
            .max_number_of_messages(transport.config.max_messages)
            .wait_time_seconds(transport.config.wait_time_secs)
            .message_attribute_names("All")
            .send();

        let output = tokio::select! {
            output = request => output,
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        let output = match output {
            Ok(output) => {
                failures = 0;
                output
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_RECEIVE_FAILURES {
                    host.raise_critical(
                        &format!("Receiver for '{}' cannot reach SQS", address),
                        &TransportError::Connection(e.to_string()),
                    );
                    break;
                }
                warn!(queue = %address, failures, error = %e, "Failed to receive messages from SQS");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let messages = output.messages();
        for (index, message) in messages.iter().enumerate() {
            let Some(receipt) = message.receipt_handle() else {
                continue;
            };

            let attributes = string_attributes(message);
            let decoded = decode_message(
                &attributes,
                message.body().unwrap_or_default(),
                message.message_id().unwrap_or_default(),
                &address,
            );
            let (native_id, outcome) = match decoded {
                Ok(envelope) => {
                    let native_id = envelope.native_message_id.clone();
                    (native_id, deliver(handler.as_ref(), envelope, &mut stop).await)
                }
                Err(unreadable) => {
                    let native_id = unreadable.envelope.native_message_id.clone();
                    error!(
                        queue = %address,
                        native_id = %native_id,
                        reason = %unreadable.reason,
                        poison_queue = %settings.error_queue,
                        "Moving unreadable SQS message to the poison queue"
                    );
                    let operation = poison_operation(&unreadable.envelope, &settings.error_queue);
                    match transport.dispatch(vec![operation]).await {
                        Ok(()) => (native_id, DeliveryOutcome::Completed),
                        Err(e) => {
                            // Stays invisible until the visibility timeout, then
                            // comes back for another attempt.
                            error!(queue = %address, native_id = %native_id, error = %e, "Failed to poison unreadable message");
                            continue;
                        }
                    }
                }
            };

            match outcome {
                DeliveryOutcome::Completed => {
                    if let Err(e) = client
                        .delete_message()
                        .queue_url(&queue_url)
                        .receipt_handle(receipt)
                        .send()
                        .await
                    {
                        error!(queue = %address, native_id = %native_id, error = %e, "Failed to delete message");
                    }
                }
                DeliveryOutcome::Abandoned => {
                    debug!(queue = %address, native_id = %native_id, "Releasing unprocessed messages");
                    for pending in &messages[index..] {
                        if let Some(receipt) = pending.receipt_handle() {
                            let _ = client
                                .change_message_visibility()
                                .queue_url(&queue_url)
                                .receipt_handle(receipt)
                                .visibility_timeout(0)
                                .send()
                                .await;
                        }
                    }
                    break 'receive;
                }
            }
        }
    }
    debug!(queue = %address, "SQS receiver stopped");
}

#[async_trait]
impl MessageReceiver for SqsReceiver {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn receive_address(&self) -> &str {
        &self.settings.receive_address
    }

    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let address = self.settings.receive_address.clone();
        let queue_url = self.transport.queue_url(&address).await?;

        self.stop_tx.send_replace(false);
        *task = Some(tokio::spawn(receive_loop(
            self.transport.clone(),
            self.host.clone(),
            queue_url,
            self.settings.clone(),
            handler,
            self.stop_tx.subscribe(),
        )));

        info!(receiver = %self.settings.id, queue = %address, "SQS receiver started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| TransportError::Receive(e.to_string()))?;
        }
        Ok(())
    }
}

// ============================================================================
// Infrastructure
// ============================================================================

struct SqsInfrastructure {
    transport: SqsTransport,
    receivers: Vec<Arc<dyn MessageReceiver>>,
}

#[async_trait]
impl TransportInfrastructure for SqsInfrastructure {
    fn dispatcher(&self) -> Arc<dyn MessageDispatcher> {
        Arc::new(self.transport.clone())
    }

    fn receivers(&self) -> Vec<Arc<dyn MessageReceiver>> {
        self.receivers.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for SqsTransport {
    fn kind(&self) -> BrokerKind {
        BrokerKind::AmazonSqs
    }

    async fn create(
        &self,
        host: HostSettings,
        receivers: Vec<ReceiveSettings>,
        sending_addresses: Vec<String>,
    ) -> Result<Box<dyn TransportInfrastructure>> {
        let endpoint = self
            .config
            .endpoint_url
            .clone()
            .unwrap_or_else(|| "aws".to_string());
        connect_with_retry("sqs", &endpoint, CONNECT_ATTEMPTS, || self.probe()).await?;

        if host.setup_infrastructure {
            for settings in &receivers {
                self.ensure_queue(&settings.receive_address).await?;
                self.ensure_queue(&settings.error_queue).await?;
            }
            for address in &sending_addresses {
                self.ensure_queue(address).await?;
            }
            info!(
                host = %host.name,
                receivers = receivers.len(),
                senders = sending_addresses.len(),
                "Created SQS queues"
            );
        } else {
            for settings in &receivers {
                if self.find_queue_url(&settings.receive_address).await?.is_none() {
                    warn!(queue = %settings.receive_address, "Receive queue does not exist");
                    return Err(TransportError::QueueNotFound(
                        settings.receive_address.clone(),
                    ));
                }
            }
        }

        let receivers = receivers
            .into_iter()
            .map(|settings| {
                Arc::new(SqsReceiver::new(self.clone(), host.clone(), settings))
                    as Arc<dyn MessageReceiver>
            })
            .collect();

        Ok(Box::new(SqsInfrastructure {
            transport: self.clone(),
            receivers,
        }))
    }
}

// ============================================================================
// Queue information
// ============================================================================

#[async_trait]
impl QueueInformationProvider for SqsTransport {
    fn queues(&self) -> BoxStream<'_, discovery::Result<String>> {
        stream::try_unfold(Some(None::<String>), move |next| async move {
            let Some(token) = next else {
                return Ok::<_, DiscoveryError>(None);
            };
            let output = self
                .client
                .list_queues()
                .set_queue_name_prefix(self.config.queue_name_prefix.clone())
                .set_next_token(token)
                .max_results(1000)
                .send()
                .await
                .map_err(|e| DiscoveryError::Request(e.to_string()))?;

            let names: Vec<String> = output
                .queue_urls()
                .iter()
                .map(|url| queue_name_from_address(url))
                .collect();
            let next = output.next_token().map(|token| Some(token.to_string()));
            Ok(Some((
                stream::iter(names.into_iter().map(Ok::<_, DiscoveryError>)),
                next,
            )))
        })
        .try_flatten()
        .boxed()
    }

    async fn exists(&self, name: &str) -> discovery::Result<bool> {
        self.find_queue_url(name)
            .await
            .map(|url| url.is_some())
            .map_err(|e| DiscoveryError::Request(e.to_string()))
    }
}

#[async_trait]
impl QueueLengthProvider for SqsTransport {
    async fn length(&self, name: &str) -> discovery::Result<u64> {
        let url = self
            .queue_url(name)
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        output
            .attributes()
            .and_then(|attributes| attributes.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .ok_or_else(|| {
                DiscoveryError::Response(format!("no message count returned for '{}'", name))
            })?
            .parse()
            .map_err(|e| DiscoveryError::Response(format!("invalid message count: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(count: usize) -> Headers {
        (0..count)
            .map(|i| (format!("Header-{}", i), format!("value-{}", i)))
            .collect()
    }

    #[test]
    fn test_small_header_sets_use_one_attribute_each() {
        let attributes = encode_attributes(&headers(9), Some("application/json"), false).unwrap();

        assert_eq!(attributes.len(), 10);
        assert!(!attributes.contains_key(HEADERS_ATTRIBUTE));
        assert_eq!(attributes["Header-3"], "value-3");
        assert_eq!(attributes[CONTENT_TYPE_ATTRIBUTE], "application/json");
    }

    #[test]
    fn test_large_header_sets_are_packed() {
        let original = headers(10);
        let attributes = encode_attributes(&original, Some("application/json"), false).unwrap();

        assert_eq!(attributes.len(), 2);
        assert_eq!(decode_headers(&attributes).unwrap(), original);
    }

    #[test]
    fn test_empty_header_values_force_packing() {
        let mut original = headers(2);
        original.insert("MT-Fault-StackTrace".to_string(), String::new());

        let attributes = encode_attributes(&original, None, false).unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(decode_headers(&attributes).unwrap(), original);
    }

    #[test]
    fn test_transport_attributes_are_not_headers() {
        let original = headers(3);
        let attributes = encode_attributes(&original, Some("application/json"), true).unwrap();

        assert_eq!(decode_headers(&attributes).unwrap(), original);
    }

    #[test]
    fn test_binary_bodies_are_base64_encoded() {
        let body = [0xff, 0x00, 0x7f];
        let (text, encoded) = encode_body(&body);
        assert!(encoded);

        let attributes = encode_attributes(&Headers::new(), None, encoded).unwrap();
        assert_eq!(decode_body(&text, &attributes).unwrap(), body.to_vec());
    }

    #[test]
    fn test_readable_message_decodes_headers_and_body() {
        let attributes = encode_attributes(&headers(12), None, false).unwrap();

        let envelope = decode_message(&attributes, "{}", "sqs-1", "orders_error").unwrap();

        assert_eq!(envelope.headers, headers(12));
        assert_eq!(envelope.body.as_ref(), b"{}");
        assert_eq!(envelope.native_message_id, "sqs-1");
        assert_eq!(envelope.receive_address, "orders_error");
    }

    #[test]
    fn test_unreadable_headers_are_poisoned_verbatim() {
        let mut attributes = HashMap::new();
        attributes.insert(HEADERS_ATTRIBUTE.to_string(), "{not json".to_string());
        attributes.insert("MT-Reason".to_string(), "fault".to_string());

        let unreadable = decode_message(&attributes, "{}", "sqs-2", "orders_error").unwrap_err();
        assert!(unreadable.reason.contains("headers"));

        let operation = poison_operation(&unreadable.envelope, "Retry.Return.poison");
        assert_eq!(operation.destination, "Retry.Return.poison");
        assert_eq!(operation.native_message_id(), "sqs-2");
        assert_eq!(operation.message.headers[HEADERS_ATTRIBUTE], "{not json");
        assert_eq!(operation.message.headers["MT-Reason"], "fault");
        assert_eq!(operation.message.body.as_ref(), b"{}");
    }

    #[test]
    fn test_unreadable_body_keeps_raw_text() {
        let mut attributes = HashMap::new();
        attributes.insert(BODY_ENCODING_ATTRIBUTE.to_string(), BASE64_ENCODING.to_string());

        let unreadable = decode_message(&attributes, "%%%", "sqs-3", "Retry.Return").unwrap_err();

        assert!(unreadable.reason.contains("body"));
        assert_eq!(unreadable.envelope.body.as_ref(), b"%%%");
        assert_eq!(
            unreadable.envelope.headers[BODY_ENCODING_ATTRIBUTE],
            BASE64_ENCODING
        );
    }

    #[test]
    fn test_text_bodies_are_sent_as_is() {
        let (text, encoded) = encode_body(br#"{"orderId":1}"#);
        assert!(!encoded);
        assert_eq!(text, r#"{"orderId":1}"#);
        assert_eq!(
            decode_body(&text, &HashMap::new()).unwrap(),
            br#"{"orderId":1}"#.to_vec()
        );
    }
}
