//! Transport abstraction for the bridge.
//!
//! This module contains:
//! - `MessageEnvelope`: an inbound message as seen by the handlers
//! - `TransportOperation`: an outbound send with native properties
//! - `TransportFactory` / `TransportInfrastructure`: per-broker construction
//! - `MessageDispatcher`, `MessageReceiver`, `MessageHandler` traits
//! - Implementations: in-memory channel, AMQP (RabbitMQ), SQS, Mock

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, info};

use crate::config::{BrokerConfig, BrokerType};
use crate::discovery::{FileQueueInformationProvider, QueueInformationProvider, QueueLengthProvider};
use crate::error::BridgeError;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;
pub mod pipeline;
#[cfg(feature = "sqs")]
pub mod sqs;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "channel")]
pub use channel::InMemoryBroker;
pub use mock::MockDispatcher;
pub use pipeline::{deliver, DeliveryOutcome};
#[cfg(feature = "sqs")]
pub use sqs::SqsTransport;

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by a broker while setting up, sending or receiving.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Dispatch to '{destination}' failed: {message}")]
    Dispatch {
        destination: String,
        message: String,
    },

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("Queue setup failed: {0}")]
    Setup(String),

    #[error("Broker '{0}' is not compiled into this build")]
    Unsupported(String),
}

// ============================================================================
// Messages
// ============================================================================

/// Ordered header mapping carried by every message.
pub type Headers = BTreeMap<String, String>;

/// Side-channel property holding the broker-native content type.
pub const PROPERTY_CONTENT_TYPE: &str = "Content-Type";
/// Side-channel property holding the broker-native message id (MIME style).
pub const PROPERTY_MESSAGE_ID: &str = "Message-ID";

/// A message received from a queue.
///
/// Receivers create one envelope per delivery. Handlers mutate the headers
/// in place; the body is never rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// Broker-assigned identifier of the delivery.
    pub native_message_id: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Queue the message was received from.
    pub receive_address: String,
    /// Consecutive processing failures observed for this message, including
    /// the one being reported.
    pub immediate_failures: u32,
}

impl MessageEnvelope {
    pub fn new(
        native_message_id: impl Into<String>,
        headers: Headers,
        body: impl Into<Bytes>,
        receive_address: impl Into<String>,
    ) -> Self {
        Self {
            native_message_id: native_message_id.into(),
            headers,
            body: body.into(),
            receive_address: receive_address.into(),
            immediate_failures: 0,
        }
    }

    /// Get a header value by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// The message part of an outgoing send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// A single send to a destination queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOperation {
    pub destination: String,
    pub message: OutgoingMessage,
    /// Broker-native fields that cannot always travel as ordinary headers.
    pub properties: BTreeMap<String, String>,
}

impl TransportOperation {
    pub fn new(destination: impl Into<String>, message: OutgoingMessage) -> Self {
        Self {
            destination: destination.into(),
            message,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Native message id: the property when set, otherwise the message id.
    pub fn native_message_id(&self) -> &str {
        self.property(PROPERTY_MESSAGE_ID)
            .unwrap_or(&self.message.message_id)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Sends transport operations to their destinations.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Dispatch operations in order. Fails on the first rejected send.
    async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<()>;
}

/// Outcome of a handler's error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The message was dealt with (for instance moved to the poison queue)
    /// and must leave the input queue.
    Handled,
    /// Redeliver the same message to the same receiver after the delay.
    RetryRequired { delay: Duration },
}

/// Failure details passed to `MessageHandler::on_error`.
pub struct ErrorContext<'a> {
    /// The message as it was received, before any handler mutation.
    pub envelope: &'a MessageEnvelope,
    pub error: &'a BridgeError,
}

/// Processes messages delivered by a receiver.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, envelope: &mut MessageEnvelope) -> std::result::Result<(), BridgeError>;

    async fn on_error(&self, context: ErrorContext<'_>) -> ErrorHandleResult;
}

/// A running consumer bound to one queue.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    fn id(&self) -> &str;

    fn receive_address(&self) -> &str;

    /// Start pumping messages into the handler.
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stop receiving and wait for the in-flight message to finish.
    async fn stop(&self) -> Result<()>;
}

/// Describes a receiver the infrastructure must create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSettings {
    pub id: String,
    pub receive_address: String,
    pub error_queue: String,
}

impl ReceiveSettings {
    pub fn new(
        id: impl Into<String>,
        receive_address: impl Into<String>,
        error_queue: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            receive_address: receive_address.into(),
            error_queue: error_queue.into(),
        }
    }
}

/// Callback invoked when the transport hits an unrecoverable error.
pub type CriticalErrorHook = Arc<dyn Fn(&str, &TransportError) + Send + Sync>;

/// Host-level settings passed to the transport factory.
#[derive(Clone)]
pub struct HostSettings {
    pub name: String,
    /// Declare queues instead of only verifying them.
    pub setup_infrastructure: bool,
    pub on_critical_error: CriticalErrorHook,
}

impl HostSettings {
    pub fn new(name: impl Into<String>, setup_infrastructure: bool) -> Self {
        Self {
            name: name.into(),
            setup_infrastructure,
            on_critical_error: Arc::new(|message: &str, error: &TransportError| {
                error!(error = %error, "Critical transport error: {}", message);
            }),
        }
    }

    pub fn with_critical_error_hook(mut self, hook: CriticalErrorHook) -> Self {
        self.on_critical_error = hook;
        self
    }

    /// Report an unrecoverable transport error to the host.
    pub fn raise_critical(&self, message: &str, error: &TransportError) {
        (self.on_critical_error)(message, error);
    }
}

/// A running transport: one dispatcher plus the requested receivers.
#[async_trait]
pub trait TransportInfrastructure: Send + Sync {
    fn dispatcher(&self) -> Arc<dyn MessageDispatcher>;

    fn receivers(&self) -> Vec<Arc<dyn MessageReceiver>>;

    /// Release broker connections. Receivers must already be stopped.
    async fn shutdown(&self) -> Result<()>;
}

/// Builds transport infrastructure for one broker.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> BrokerKind;

    async fn create(
        &self,
        host: HostSettings,
        receivers: Vec<ReceiveSettings>,
        sending_addresses: Vec<String>,
    ) -> Result<Box<dyn TransportInfrastructure>>;
}

/// Broker family, used for addressing conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    InMemory,
    RabbitMq,
    AmazonSqs,
}

impl BrokerKind {
    /// Prefix MassTransit expects in front of a queue reference.
    pub fn queue_address_prefix(&self) -> &'static str {
        match self {
            BrokerKind::RabbitMq => "exchange:",
            BrokerKind::InMemory | BrokerKind::AmazonSqs => "queue:",
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Everything the services need from a broker.
#[derive(Clone)]
pub struct Broker {
    pub factory: Arc<dyn TransportFactory>,
    pub queues: Arc<dyn QueueInformationProvider>,
    pub lengths: Option<Arc<dyn QueueLengthProvider>>,
}

impl Broker {
    pub fn kind(&self) -> BrokerKind {
        self.factory.kind()
    }
}

/// Connect to the configured broker.
///
/// When `queues_file` is set, queue enumeration reads that file while
/// existence checks still go to the broker.
pub async fn init_broker(config: &BrokerConfig) -> std::result::Result<Broker, BridgeError> {
    let broker = match config.broker_type {
        BrokerType::Channel => {
            #[cfg(feature = "channel")]
            {
                info!(broker = "channel", "Using in-memory broker");
                let broker = InMemoryBroker::new();
                Broker {
                    factory: Arc::new(broker.clone()),
                    queues: Arc::new(broker.clone()),
                    lengths: Some(Arc::new(broker)),
                }
            }
            #[cfg(not(feature = "channel"))]
            {
                return Err(TransportError::Unsupported("channel".to_string()).into());
            }
        }
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let transport = AmqpTransport::new(config.amqp.clone())?;
                let management = Arc::new(crate::discovery::RabbitMqManagementClient::new(
                    &config.amqp,
                )?);
                info!(broker = "amqp", url = %config.amqp.url, "Using RabbitMQ broker");
                Broker {
                    factory: Arc::new(transport),
                    queues: management.clone(),
                    lengths: Some(management),
                }
            }
            #[cfg(not(feature = "amqp"))]
            {
                return Err(TransportError::Unsupported("amqp".to_string()).into());
            }
        }
        BrokerType::Sqs => {
            #[cfg(feature = "sqs")]
            {
                let transport = SqsTransport::connect(config.sqs.clone()).await;
                info!(broker = "sqs", region = ?config.sqs.region, "Using SQS broker");
                Broker {
                    factory: Arc::new(transport.clone()),
                    queues: Arc::new(transport.clone()),
                    lengths: Some(Arc::new(transport)),
                }
            }
            #[cfg(not(feature = "sqs"))]
            {
                return Err(TransportError::Unsupported("sqs".to_string()).into());
            }
        }
    };

    match &config.queues_file {
        Some(path) => {
            info!(path = %path, "Reading queue list from file");
            Ok(Broker {
                queues: Arc::new(
                    FileQueueInformationProvider::new(path).with_existence(broker.queues.clone()),
                ),
                ..broker
            })
        }
        None => Ok(broker),
    }
}
