//! AMQP (RabbitMQ) transport.
//!
//! Sends go to the default exchange with the destination queue as routing
//! key, so no bindings are needed. Headers travel as an AMQP field table;
//! the message id and content type travel as native properties.
//!
//! Queue listing and queue length come from the management API
//! (`discovery::RabbitMqManagementClient`), not from this module.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    deliver, BrokerKind, DeliveryOutcome, Headers, HostSettings, MessageDispatcher,
    MessageEnvelope, MessageHandler, MessageReceiver, ReceiveSettings, Result, TransportError,
    TransportFactory, TransportInfrastructure, TransportOperation, PROPERTY_CONTENT_TYPE,
    PROPERTY_MESSAGE_ID,
};
use crate::config::AmqpConfig;
use crate::utils::bootstrap::connect_with_retry;

/// Connection attempts before `create` gives up.
const CONNECT_ATTEMPTS: u32 = 5;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// RabbitMQ transport factory.
#[derive(Clone)]
pub struct AmqpTransport {
    pool: Pool,
    config: AmqpConfig,
}

impl AmqpTransport {
    /// Build the connection pool. Nothing connects until `create`.
    pub fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to create pool: {}", e)))?;
        Ok(Self { pool, config })
    }

    async fn channel(&self) -> Result<Channel> {
        open_channel(&self.pool).await
    }

    async fn declare(&self, queue: &str, passive: bool) -> Result<()> {
        // A failed passive declare closes the channel, so each check gets
        // its own.
        let channel = self.channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    passive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                if passive {
                    TransportError::QueueNotFound(queue.to_string())
                } else {
                    TransportError::Setup(format!("Failed to declare queue '{}': {}", queue, e))
                }
            })?;
        let _ = channel.close(200, "OK").await;
        Ok(())
    }
}

async fn open_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        TransportError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))
}

// ============================================================================
// Header conversion
// ============================================================================

/// Headers as an AMQP field table of long strings.
fn to_field_table(headers: &Headers) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(value.clone().into()),
            )
        })
        .collect();
    FieldTable::from(table)
}

/// String form of a header value. Nested tables and arrays are skipped.
fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        _ => None,
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match header_value(value) {
            Some(value) => Some((key.as_str().to_string(), value)),
            None => {
                debug!(header = %key.as_str(), "Skipping non-scalar AMQP header");
                None
            }
        })
        .collect()
}

/// Native properties for an outgoing operation.
fn properties_for(operation: &TransportOperation) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_headers(to_field_table(&operation.message.headers))
        .with_message_id(operation.native_message_id().to_string().into())
        .with_delivery_mode(PERSISTENT);
    if let Some(content_type) = operation.property(PROPERTY_CONTENT_TYPE) {
        properties = properties.with_content_type(content_type.to_string().into());
    }
    properties
}

fn envelope_from(delivery: &lapin::message::Delivery, address: &str) -> MessageEnvelope {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    let native_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    MessageEnvelope::new(native_id, headers, delivery.data.clone(), address)
}

// ============================================================================
// Dispatch
// ============================================================================

struct AmqpDispatcher {
    pool: Pool,
}

#[async_trait]
impl MessageDispatcher for AmqpDispatcher {
    async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<()> {
        let channel = open_channel(&self.pool).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to enable confirms: {}", e)))?;

        for operation in &operations {
            let destination = operation.destination.clone();
            let failed = |message: String| TransportError::Dispatch {
                destination: destination.clone(),
                message,
            };

            let confirm = channel
                .basic_publish(
                    "",
                    &operation.destination,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    &operation.message.body,
                    properties_for(operation),
                )
                .await
                .map_err(|e| failed(format!("Failed to publish: {}", e)))?
                .await
                .map_err(|e| failed(format!("Publish confirmation failed: {}", e)))?;

            match confirm {
                Confirmation::Ack(None) | Confirmation::NotRequested => {}
                Confirmation::Ack(Some(_)) => {
                    return Err(TransportError::QueueNotFound(operation.destination.clone()));
                }
                Confirmation::Nack(_) => {
                    return Err(failed("Broker rejected the message".to_string()));
                }
            }
            debug!(destination = %operation.destination, "Published to queue");
        }

        let _ = channel.close(200, "OK").await;
        Ok(())
    }
}

// ============================================================================
// Receive
// ============================================================================

struct AmqpReceiver {
    pool: Pool,
    host: HostSettings,
    settings: ReceiveSettings,
    prefetch_count: u16,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AmqpReceiver {
    fn new(pool: Pool, host: HostSettings, settings: ReceiveSettings, prefetch_count: u16) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool,
            host,
            settings,
            prefetch_count,
            stop_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }

    fn consumer_tag(&self) -> String {
        format!("fault-bridge-{}-{}", self.settings.id, Uuid::new_v4())
    }
}

async fn consume_loop(
    channel: Channel,
    mut consumer: lapin::Consumer,
    consumer_tag: String,
    host: HostSettings,
    address: String,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let delivery = tokio::select! {
            next = consumer.next() => next,
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                host.raise_critical(
                    &format!("Receiver for '{}' lost its broker connection", address),
                    &TransportError::Connection(e.to_string()),
                );
                break;
            }
            None => {
                host.raise_critical(
                    &format!("Consumer for '{}' was cancelled by the broker", address),
                    &TransportError::Receive("consumer stream ended".to_string()),
                );
                break;
            }
        };

        let envelope = envelope_from(&delivery, &address);
        let native_id = envelope.native_message_id.clone();
        let settled = match deliver(handler.as_ref(), envelope, &mut stop).await {
            DeliveryOutcome::Completed => {
                debug!(queue = %address, native_id = %native_id, "Message completed");
                delivery.ack(BasicAckOptions::default()).await
            }
            DeliveryOutcome::Abandoned => {
                debug!(queue = %address, native_id = %native_id, "Message abandoned");
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = settled {
            error!(queue = %address, native_id = %native_id, error = %e, "Failed to settle message");
        }
    }

    if let Err(e) = channel
        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
        .await
    {
        warn!(queue = %address, error = %e, "Failed to cancel consumer");
    }
    let _ = channel.close(200, "OK").await;
    debug!(queue = %address, "AMQP receiver stopped");
}

#[async_trait]
impl MessageReceiver for AmqpReceiver {
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
        let channel = open_channel(&self.pool).await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Receive(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = self.consumer_tag();
        let consumer = channel
            .basic_consume(
                &address,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Receive(format!("Failed to start consumer: {}", e)))?;

        self.stop_tx.send_replace(false);
        *task = Some(tokio::spawn(consume_loop(
            channel,
            consumer,
            consumer_tag,
            self.host.clone(),
            address.clone(),
            handler,
            self.stop_tx.subscribe(),
        )));

        info!(receiver = %self.settings.id, queue = %address, "AMQP receiver started");
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

struct AmqpInfrastructure {
    dispatcher: Arc<AmqpDispatcher>,
    receivers: Vec<Arc<dyn MessageReceiver>>,
}

#[async_trait]
impl TransportInfrastructure for AmqpInfrastructure {
    fn dispatcher(&self) -> Arc<dyn MessageDispatcher> {
        self.dispatcher.clone()
    }

    fn receivers(&self) -> Vec<Arc<dyn MessageReceiver>> {
        self.receivers.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        // Channels are closed by their owners; pooled connections stay open
        // for the next generation.
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for AmqpTransport {
    fn kind(&self) -> BrokerKind {
        BrokerKind::RabbitMq
    }

    async fn create(
        &self,
        host: HostSettings,
        receivers: Vec<ReceiveSettings>,
        sending_addresses: Vec<String>,
    ) -> Result<Box<dyn TransportInfrastructure>> {
        let probe = connect_with_retry("amqp", &self.config.url, CONNECT_ATTEMPTS, || {
            self.channel()
        })
        .await?;
        let _ = probe.close(200, "OK").await;

        if host.setup_infrastructure {
            for settings in &receivers {
                self.declare(&settings.receive_address, false).await?;
                self.declare(&settings.error_queue, false).await?;
            }
            for address in &sending_addresses {
                self.declare(address, false).await?;
            }
            info!(
                host = %host.name,
                receivers = receivers.len(),
                senders = sending_addresses.len(),
                "Declared RabbitMQ queues"
            );
        } else {
            for settings in &receivers {
                if let Err(e) = self.declare(&settings.receive_address, true).await {
                    warn!(queue = %settings.receive_address, "Receive queue does not exist");
                    return Err(e);
                }
            }
        }

        let receivers = receivers
            .into_iter()
            .map(|settings| {
                Arc::new(AmqpReceiver::new(
                    self.pool.clone(),
                    host.clone(),
                    settings,
                    self.config.prefetch_count,
                )) as Arc<dyn MessageReceiver>
            })
            .collect();

        Ok(Box::new(AmqpInfrastructure {
            dispatcher: Arc::new(AmqpDispatcher {
                pool: self.pool.clone(),
            }),
            receivers,
        }))
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test --features amqp amqp_integration -- --ignored
#[cfg(test)]
mod amqp_integration {
    use super::*;
    use crate::bus::{ErrorContext, ErrorHandleResult, OutgoingMessage};
    use crate::error::BridgeError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn transport() -> AmqpTransport {
        let url = std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string());
        AmqpTransport::new(AmqpConfig {
            url,
            ..AmqpConfig::default()
        })
        .unwrap()
    }

    struct Forwarding(mpsc::UnboundedSender<MessageEnvelope>);

    #[async_trait]
    impl MessageHandler for Forwarding {
        async fn on_message(&self, envelope: &mut MessageEnvelope) -> std::result::Result<(), BridgeError> {
            let _ = self.0.send(envelope.clone());
            Ok(())
        }

        async fn on_error(&self, _context: ErrorContext<'_>) -> ErrorHandleResult {
            ErrorHandleResult::Handled
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_send_and_receive() {
        let queue = format!("fault-bridge-test-{}", Uuid::new_v4());
        let infrastructure = transport()
            .create(
                HostSettings::new("test", true),
                vec![ReceiveSettings::new("test", &queue, &queue)],
                vec![queue.clone()],
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = infrastructure.receivers()[0].clone();
        receiver.start(Arc::new(Forwarding(tx))).await.unwrap();

        let operation = TransportOperation::new(
            &queue,
            OutgoingMessage {
                message_id: "msg-1".to_string(),
                headers: headers_with_reason(),
                body: bytes::Bytes::from_static(b"{}"),
            },
        );
        infrastructure.dispatcher().dispatch(vec![operation]).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");
        assert_eq!(received.native_message_id, "msg-1");
        assert_eq!(received.header("MT-Reason"), Some("fault"));

        receiver.stop().await.unwrap();
        infrastructure.shutdown().await.unwrap();
    }

    fn headers_with_reason() -> Headers {
        let mut headers = Headers::new();
        headers.insert("MT-Reason".to_string(), "fault".to_string());
        headers
    }
}
