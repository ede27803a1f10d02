//! In-memory broker for local development and tests.
//!
//! Queues are FIFO deques held in process. Each receiver runs a tokio task
//! that pops messages, runs the delivery loop and puts abandoned messages
//! back at the head of the queue. The broker also answers queue listing,
//! existence and length queries, so one instance covers every broker role.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    deliver, BrokerKind, DeliveryOutcome, Headers, HostSettings, MessageDispatcher,
    MessageEnvelope, MessageHandler, MessageReceiver, ReceiveSettings, Result, TransportError,
    TransportFactory, TransportInfrastructure, TransportOperation,
};
use crate::discovery::{self, DiscoveryError, QueueInformationProvider, QueueLengthProvider};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message at rest in an in-memory queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub native_message_id: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Native properties the sender set (content type, message id).
    pub properties: BTreeMap<String, String>,
}

impl StoredMessage {
    fn into_envelope(self, receive_address: &str) -> MessageEnvelope {
        MessageEnvelope::new(self.native_message_id, self.headers, self.body, receive_address)
    }
}

#[derive(Default)]
struct InMemoryQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl InMemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.messages).push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.messages).push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.messages).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[derive(Default)]
struct Inner {
    queues: Mutex<BTreeMap<String, Arc<InMemoryQueue>>>,
    unavailable: AtomicBool,
    /// Remaining forced send failures per destination.
    send_failures: Mutex<HashMap<String, u32>>,
}

/// Process-local broker.
///
/// Cloning shares the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue if it does not exist yet.
    pub fn declare(&self, name: &str) {
        let mut queues = lock(&self.inner.queues);
        if !queues.contains_key(name) {
            debug!(queue = %name, "Declared in-memory queue");
            queues.insert(name.to_string(), Arc::default());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.inner.queues).contains_key(name)
    }

    /// Names of all declared queues, sorted.
    pub fn names(&self) -> Vec<String> {
        lock(&self.inner.queues).keys().cloned().collect()
    }

    /// Number of messages waiting in a queue (0 when it does not exist).
    pub fn depth(&self, name: &str) -> usize {
        self.queue(name).map(|q| q.len()).unwrap_or(0)
    }

    /// Snapshot of the messages waiting in a queue, head first.
    pub fn messages(&self, name: &str) -> Vec<StoredMessage> {
        self.queue(name)
            .map(|q| lock(&q.messages).iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return the head of a queue.
    pub fn pop(&self, name: &str) -> Option<StoredMessage> {
        self.queue(name).and_then(|q| q.pop())
    }

    /// Put a raw message on a queue as a foreign producer would. Returns the
    /// generated native id.
    pub fn enqueue(&self, name: &str, headers: Headers, body: impl Into<Bytes>) -> Result<String> {
        let native_message_id = Uuid::new_v4().to_string();
        self.push(
            name,
            StoredMessage {
                native_message_id: native_message_id.clone(),
                headers,
                body: body.into(),
                properties: BTreeMap::new(),
            },
        )?;
        Ok(native_message_id)
    }

    /// Simulate losing the broker connection.
    ///
    /// While unavailable, sends, listings and transport creation fail and
    /// running receivers report a critical error and stop.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        if unavailable {
            for queue in lock(&self.inner.queues).values() {
                queue.notify.notify_one();
            }
        }
    }

    /// Make the next `times` sends to `destination` fail.
    pub fn fail_sends(&self, destination: &str, times: u32) {
        lock(&self.inner.send_failures).insert(destination.to_string(), times);
    }

    fn is_unavailable(&self) -> bool {
        self.inner.unavailable.load(Ordering::SeqCst)
    }

    fn queue(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        lock(&self.inner.queues).get(name).cloned()
    }

    fn push(&self, destination: &str, message: StoredMessage) -> Result<()> {
        if self.is_unavailable() {
            return Err(TransportError::Connection("in-memory broker unavailable".to_string()));
        }
        if self.take_forced_failure(destination) {
            return Err(TransportError::Dispatch {
                destination: destination.to_string(),
                message: "forced send failure".to_string(),
            });
        }
        let queue = self
            .queue(destination)
            .ok_or_else(|| TransportError::QueueNotFound(destination.to_string()))?;
        queue.push_back(message);
        Ok(())
    }

    fn take_forced_failure(&self, destination: &str) -> bool {
        let mut failures = lock(&self.inner.send_failures);
        match failures.get_mut(destination) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[async_trait]
impl MessageDispatcher for InMemoryBroker {
    async fn dispatch(&self, operations: Vec<TransportOperation>) -> Result<()> {
        for operation in operations {
            let message = StoredMessage {
                native_message_id: operation.native_message_id().to_string(),
                headers: operation.message.headers,
                body: operation.message.body,
                properties: operation.properties,
            };
            self.push(&operation.destination, message)?;
            debug!(destination = %operation.destination, "Dispatched to in-memory queue");
        }
        Ok(())
    }
}

// ============================================================================
// Receive
// ============================================================================

struct ChannelReceiver {
    broker: InMemoryBroker,
    host: HostSettings,
    settings: ReceiveSettings,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChannelReceiver {
    fn new(broker: InMemoryBroker, host: HostSettings, settings: ReceiveSettings) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            broker,
            host,
            settings,
            stop_tx,
            task: tokio::sync::Mutex::new(None),
        }
    }
}

async fn receive_loop(
    broker: InMemoryBroker,
    host: HostSettings,
    queue: Arc<InMemoryQueue>,
    address: String,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        if broker.is_unavailable() {
            host.raise_critical(
                &format!("Receiver for '{}' lost its broker connection", address),
                &TransportError::Connection("in-memory broker unavailable".to_string()),
            );
            break;
        }

        let stored = match queue.pop() {
            Some(stored) => stored,
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
        };

        let envelope = stored.clone().into_envelope(&address);
        match deliver(handler.as_ref(), envelope, &mut stop).await {
            DeliveryOutcome::Completed => {
                debug!(queue = %address, native_id = %stored.native_message_id, "Message completed");
            }
            DeliveryOutcome::Abandoned => {
                debug!(queue = %address, native_id = %stored.native_message_id, "Message abandoned");
                queue.push_front(stored);
                break;
            }
        }
    }
    debug!(queue = %address, "In-memory receiver stopped");
}

#[async_trait]
impl MessageReceiver for ChannelReceiver {
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
        let queue = self
            .broker
            .queue(&address)
            .ok_or_else(|| TransportError::QueueNotFound(address.clone()))?;

        self.stop_tx.send_replace(false);
        *task = Some(tokio::spawn(receive_loop(
            self.broker.clone(),
            self.host.clone(),
            queue,
            address.clone(),
            handler,
            self.stop_tx.subscribe(),
        )));

        info!(receiver = %self.settings.id, queue = %address, "In-memory receiver started");
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

struct ChannelInfrastructure {
    broker: InMemoryBroker,
    receivers: Vec<Arc<dyn MessageReceiver>>,
}

#[async_trait]
impl TransportInfrastructure for ChannelInfrastructure {
    fn dispatcher(&self) -> Arc<dyn MessageDispatcher> {
        Arc::new(self.broker.clone())
    }

    fn receivers(&self) -> Vec<Arc<dyn MessageReceiver>> {
        self.receivers.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for InMemoryBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::InMemory
    }

    async fn create(
        &self,
        host: HostSettings,
        receivers: Vec<ReceiveSettings>,
        sending_addresses: Vec<String>,
    ) -> Result<Box<dyn TransportInfrastructure>> {
        if self.is_unavailable() {
            return Err(TransportError::Connection("in-memory broker unavailable".to_string()));
        }

        if host.setup_infrastructure {
            for settings in &receivers {
                self.declare(&settings.receive_address);
                self.declare(&settings.error_queue);
            }
            for address in &sending_addresses {
                self.declare(address);
            }
        } else if let Some(missing) = receivers
            .iter()
            .find(|settings| !self.contains(&settings.receive_address))
        {
            warn!(queue = %missing.receive_address, "Receive queue does not exist");
            return Err(TransportError::QueueNotFound(missing.receive_address.clone()));
        }

        let receivers = receivers
            .into_iter()
            .map(|settings| {
                Arc::new(ChannelReceiver::new(self.clone(), host.clone(), settings))
                    as Arc<dyn MessageReceiver>
            })
            .collect();

        Ok(Box::new(ChannelInfrastructure {
            broker: self.clone(),
            receivers,
        }))
    }
}

// ============================================================================
// Queue information
// ============================================================================

#[async_trait]
impl QueueInformationProvider for InMemoryBroker {
    fn queues(&self) -> BoxStream<'_, discovery::Result<String>> {
        if self.is_unavailable() {
            return stream::once(async {
                Err(DiscoveryError::Request("in-memory broker unavailable".to_string()))
            })
            .boxed();
        }
        stream::iter(self.names().into_iter().map(Ok)).boxed()
    }

    async fn exists(&self, name: &str) -> discovery::Result<bool> {
        if self.is_unavailable() {
            return Err(DiscoveryError::Request("in-memory broker unavailable".to_string()));
        }
        Ok(self.contains(name))
    }
}

#[async_trait]
impl QueueLengthProvider for InMemoryBroker {
    async fn length(&self, name: &str) -> discovery::Result<u64> {
        self.queue(name)
            .map(|queue| queue.len() as u64)
            .ok_or_else(|| DiscoveryError::Response(format!("queue '{}' not found", name)))
    }
}
