//! In-memory broker.
//!
//! Implements `Session` over named in-process queues. Flows drain their queue
//! on a tokio task, one delivery at a time, like a real client library's
//! dispatcher. Published messages are recorded and optionally routed into
//! queues subscribed to their topic.
//!
//! Fault injection hooks let tests exercise the failure paths: failed sends,
//! asynchronous producer errors, and session lifecycle events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    Acknowledge, BusError, Delivery, DeliveryHandler, Flow, FlowProperties, InboundMessage,
    OutboundMessage, Producer, ProducerEventHandler, Result, Session, SessionEvent,
    SessionEventHandler,
};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u64, InboundMessage)>,
    notify: Arc<Notify>,
    /// Exclusive mode of the flow currently bound, if any.
    bound: Option<bool>,
    /// Topics whose published messages are copied into this queue.
    subscriptions: Vec<String>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Mutex<Vec<OutboundMessage>>,
    publish_failures: Mutex<VecDeque<BusError>>,
    ack_counts: Mutex<HashMap<u64, usize>>,
    acks: watch::Sender<usize>,
    delivered: AtomicUsize,
    next_id: AtomicU64,
    producer_events: Mutex<Vec<Arc<dyn ProducerEventHandler>>>,
    session_events: Option<Arc<dyn SessionEventHandler>>,
    flows: Mutex<Vec<Arc<MemoryFlow>>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not wedge every other assertion.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process broker and session in one.
///
/// Cloning shares the same broker state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Broker whose lifecycle events go to `events`.
    pub fn with_session_events(events: Arc<dyn SessionEventHandler>) -> Self {
        Self::build(Some(events))
    }

    fn build(session_events: Option<Arc<dyn SessionEventHandler>>) -> Self {
        let (acks, _) = watch::channel(0);
        let broker = Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                publish_failures: Mutex::new(VecDeque::new()),
                ack_counts: Mutex::new(HashMap::new()),
                acks,
                delivered: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                producer_events: Mutex::new(Vec::new()),
                session_events,
                flows: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
            }),
        };
        broker.emit_session_event(SessionEvent::Connected {
            host: "memory".to_string(),
        });
        broker
    }

    /// Append a message to a durable queue, creating the queue if needed.
    /// Returns the message id used for acknowledgement bookkeeping.
    pub fn enqueue(&self, queue: &str, message: InboundMessage) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = {
            let mut queues = lock(&self.inner.queues);
            let state = queues.entry(queue.to_string()).or_default();
            state.pending.push_back((id, message));
            state.notify.clone()
        };
        notify.notify_one();
        id
    }

    /// Copy every message published on `topic` into `queue`.
    pub fn subscribe_queue(&self, queue: &str, topic: &str) {
        let mut queues = lock(&self.inner.queues);
        queues
            .entry(queue.to_string())
            .or_default()
            .subscriptions
            .push(topic.to_string());
    }

    /// Messages still waiting in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.inner.queues)
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Make the next send fail with `error`. Calls stack up in order.
    pub fn fail_next_publish(&self, error: BusError) {
        lock(&self.inner.publish_failures).push_back(error);
    }

    /// Deliver an asynchronous error to every producer's error sink.
    pub fn raise_producer_event(&self, error: BusError) {
        let handlers = lock(&self.inner.producer_events).clone();
        for handler in handlers {
            handler.on_error(&error);
        }
    }

    /// Deliver a lifecycle event to the session's event sink.
    pub fn emit_session_event(&self, event: SessionEvent) {
        if let Some(handler) = &self.inner.session_events {
            handler.on_event(&event);
        }
    }

    /// Everything successfully published, in publish order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.inner.published).clone()
    }

    /// Total acknowledgements received.
    pub fn ack_count(&self) -> usize {
        *self.inner.acks.borrow()
    }

    /// Deliveries handed to flow handlers.
    pub fn delivered_count(&self) -> usize {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Acknowledgements received for one message id.
    pub fn acks_for(&self, id: u64) -> usize {
        lock(&self.inner.ack_counts).get(&id).copied().unwrap_or(0)
    }

    /// Times `close` actually closed the session (0 or 1).
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until at least `n` acknowledgements have arrived.
    pub async fn wait_for_acks(&self, n: usize, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.acks.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|count| *count >= n).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Ack(format!(
                "timed out waiting for {} acks (have {})",
                n,
                self.ack_count()
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn record_ack(&self, id: u64) {
        *lock(&self.inner.ack_counts).entry(id).or_insert(0) += 1;
        self.inner.acks.send_modify(|count| *count += 1);
    }

    fn route(&self, message: &OutboundMessage) {
        let targets: Vec<String> = lock(&self.inner.queues)
            .iter()
            .filter(|(_, q)| q.subscriptions.iter().any(|t| t == &message.topic))
            .map(|(name, _)| name.clone())
            .collect();

        for queue in targets {
            let mut inbound = InboundMessage::new(&message.topic, message.text.as_bytes());
            inbound.correlation_id = message.correlation_id.clone();
            self.enqueue(&queue, inbound);
        }
    }
}

#[async_trait]
impl Session for MemoryBroker {
    async fn create_producer(
        &self,
        events: Arc<dyn ProducerEventHandler>,
    ) -> Result<Arc<dyn Producer>> {
        self.ensure_open()?;
        lock(&self.inner.producer_events).push(events);
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
        }))
    }

    async fn create_flow(
        &self,
        properties: FlowProperties,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Arc<dyn Flow>> {
        self.ensure_open()?;

        let notify = {
            let mut queues = lock(&self.inner.queues);
            let state = queues.entry(properties.queue.clone()).or_default();
            if let Some(bound_exclusive) = state.bound {
                if bound_exclusive || properties.exclusive {
                    return Err(BusError::AccessDenied(format!(
                        "queue '{}' already has an exclusive consumer",
                        properties.queue
                    )));
                }
            }
            state.bound = Some(properties.exclusive);
            state.notify.clone()
        };

        let flow = Arc::new_cyclic(|this| MemoryFlow {
            this: this.clone(),
            broker: self.clone(),
            properties,
            handler,
            notify,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        lock(&self.inner.flows).push(flow.clone());

        info!(queue = %flow.properties.queue, "Flow bound");
        Ok(flow)
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.close_count.fetch_add(1, Ordering::Relaxed);

        let flows = std::mem::take(&mut *lock(&self.inner.flows));
        for flow in flows {
            flow.close().await?;
        }

        info!("Memory session closed");
        Ok(())
    }
}

/// A flow draining one in-memory queue.
pub struct MemoryFlow {
    this: Weak<MemoryFlow>,
    broker: MemoryBroker,
    properties: FlowProperties,
    handler: Arc<dyn DeliveryHandler>,
    notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryFlow {
    fn next_message(&self) -> Option<(u64, InboundMessage)> {
        lock(&self.broker.inner.queues)
            .get_mut(&self.properties.queue)
            .and_then(|q| q.pending.pop_front())
    }

    async fn dispatch(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            match self.next_message() {
                Some((id, message)) => {
                    self.broker.inner.delivered.fetch_add(1, Ordering::Relaxed);
                    let acker = MemoryAcker {
                        broker: self.broker.clone(),
                        id,
                        client_ack: self.properties.client_ack,
                    };
                    let auto_ack = !self.properties.client_ack;
                    self.handler
                        .on_delivery(Delivery::new(message, Box::new(acker)))
                        .await;
                    if auto_ack {
                        self.broker.record_ack(id);
                    }
                }
                None => self.notify.notified().await,
            }
        }
        debug!(queue = %self.properties.queue, "Flow dispatcher stopped");
    }
}

#[async_trait]
impl Flow for MemoryFlow {
    async fn start(&self) -> Result<()> {
        self.broker.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let flow = self.this.upgrade().ok_or(BusError::Closed)?;

        let mut task = lock(&self.task);
        if task.is_none() {
            *task = Some(tokio::spawn(flow.dispatch()));
            info!(queue = %self.properties.queue, "Flow started");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if let Some(state) = lock(&self.broker.inner.queues).get_mut(&self.properties.queue) {
            state.bound = None;
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    id: u64,
    client_ack: bool,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.broker.ensure_open()?;
        if self.client_ack {
            self.broker.record_ack(self.id);
        }
        Ok(())
    }
}

/// Producer that records sends on the broker.
struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        self.broker.ensure_open()?;

        if let Some(error) = lock(&self.broker.inner.publish_failures).pop_front() {
            return Err(error);
        }

        lock(&self.broker.inner.published).push(message.clone());
        self.broker.route(message);
        Ok(())
    }
}
