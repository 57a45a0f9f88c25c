//! AMQP (RabbitMQ) session implementation.
//!
//! One `lapin::Connection` per session. Each flow owns a consumer channel;
//! producers share one publish channel. Queues and exchanges are used as
//! provisioned; nothing is declared.
//!
//! Connectivity:
//! - Initial connect walks the host list, retrying each host with
//!   exponential backoff before moving on.
//! - When a flow's stream ends or a publish finds the connection dead, the
//!   session reconnects on a constant interval. Started flows re-issue their
//!   `basic_consume` on the new connection.
//! - Once the reconnect budget is spent the session is lost: lifecycle and
//!   producer sinks are told, and every later send fails with a transport error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions};
use lapin::protocol::{AMQPError, AMQPErrorKind};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    Acknowledge, BusError, Delivery, DeliveryHandler, Flow, FlowProperties, InboundMessage,
    OutboundMessage, Producer, ProducerEventHandler, Result, Session, SessionEvent,
    SessionEventHandler,
};
use crate::config::{BrokerAddress, SessionConfig};
use crate::utils::retry::{connect_backoff, reconnect_backoff};

/// Content type of every published message.
const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Non-persistent delivery.
const DELIVERY_MODE_TRANSIENT: u8 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Error mapping
// ============================================================================

/// Whether a lapin error means the connection itself is gone.
fn is_connection_fault(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::MissingHeartbeatError
    )
}

fn response(error: &AMQPError) -> BusError {
    let subcode = match error.kind() {
        AMQPErrorKind::Soft(kind) => format!("{:?}", kind),
        AMQPErrorKind::Hard(kind) => format!("{:?}", kind),
    };
    BusError::ErrorResponse {
        code: error.get_id(),
        subcode,
        phrase: error.get_message().as_str().to_string(),
    }
}

/// Map a lapin error from a publish or consume call.
///
/// Connection faults are reported as `Connection`: they are recoverable until
/// the reconnect budget runs out.
fn classify(error: &lapin::Error) -> BusError {
    match error {
        lapin::Error::ProtocolError(amqp) => response(amqp),
        e if is_connection_fault(e) => BusError::Connection(e.to_string()),
        other => BusError::Publish(other.to_string()),
    }
}

// ============================================================================
// Connection
// ============================================================================

fn amqp_uri(config: &SessionConfig, host: &BrokerAddress) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone().unwrap_or_default(),
            },
            host: host.host.clone(),
            port: host.port,
        },
        vhost: config.vpn.clone(),
        ..Default::default()
    }
}

/// A live connection plus its shared publish channel.
struct Link {
    connection: Connection,
    publish: Mutex<Channel>,
    host: BrokerAddress,
    generation: u64,
}

impl Link {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn publish_channel(&self) -> Channel {
        lock(&self.publish).clone()
    }
}

struct Inner {
    config: SessionConfig,
    events: Arc<dyn SessionEventHandler>,
    link: Mutex<Option<Arc<Link>>>,
    generation: AtomicU64,
    /// Serializes reconnect attempts from flows and producers.
    reconnect: tokio::sync::Mutex<()>,
    producer_sinks: Mutex<Vec<Arc<dyn ProducerEventHandler>>>,
    flows: Mutex<Vec<Arc<AmqpFlow>>>,
    lost: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        self.events.on_event(&event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lost_error(&self) -> BusError {
        BusError::Transport(format!(
            "{} reconnect attempts failed",
            self.config.reconnect_retries
        ))
    }

    /// The current link, or why there is none.
    fn link(&self) -> Result<Arc<Link>> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if self.lost.load(Ordering::Acquire) {
            return Err(self.lost_error());
        }
        lock(&self.link)
            .clone()
            .ok_or_else(|| BusError::Connection("not connected".to_string()))
    }

    /// Open a connection to one host and its publish channel.
    async fn open(self: &Arc<Self>, host: &BrokerAddress) -> lapin::Result<Arc<Link>> {
        let connection =
            Connection::connect_uri(amqp_uri(&self.config, host), ConnectionProperties::default())
                .await?;
        let publish = connection.create_channel().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let weak: Weak<Inner> = Arc::downgrade(self);
        connection.on_error(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_error(err);
            }
        });

        Ok(Arc::new(Link {
            connection,
            publish: Mutex::new(publish),
            host: host.clone(),
            generation,
        }))
    }

    /// Broker-side connection errors. Rejections go to producer sinks;
    /// transport faults are left to the reconnect path.
    fn on_connection_error(&self, err: lapin::Error) {
        match &err {
            lapin::Error::ProtocolError(amqp) => {
                let error = response(amqp);
                for sink in lock(&self.producer_sinks).iter() {
                    sink.on_error(&error);
                }
            }
            other => warn!(error = %other, "Connection error"),
        }
    }

    /// Walk the host list, retrying each host before moving on.
    async fn dial(self: &Arc<Self>) -> Result<Arc<Link>> {
        let mut last_error = None;

        for host in &self.config.hosts {
            let backoff = connect_backoff(self.config.connect_retries_per_host).build();
            for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
                if attempt > 0 {
                    tokio::time::sleep(delay).await;
                }
                match self.open(host).await {
                    Ok(link) => return Ok(link),
                    Err(e) => {
                        warn!(
                            host = %host,
                            attempt = attempt + 1,
                            max_retries = self.config.connect_retries_per_host,
                            error = %e,
                            "Connect failed"
                        );
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(BusError::Connection(match last_error {
            Some(e) => e.to_string(),
            None => "no hosts configured".to_string(),
        }))
    }

    fn install(&self, link: Arc<Link>) {
        *lock(&self.link) = Some(link);
    }

    /// Reconnect after `seen` stopped working.
    ///
    /// Returns at once if another caller already replaced that link.
    async fn recover(self: &Arc<Self>, seen: u64, reason: &str) -> Result<()> {
        let _guard = self.reconnect.lock().await;

        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if self.lost.load(Ordering::Acquire) {
            return Err(self.lost_error());
        }
        if self.generation.load(Ordering::Acquire) != seen {
            return Ok(());
        }

        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });

        let max = self.config.reconnect_retries;
        let backoff = reconnect_backoff(max, self.config.reconnect_interval).build();
        for (attempt, delay) in backoff.enumerate() {
            tokio::time::sleep(delay).await;
            if self.is_closed() {
                return Err(BusError::Closed);
            }
            self.emit(SessionEvent::Reconnecting {
                attempt: attempt + 1,
                max,
            });

            for host in &self.config.hosts {
                match self.open(host).await {
                    Ok(link) => {
                        let host = link.host.to_string();
                        self.install(link);
                        self.emit(SessionEvent::Reconnected { host });
                        return Ok(());
                    }
                    Err(e) => debug!(host = %host, error = %e, "Reconnect attempt failed"),
                }
            }
        }

        self.lost.store(true, Ordering::Release);
        *lock(&self.link) = None;
        let error = self.lost_error();
        self.emit(SessionEvent::ConnectionLost {
            reason: error.to_string(),
        });
        for sink in lock(&self.producer_sinks).iter() {
            sink.on_error(&error);
        }
        Err(error)
    }

    /// Replace a publish channel the broker closed on a live connection.
    async fn reopen_publish(&self, link: &Link) -> Result<()> {
        let channel = link
            .connection
            .create_channel()
            .await
            .map_err(|e| classify(&e))?;
        *lock(&link.publish) = channel;
        info!(host = %link.host, "Publish channel reopened");
        Ok(())
    }
}

// ============================================================================
// Session
// ============================================================================

/// AMQP session: one connection, reconnecting on transport loss.
pub struct AmqpSession {
    inner: Arc<Inner>,
}

impl AmqpSession {
    /// Connect to the first reachable host in `config.hosts`.
    pub async fn connect(
        config: SessionConfig,
        events: Arc<dyn SessionEventHandler>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            config,
            events,
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect: tokio::sync::Mutex::new(()),
            producer_sinks: Mutex::new(Vec::new()),
            flows: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let link = inner.dial().await?;
        let host = link.host.to_string();
        inner.install(link);

        info!(host = %host, vpn = %inner.config.vpn, "Connected to AMQP");
        inner.emit(SessionEvent::Connected { host });

        Ok(Self { inner })
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn create_producer(
        &self,
        events: Arc<dyn ProducerEventHandler>,
    ) -> Result<Arc<dyn Producer>> {
        self.inner.link()?;
        lock(&self.inner.producer_sinks).push(events);
        Ok(Arc::new(AmqpProducer {
            inner: self.inner.clone(),
        }))
    }

    async fn create_flow(
        &self,
        properties: FlowProperties,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Arc<dyn Flow>> {
        self.inner.link()?;
        let flow = Arc::new_cyclic(|this| AmqpFlow {
            this: this.clone(),
            inner: self.inner.clone(),
            properties,
            handler,
            channel: Mutex::new(None),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        lock(&self.inner.flows).push(flow.clone());
        Ok(flow)
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flows = std::mem::take(&mut *lock(&self.inner.flows));
        for flow in flows {
            flow.close().await?;
        }

        let link = lock(&self.inner.link).take();
        if let Some(link) = link {
            if link.is_connected() {
                link.connection
                    .close(200, "OK")
                    .await
                    .map_err(|e| BusError::Connection(e.to_string()))?;
            }
        }

        info!("AMQP session closed");
        Ok(())
    }
}

// ============================================================================
// Flow
// ============================================================================

/// A consumer on one queue, re-bound after every reconnect.
pub struct AmqpFlow {
    this: Weak<AmqpFlow>,
    inner: Arc<Inner>,
    properties: FlowProperties,
    handler: Arc<dyn DeliveryHandler>,
    channel: Mutex<Option<Channel>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AmqpFlow {
    fn consumer_tag(&self) -> String {
        format!("flowrelay-{}", uuid::Uuid::new_v4())
    }

    async fn subscribe(&self, link: &Link) -> lapin::Result<Consumer> {
        let channel = link.connection.create_channel().await?;
        channel
            .basic_qos(self.inner.config.ack_window, BasicQosOptions::default())
            .await?;
        let consumer = channel
            .basic_consume(
                &self.properties.queue,
                &self.consumer_tag(),
                BasicConsumeOptions {
                    exclusive: self.properties.exclusive,
                    no_ack: !self.properties.client_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        *lock(&self.channel) = Some(channel);
        Ok(consumer)
    }

    async fn deliver(&self, delivery: AmqpDelivery) {
        let AmqpDelivery {
            routing_key,
            properties,
            data,
            redelivered,
            acker,
            ..
        } = delivery;

        let message = InboundMessage {
            topic: routing_key.as_str().to_string(),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            payload: data,
            discard_indication: false,
            redelivered,
        };
        let acker = AmqpAcker {
            acker,
            client_ack: self.properties.client_ack,
        };

        self.handler
            .on_delivery(Delivery::new(message, Box::new(acker)))
            .await;
    }

    /// Feed deliveries to the handler one at a time until the stream ends.
    async fn drain(&self, consumer: &mut Consumer) {
        while let Some(item) = consumer.next().await {
            match item {
                Ok(delivery) => self.deliver(delivery).await,
                Err(e) => {
                    self.handler.on_exception(&classify(&e));
                    break;
                }
            }
        }
    }

    /// Re-bind after the stream ended. `None` when the flow should stop.
    async fn resubscribe(&self, mut generation: u64) -> Option<(Consumer, u64)> {
        loop {
            if self.closed.load(Ordering::Acquire) || !self.inner.config.reapply_subscriptions {
                return None;
            }

            let live = self
                .inner
                .link()
                .map(|link| link.generation == generation && link.is_connected())
                .unwrap_or(false);
            if live {
                // Channel closed under a live connection.
                tokio::time::sleep(self.inner.config.reconnect_interval).await;
            } else if let Err(e) = self
                .inner
                .recover(generation, &format!("flow on '{}' lost", self.properties.queue))
                .await
            {
                debug!(queue = %self.properties.queue, error = %e, "Flow not re-bound");
                return None;
            }

            let link = self.inner.link().ok()?;
            match self.subscribe(&link).await {
                Ok(consumer) => {
                    self.inner.emit(SessionEvent::SubscriptionsReapplied {
                        queue: self.properties.queue.clone(),
                    });
                    return Some((consumer, link.generation));
                }
                Err(e) => {
                    self.handler.on_exception(&classify(&e));
                    if !is_connection_fault(&e) {
                        return None;
                    }
                    generation = link.generation;
                }
            }
        }
    }

    async fn pump(self: Arc<Self>, mut consumer: Consumer, mut generation: u64) {
        loop {
            self.drain(&mut consumer).await;
            match self.resubscribe(generation).await {
                Some((next, next_generation)) => {
                    consumer = next;
                    generation = next_generation;
                }
                None => break,
            }
        }
        debug!(queue = %self.properties.queue, "Flow stopped");
    }
}

#[async_trait]
impl Flow for AmqpFlow {
    async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if lock(&self.task).is_some() {
            return Ok(());
        }

        let link = self.inner.link()?;
        let consumer = self.subscribe(&link).await.map_err(|e| match classify(&e) {
            BusError::Publish(msg) => BusError::Subscribe(msg),
            other => other,
        })?;

        let flow = self.this.upgrade().ok_or(BusError::Closed)?;
        *lock(&self.task) = Some(tokio::spawn(flow.pump(consumer, link.generation)));

        info!(
            queue = %self.properties.queue,
            exclusive = self.properties.exclusive,
            ack_window = self.inner.config.ack_window,
            "Consuming"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "OK").await {
                    debug!(queue = %self.properties.queue, error = %e, "Channel close failed");
                }
            }
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
    client_ack: bool,
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        if !self.client_ack {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Direct publisher on the topic exchange. No confirms, no retries.
struct AmqpProducer {
    inner: Arc<Inner>,
}

fn properties_for(message: &OutboundMessage) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(TEXT_CONTENT_TYPE.into())
        .with_delivery_mode(DELIVERY_MODE_TRANSIENT);
    match &message.correlation_id {
        Some(id) => properties.with_correlation_id(id.as_str().into()),
        None => properties,
    }
}

#[async_trait]
impl Producer for AmqpProducer {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let link = self.inner.link()?;

        let published = link
            .publish_channel()
            .basic_publish(
                &self.inner.config.topic_exchange,
                &message.topic,
                BasicPublishOptions::default(),
                message.text.as_bytes(),
                properties_for(message),
            )
            .await;

        match published {
            // Without confirms the returned confirmation resolves immediately.
            Ok(_confirm) => Ok(()),
            Err(e) if is_connection_fault(&e) || !link.is_connected() => {
                error!(error = %e, topic = %message.topic, "Publish failed; connection down");
                self.inner
                    .recover(link.generation, &e.to_string())
                    .await?;
                Err(BusError::Publish(format!("message dropped during reconnect: {}", e)))
            }
            Err(e @ lapin::Error::InvalidChannelState(_)) => {
                self.inner.reopen_publish(&link).await?;
                Err(classify(&e))
            }
            Err(e) => Err(classify(&e)),
        }
    }
}
