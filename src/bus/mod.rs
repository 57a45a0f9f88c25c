//! Broker session harness.
//!
//! This module contains:
//! - `Session`, `Flow`, `Producer` traits: the broker primitives the pipelines need
//! - `DeliveryHandler`, `ProducerEventHandler`, `SessionEventHandler`: sinks the
//!   application installs to receive deliveries and lifecycle notifications
//! - Message types (`InboundMessage`, `Delivery`, `OutboundMessage`)
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SessionConfig;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpSession;
pub use memory::MemoryBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The transport is gone and every reconnect attempt has failed.
    #[error("Transport lost: {0}")]
    Transport(String),

    /// The broker rejected an operation and supplied a reason.
    #[error("{subcode} ({code}): {phrase}")]
    ErrorResponse {
        code: u16,
        subcode: String,
        phrase: String,
    },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    #[error("Session closed")]
    Closed,
}

impl BusError {
    /// Whether this error means the session can no longer reach the broker.
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }

    /// Subcode and response phrase for broker-side rejections.
    pub fn response(&self) -> Option<(&str, &str)> {
        match self {
            BusError::ErrorResponse {
                subcode, phrase, ..
            } => Some((subcode.as_str(), phrase.as_str())),
            _ => None,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// An immutable delivery from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was originally published on.
    pub topic: String,
    /// Application-supplied correlation id, if any.
    pub correlation_id: Option<String>,
    pub payload: Vec<u8>,
    /// Broker signalled that messages were discarded before this one.
    pub discard_indication: bool,
    pub redelivered: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_discard_indication(mut self) -> Self {
        self.discard_indication = true;
        self
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Destination: {}, CorrelationId: {}, Redelivered: {}, Payload: {} bytes",
            self.topic,
            self.correlation_id.as_deref().unwrap_or("-"),
            self.redelivered,
            self.payload.len()
        )
    }
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// A message handed to a `DeliveryHandler`, together with the means to
/// acknowledge it.
///
/// `ack` consumes the delivery, so it can be acknowledged at most once.
pub struct Delivery {
    message: InboundMessage,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: InboundMessage, acker: Box<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Acknowledge the delivery. Failures are returned but the delivery is gone
    /// either way; the broker redelivers unacknowledged messages on its own.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// A text message to publish with direct (non-persistent) delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub text: String,
    pub correlation_id: Option<String>,
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives deliveries from a started flow.
///
/// Implementations may assume serial invocation: a flow never calls
/// `on_delivery` again until the previous call has returned. Backends that
/// receive concurrently must re-serialize before calling in.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, delivery: Delivery);

    /// Flow-level error that did not come with a message.
    fn on_exception(&self, error: &BusError) {
        tracing::error!(error = %error, "Consumer received exception");
    }
}

/// Asynchronous producer notifications (access violations, transport loss).
pub trait ProducerEventHandler: Send + Sync {
    fn on_error(&self, error: &BusError);
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { host: String },
    Disconnected { reason: String },
    Reconnecting { attempt: usize, max: usize },
    Reconnected { host: String },
    /// A flow re-bound its queue after a reconnect.
    SubscriptionsReapplied { queue: String },
    /// Every reconnect attempt failed. Terminal.
    ConnectionLost { reason: String },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::ConnectionLost { .. })
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connected { host } => write!(f, "UP_NOTICE: connected to {}", host),
            SessionEvent::Disconnected { reason } => write!(f, "DOWN: {}", reason),
            SessionEvent::Reconnecting { attempt, max } => {
                write!(f, "RECONNECTING: attempt {}/{}", attempt, max)
            }
            SessionEvent::Reconnected { host } => write!(f, "RECONNECTED: {}", host),
            SessionEvent::SubscriptionsReapplied { queue } => {
                write!(f, "SUBSCRIPTIONS_REAPPLIED: {}", queue)
            }
            SessionEvent::ConnectionLost { reason } => write!(f, "DOWN_ERROR: {}", reason),
        }
    }
}

pub trait SessionEventHandler: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

// ============================================================================
// Session primitives
// ============================================================================

/// How a flow binds to its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowProperties {
    pub queue: String,
    pub exclusive: bool,
    /// When true the application acknowledges every message explicitly.
    pub client_ack: bool,
}

impl FlowProperties {
    /// Exclusive access, client acknowledgement.
    pub fn exclusive(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exclusive: true,
            client_ack: true,
        }
    }
}

/// A bound subscription to one queue.
#[async_trait]
pub trait Flow: Send + Sync {
    /// Begin delivering messages to the flow's handler.
    async fn start(&self) -> Result<()>;

    /// Stop delivery. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Send-side handle for direct publishing.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// An authenticated attachment to one broker.
///
/// Closing the session tears down every flow and producer created from it.
#[async_trait]
pub trait Session: Send + Sync {
    async fn create_producer(
        &self,
        events: Arc<dyn ProducerEventHandler>,
    ) -> Result<Arc<dyn Producer>>;

    async fn create_flow(
        &self,
        properties: FlowProperties,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Arc<dyn Flow>>;

    /// Close the session. Only the first call has any effect.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Connect a broker session for the given configuration.
///
/// Requires the `amqp` feature (included in default).
pub async fn connect_session(
    config: &SessionConfig,
    events: Arc<dyn SessionEventHandler>,
) -> Result<Arc<dyn Session>> {
    #[cfg(feature = "amqp")]
    {
        let session = AmqpSession::connect(config.clone(), events).await?;
        tracing::info!(vpn = %config.vpn, username = %config.username, "Session connected");
        Ok(Arc::new(session))
    }

    #[cfg(not(feature = "amqp"))]
    {
        let _ = (config, events);
        Err(BusError::Connection(
            "AMQP support requires the 'amqp' feature. Rebuild with --features amqp".to_string(),
        ))
    }
}
