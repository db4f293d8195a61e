use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// ConsumerTag identifies one subscription on one queue. It is the only thing needed to cancel
/// that subscription later.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConsumerTag(u64);

impl ConsumerTag {
    pub fn new(tag: u64) -> Self {
        ConsumerTag(tag)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctag-{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueStatus {
    pub message_count: usize,
    pub subscriber_count: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueOptions {
    pub durable: bool,
    /// The broker deletes the queue, and its bindings, once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        QueueOptions {
            durable: true,
            auto_delete: false,
        }
    }

    pub fn transient() -> Self {
        QueueOptions {
            durable: false,
            auto_delete: false,
        }
    }

    /// Non-durable, and gone as soon as nobody consumes it.
    pub fn auto_delete() -> Self {
        QueueOptions {
            durable: false,
            auto_delete: true,
        }
    }
}

/// Acker acknowledges exactly one delivery. It is consumed by `ack()`, so a delivery can't be
/// acked twice. Dropping it without acking leaves the message unacknowledged; the broker will
/// redeliver it once the subscription goes away.
pub struct Acker {
    ack_fn: Box<dyn FnOnce() + Send>,
}

impl Acker {
    pub fn new<F>(ack_fn: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Acker {
            ack_fn: Box::new(ack_fn),
        }
    }

    pub fn ack(self) {
        (self.ack_fn)()
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Acker")
    }
}

#[derive(Debug)]
pub struct Delivery {
    pub payload: Bytes,
    pub acker: Acker,
}

/// Subscription is the receiving end of `Broker::subscribe()`. The stream ends when the broker
/// cancels the subscription (unsubscribe or connection close).
pub struct Subscription {
    tag: ConsumerTag,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(tag: ConsumerTag, deliveries: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Subscription { tag, deliveries }
    }

    pub fn tag(&self) -> ConsumerTag {
        self.tag
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Could not connect to server {0}")]
    CouldNotConnect(String),
    #[error("Broker refused access: {0}")]
    AccessRefused(String),
    #[error("Connection to broker is closed")]
    ConnectionClosed,
    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("Exchange '{0}' does not exist")]
    ExchangeNotFound(String),
    #[error("Failed to declare queue '{queue}': {reason}")]
    DeclareFailed { queue: String, reason: String },
    #[error("No consumer {tag:?} on queue '{queue}'")]
    UnknownConsumer { queue: String, tag: ConsumerTag },
}

impl TransportError {
    /// Only this class of error is worth retrying at startup. Everything else is fatal.
    pub fn is_could_not_connect(&self) -> bool {
        matches!(self, TransportError::CouldNotConnect(_))
    }

    /// The connection is gone for good. A running worker can't carry on after this.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

/// Broker is the subset of a publish/subscribe message broker that cluster coordination needs:
/// durable named queues with acked consumption, a fanout exchange, and queue introspection.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Idempotent. Re-declaring an existing queue is a no-op.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), TransportError>;

    /// Start consuming `queue`. Every delivery must be acked through its `Acker`.
    async fn subscribe(&self, queue: &str) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, queue: &str, tag: ConsumerTag) -> Result<(), TransportError>;

    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Delivers a copy of `payload` to every queue bound to `exchange`.
    async fn publish_to_exchange(&self, exchange: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn queue_status(&self, queue: &str) -> Result<QueueStatus, TransportError>;

    /// Tears down the connection. All subscriptions made through it end.
    async fn close(&self);
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("vhost", &self.vhost)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Broker: Broker;

    async fn connect(&self, config: &BrokerConfig) -> Result<Self::Broker, TransportError>;

    /// Forget any half-open connection state so the next `connect()` starts from scratch.
    async fn hard_reset(&self);
}
