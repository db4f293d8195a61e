use crate::transport::{Acker, Broker, ConsumerTag, QueueOptions, Subscription, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;

const SHARED_CONTROL_QUEUE: &str = "vnode-control--shared";
const BROADCAST_CONTROL_EXCHANGE: &str = "vnode-control--broadcast";

/// NodeIdentity names one worker process for the lifetime of the process. Build it once at
/// startup with `local()` and pass it around; calling `local()` again makes a different node.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(rename = "guid")]
    id: String,
    #[serde(rename = "hostname_f")]
    host: String,
    pid: u32,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>, host: impl Into<String>, pid: u32) -> Self {
        NodeIdentity {
            id: id.into(),
            host: host.into(),
            pid,
        }
    }

    pub fn local(logger: &slog::Logger) -> Result<Self, io::Error> {
        let host = hostname::get()?.to_string_lossy().into_owned();
        let host = fully_qualified(logger, host);

        Ok(NodeIdentity::new(uuid::Uuid::new_v4().to_string(), host, std::process::id()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn identifier(&self) -> String {
        format!("{}--{}--{}", self.host, self.pid, self.id)
    }

    pub fn to_hash(&self) -> serde_json::Value {
        serde_json::json!({
            "guid": self.id,
            "hostname_f": self.host,
            "pid": self.pid,
        })
    }

    /// Extra keys (e.g. `vnodes`) are ignored, so any announcement can be read back as an identity.
    pub fn from_hash(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        NodeIdentity::deserialize(value)
    }

    fn exclusive_control_queue(&self) -> String {
        format!("vnode-control--{}", self.identifier())
    }

    fn broadcast_control_queue(&self) -> String {
        format!("vnode-control--{}--broadcast", self.identifier())
    }
}

// getaddrinfo(3) flag asking for the canonical name. Same value on Linux, the BSDs, macOS and
// Windows.
const AI_CANONNAME: i32 = 0x0002;

/// Resolves `host` to its canonical (fully-qualified) name, like `hostname -f`. Keeps the name it
/// was given when the resolver has nothing better.
fn fully_qualified(logger: &slog::Logger, host: String) -> String {
    match canonical_name(&host) {
        Ok(fqdn) => fqdn,
        Err(e) => {
            slog::warn!(logger, "Could not resolve the fully-qualified name of {}, using it as is: {}", host, e);
            host
        }
    }
}

fn canonical_name(host: &str) -> Result<String, io::Error> {
    let hints = dns_lookup::AddrInfoHints {
        flags: AI_CANONNAME,
        ..dns_lookup::AddrInfoHints::default()
    };
    let mut addresses = dns_lookup::getaddrinfo(Some(host), None, Some(hints))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;

    // Only the first entry carries the canonical name.
    match addresses.next() {
        Some(info) => info?
            .canonname
            .filter(|name| !name.is_empty())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no canonical name")),
        None => Err(io::Error::new(io::ErrorKind::NotFound, "no addresses")),
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

/// Where control-channel deliveries are forwarded. `deliver` returns false once nobody is
/// listening, which ends the forwarding task.
#[async_trait::async_trait]
pub(crate) trait ControlMessageSink: Clone + Send + Sync + 'static {
    async fn deliver(&self, payload: Bytes, acker: Acker) -> bool;

    /// The broker ended a control subscription: either it was cancelled or the connection died.
    async fn channel_closed(&self, channel: &'static str);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ControlChannel {
    Exclusive,
    Shared,
    Broadcast,
}

impl ControlChannel {
    fn name(&self) -> &'static str {
        match self {
            ControlChannel::Exclusive => "exclusive",
            ControlChannel::Shared => "shared",
            ControlChannel::Broadcast => "broadcast",
        }
    }
}

/// ControlChannels owns one node's three control queues:
///
/// - exclusive: addressed to this node alone,
/// - shared: competed for by every node (one receiver per message),
/// - broadcast: this node's auto-delete queue bound to the fanout exchange (every node gets a
///   copy, and the queue disappears with the node's subscription).
///
/// Queues are declared the first time they're needed.
pub(crate) struct ControlChannels<B: Broker> {
    logger: slog::Logger,
    broker: Arc<B>,
    identity: NodeIdentity,
    exclusive_declared: bool,
    shared_declared: bool,
    broadcast_declared: bool,
    consumers: Vec<(ControlChannel, String, ConsumerTag)>,
}

impl<B: Broker> ControlChannels<B> {
    pub(crate) fn new(logger: slog::Logger, broker: Arc<B>, identity: NodeIdentity) -> Self {
        ControlChannels {
            logger,
            broker,
            identity,
            exclusive_declared: false,
            shared_declared: false,
            broadcast_declared: false,
            consumers: Vec::new(),
        }
    }

    async fn exclusive_queue(&mut self) -> Result<String, TransportError> {
        let queue = self.identity.exclusive_control_queue();
        if !self.exclusive_declared {
            self.broker.declare_queue(&queue, QueueOptions::durable()).await?;
            self.exclusive_declared = true;
        }

        Ok(queue)
    }

    async fn shared_queue(&mut self) -> Result<String, TransportError> {
        if !self.shared_declared {
            self.broker
                .declare_queue(SHARED_CONTROL_QUEUE, QueueOptions::durable())
                .await?;
            self.shared_declared = true;
        }

        Ok(SHARED_CONTROL_QUEUE.to_string())
    }

    async fn broadcast_queue(&mut self) -> Result<String, TransportError> {
        let queue = self.identity.broadcast_control_queue();
        if !self.broadcast_declared {
            self.broker.declare_fanout_exchange(BROADCAST_CONTROL_EXCHANGE).await?;
            self.broker.declare_queue(&queue, QueueOptions::auto_delete()).await?;
            self.broker.bind_queue(&queue, BROADCAST_CONTROL_EXCHANGE).await?;
            self.broadcast_declared = true;
        }

        Ok(queue)
    }

    async fn queue_for(&mut self, channel: ControlChannel) -> Result<String, TransportError> {
        match channel {
            ControlChannel::Exclusive => self.exclusive_queue().await,
            ControlChannel::Shared => self.shared_queue().await,
            ControlChannel::Broadcast => self.broadcast_queue().await,
        }
    }

    /// Subscribes to all three control queues, forwarding every delivery to `sink`.
    pub(crate) async fn start<S: ControlMessageSink>(&mut self, sink: S) -> Result<(), TransportError> {
        for channel in [ControlChannel::Exclusive, ControlChannel::Shared, ControlChannel::Broadcast].iter() {
            let queue = self.queue_for(*channel).await?;
            let subscription = self.broker.subscribe(&queue).await?;
            slog::debug!(self.logger, "Listening on {} control queue {}", channel.name(), queue);

            self.consumers.push((*channel, queue, subscription.tag()));
            tokio::task::spawn(forward_control_messages(
                self.logger.clone(),
                *channel,
                subscription,
                sink.clone(),
            ));
        }

        Ok(())
    }

    /// Cancels the subscriptions in reverse order of importance: broadcast, shared, exclusive.
    pub(crate) async fn stop(&mut self) {
        for channel in [ControlChannel::Broadcast, ControlChannel::Shared, ControlChannel::Exclusive].iter() {
            let position = self.consumers.iter().position(|(c, _, _)| c == channel);
            let (_, queue, tag) = match position {
                Some(position) => self.consumers.remove(position),
                None => continue,
            };

            slog::debug!(self.logger, "Cancelling {} control subscription on {}", channel.name(), queue);
            if let Err(e) = self.broker.unsubscribe(&queue, tag).await {
                slog::warn!(self.logger, "Failed to cancel subscription on {}: {}", queue, e);
            }
        }
        // The broker drops the broadcast queue along with its last consumer.
        self.broadcast_declared = false;
    }

    /// Publishes to this node's own exclusive queue.
    pub(crate) async fn direct_message(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let queue = self.exclusive_queue().await?;
        self.broker.publish(&queue, payload).await
    }

    /// Publishes to the queue every node competes for. Exactly one node receives it.
    pub(crate) async fn shared_message(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let queue = self.shared_queue().await?;
        self.broker.publish(&queue, payload).await
    }

    /// Publishes a copy to every node, including this one.
    pub(crate) async fn broadcast_message(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.broadcast_queue().await?;
        self.broker.publish_to_exchange(BROADCAST_CONTROL_EXCHANGE, payload).await
    }
}

async fn forward_control_messages<S: ControlMessageSink>(
    logger: slog::Logger,
    channel: ControlChannel,
    mut subscription: Subscription,
    sink: S,
) {
    while let Some(delivery) = subscription.next().await {
        slog::debug!(
            logger,
            "Received {} control message: {}",
            channel.name(),
            String::from_utf8_lossy(&delivery.payload)
        );
        if !sink.deliver(delivery.payload, delivery.acker).await {
            return;
        }
    }

    slog::debug!(logger, "{} control subscription ended", channel.name());
    sink.channel_closed(channel.name()).await;
}
