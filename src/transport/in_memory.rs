use crate::transport::api::{
    Acker, Broker, BrokerConfig, ConsumerTag, Connector, Delivery, QueueOptions, QueueStatus, Subscription,
    TransportError,
};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

// A broker that lives in process memory. It models the parts of a real broker that the cluster
// logic depends on: round-robin delivery among competing consumers, fanout, consumer counts,
// and redelivery of unacked messages when a consumer goes away. It does not model persistence.
//
// Each `InMemoryBroker` value is one connection to the shared broker state. Closing it only
// cancels subscriptions made through that connection.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connection: Arc<Connection>,
}

struct Connection {
    id: u64,
    open: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, BTreeSet<String>>,
    next_connection_id: u64,
    next_consumer_tag: u64,
    next_delivery_tag: u64,
    failing_declares: HashSet<String>,
    unsubscribe_count: usize,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Bytes>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

struct Consumer {
    tag: ConsumerTag,
    connection_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    consumer: ConsumerTag,
    payload: Bytes,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(BrokerState::default()));
        Self::connect_to(state)
    }

    /// Open another connection to the same broker.
    pub fn new_connection(&self) -> Self {
        Self::connect_to(self.state.clone())
    }

    fn connect_to(state: Arc<Mutex<BrokerState>>) -> Self {
        let id = {
            let mut locked = state.lock().expect("InMemoryBroker mutex guard poison");
            locked.next_connection_id += 1;
            locked.next_connection_id
        };

        InMemoryBroker {
            state,
            connection: Arc::new(Connection {
                id,
                open: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.open.load(Ordering::Acquire)
    }

    /// Make every future `declare_queue()` for `queue` fail.
    pub fn fail_declares_of(&self, queue: &str) {
        self.lock().failing_declares.insert(queue.to_string());
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.options.durable)
    }

    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Total successful `unsubscribe()` calls across all connections.
    pub fn unsubscribe_count(&self) -> usize {
        self.lock().unsubscribe_count
    }

    /// Removes and returns every message waiting in `queue`. Handy for reading reply queues.
    pub fn drain_ready(&self, queue: &str) -> Vec<Bytes> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("InMemoryBroker mutex guard poison")
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    pub fn is_auto_delete(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.options.auto_delete)
    }

    fn enqueue(&self, state: &mut BrokerState, queue: &str, payload: Bytes) -> Result<(), TransportError> {
        let weak_state = Arc::downgrade(&self.state);
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = state;
        let queue_state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;

        queue_state.ready.push_back(payload);
        queue_state.dispatch(queue, next_delivery_tag, &weak_state);

        Ok(())
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connection", &self.connection.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Deletes `queue` and unbinds it everywhere if it is auto-delete and nobody consumes it.
    fn delete_if_unused(&mut self, queue: &str) {
        let unused = match self.queues.get(queue) {
            Some(q) => q.options.auto_delete && q.consumers.is_empty(),
            None => false,
        };
        if !unused {
            return;
        }

        self.queues.remove(queue);
        for bound in self.exchanges.values_mut() {
            bound.remove(queue);
        }
    }
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        QueueState {
            options,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
        }
    }

    fn dispatch(&mut self, queue: &str, next_delivery_tag: &mut u64, weak_state: &Weak<Mutex<BrokerState>>) {
        while !self.consumers.is_empty() {
            let payload = match self.ready.pop_front() {
                Some(payload) => payload,
                None => return,
            };

            let index = self.next_consumer % self.consumers.len();
            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let delivery = Delivery {
                payload: payload.clone(),
                acker: Acker::new(ack_fn(weak_state.clone(), queue.to_string(), delivery_tag)),
            };

            let consumer = &self.consumers[index];
            let consumer_tag = consumer.tag;
            match consumer.sender.send(delivery) {
                Ok(()) => {
                    self.unacked.insert(
                        delivery_tag,
                        Unacked {
                            consumer: consumer_tag,
                            payload,
                        },
                    );
                    self.next_consumer = index + 1;
                }
                Err(_) => {
                    // Receiver is gone. Treat it like an implicit cancel.
                    self.consumers.remove(index);
                    self.ready.push_front(payload);
                }
            }
        }
    }

    /// Drops the consumer and requeues, in order, whatever it hadn't acked yet.
    fn remove_consumer(&mut self, tag: ConsumerTag) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.tag != tag);
        let removed = self.consumers.len() != before;

        let mut requeue: Vec<(u64, Bytes)> = Vec::new();
        self.unacked.retain(|delivery_tag, unacked| {
            if unacked.consumer == tag {
                requeue.push((*delivery_tag, unacked.payload.clone()));
                false
            } else {
                true
            }
        });
        requeue.sort_by_key(|(delivery_tag, _)| *delivery_tag);
        for (_, payload) in requeue.into_iter().rev() {
            self.ready.push_front(payload);
        }

        removed
    }
}

fn ack_fn(weak_state: Weak<Mutex<BrokerState>>, queue: String, delivery_tag: u64) -> impl FnOnce() + Send + 'static {
    move || {
        if let Some(state) = weak_state.upgrade() {
            let mut locked = state.lock().expect("InMemoryBroker mutex guard poison");
            if let Some(queue_state) = locked.queues.get_mut(&queue) {
                queue_state.unacked.remove(&delivery_tag);
            }
        }
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if state.failing_declares.contains(queue) {
            return Err(TransportError::DeclareFailed {
                queue: queue.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(options));

        Ok(())
    }

    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.lock().exchanges.entry(exchange.to_string()).or_default();

        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }

        state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?
            .insert(queue.to_string());

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let weak_state = Arc::downgrade(&self.state);
        let mut state = self.lock();

        state.next_consumer_tag += 1;
        let tag = ConsumerTag::new(state.next_consumer_tag);

        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *state;
        let queue_state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.consumers.push(Consumer {
            tag,
            connection_id: self.connection.id,
            sender: tx,
        });
        queue_state.dispatch(queue, next_delivery_tag, &weak_state);

        Ok(Subscription::new(tag, rx))
    }

    async fn unsubscribe(&self, queue: &str, tag: ConsumerTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let weak_state = Arc::downgrade(&self.state);
        let mut state = self.lock();

        let BrokerState {
            queues,
            next_delivery_tag,
            unsubscribe_count,
            ..
        } = &mut *state;
        let queue_state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;

        if !queue_state.remove_consumer(tag) {
            return Err(TransportError::UnknownConsumer {
                queue: queue.to_string(),
                tag,
            });
        }
        *unsubscribe_count += 1;
        queue_state.dispatch(queue, next_delivery_tag, &weak_state);
        state.delete_if_unused(queue);

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        self.enqueue(&mut state, queue, payload)
    }

    async fn publish_to_exchange(&self, exchange: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        let bound: Vec<String> = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?
            .iter()
            .cloned()
            .collect();

        for queue in bound {
            self.enqueue(&mut state, &queue, payload.clone())?;
        }

        Ok(())
    }

    async fn queue_status(&self, queue: &str) -> Result<QueueStatus, TransportError> {
        self.ensure_open()?;
        let state = self.lock();
        let queue_state = state
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;

        Ok(QueueStatus {
            message_count: queue_state.ready.len(),
            subscriber_count: queue_state.consumers.len(),
        })
    }

    async fn close(&self) {
        if !self.connection.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let weak_state = Arc::downgrade(&self.state);
        let mut state = self.lock();
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = &mut *state;

        let mut emptied = Vec::new();
        for (name, queue_state) in queues.iter_mut() {
            let mine: Vec<ConsumerTag> = queue_state
                .consumers
                .iter()
                .filter(|c| c.connection_id == self.connection.id)
                .map(|c| c.tag)
                .collect();
            if mine.is_empty() {
                continue;
            }
            for tag in mine {
                queue_state.remove_consumer(tag);
            }
            queue_state.dispatch(name, next_delivery_tag, &weak_state);
            emptied.push(name.clone());
        }

        for name in emptied {
            state.delete_if_unused(&name);
        }
    }
}

/// InMemoryConnector hands out fresh connections to one `InMemoryBroker`. It can be told to
/// refuse the next N attempts, which is how the reconnect loop gets tested. Clones share counters.
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    counters: Arc<ConnectorCounters>,
    handed_out: Arc<Mutex<Vec<InMemoryBroker>>>,
}

#[derive(Default)]
struct ConnectorCounters {
    refuse_remaining: AtomicUsize,
    refuse_fatally: AtomicBool,
    connect_attempts: AtomicU64,
    hard_resets: AtomicU64,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        InMemoryConnector {
            broker,
            counters: Arc::new(ConnectorCounters::default()),
            handed_out: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Closes every connection this connector has handed out, as if the broker went away.
    pub async fn sever_connections(&self) {
        let connections: Vec<InMemoryBroker> = self
            .handed_out
            .lock()
            .expect("InMemoryConnector mutex guard poison")
            .drain(..)
            .collect();
        for connection in connections {
            connection.close().await;
        }
    }

    /// The next `attempts` calls to `connect()` fail with `CouldNotConnect`.
    pub fn refuse_connections(&self, attempts: usize) {
        self.counters.refuse_remaining.store(attempts, Ordering::Release);
    }

    /// Every call to `connect()` fails with `AccessRefused`.
    pub fn refuse_access(&self) {
        self.counters.refuse_fatally.store(true, Ordering::Release);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.counters.connect_attempts.load(Ordering::Acquire)
    }

    pub fn hard_resets(&self) -> u64 {
        self.counters.hard_resets.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Connector for InMemoryConnector {
    type Broker = InMemoryBroker;

    async fn connect(&self, config: &BrokerConfig) -> Result<InMemoryBroker, TransportError> {
        let counters = &self.counters;
        counters.connect_attempts.fetch_add(1, Ordering::AcqRel);

        if counters.refuse_fatally.load(Ordering::Acquire) {
            return Err(TransportError::AccessRefused(format!("user '{}'", config.user)));
        }

        let refused = counters
            .refuse_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::CouldNotConnect(format!("{}:{}", config.host, config.port)));
        }

        let connection = self.broker.new_connection();
        self.handed_out
            .lock()
            .expect("InMemoryConnector mutex guard poison")
            .push(connection.clone());

        Ok(connection)
    }

    async fn hard_reset(&self) {
        self.counters.hard_resets.fetch_add(1, Ordering::AcqRel);
    }
}
