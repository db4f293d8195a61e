use crate::actor::WeakCoordinatorClient;
use crate::cluster::processor::{Acknowledgement, InFlightTracker, ProcessMessage};
use crate::cluster::timers::{PeriodicTimerHandle, TimerTick};
use crate::transport::{Broker, ConsumerTag, QueueOptions, Subscription, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TOTAL_PARTITIONS: u32 = 1024;

/// PartitionNumber names one vnode. Every partition is backed by one durable broker queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionNumber(u32);

impl PartitionNumber {
    pub fn new(number: u32) -> Self {
        PartitionNumber(number)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn queue_name(&self) -> String {
        format!("vnode-{}", self.0)
    }
}

impl fmt::Display for PartitionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PartitionRangeError {
    #[error("Node count must be at least 1")]
    NoNodes,
    #[error("Node index {index} is outside 1..={node_count}")]
    IndexOutOfRange { index: u32, node_count: u32 },
    #[error("Can't split {total} partitions across {node_count} nodes")]
    TooFewPartitions { total: u32, node_count: u32 },
}

/// Computes the contiguous slice of `0..total` that the node at 1-based `index` starts out
/// owning. Every node gets `total / node_count` partitions and the last one also takes the
/// remainder, so the ranges of nodes `1..=node_count` tile `0..total` exactly.
pub fn partition_range(total: u32, index: u32, node_count: u32) -> Result<Range<u32>, PartitionRangeError> {
    if node_count == 0 {
        return Err(PartitionRangeError::NoNodes);
    }
    if index == 0 || index > node_count {
        return Err(PartitionRangeError::IndexOutOfRange { index, node_count });
    }
    if total < node_count {
        return Err(PartitionRangeError::TooFewPartitions { total, node_count });
    }

    let per_node = total / node_count;
    let start = (index - 1) * per_node;
    let mut end = start + per_node;
    if index == node_count {
        end += total % node_count;
    }

    Ok(start..end)
}

/// Everything a partition needs from its coordinator to start consuming.
pub(crate) struct PartitionContext<'a, B, P> {
    pub(crate) logger: &'a slog::Logger,
    pub(crate) broker: &'a Arc<B>,
    pub(crate) processor: &'a Arc<P>,
    pub(crate) in_flight: &'a InFlightTracker,
    pub(crate) client: &'a WeakCoordinatorClient,
    pub(crate) consumer_check_interval: Duration,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ConsumerCheck {
    Exclusive,
    DuplicateConsumers(usize),
}

/// PartitionHandle is this node's claim on one partition: a live subscription to its queue, plus
/// the timer that keeps asking whether some other node is consuming the same queue.
pub(crate) struct PartitionHandle {
    logger: slog::Logger,
    number: PartitionNumber,
    queue_name: String,
    consumer: Option<ConsumerTag>,
    consumer_check: Option<PeriodicTimerHandle>,
}

impl PartitionHandle {
    pub(crate) async fn start<B: Broker, P: ProcessMessage>(
        number: PartitionNumber,
        ctx: PartitionContext<'_, B, P>,
    ) -> Result<Self, TransportError> {
        let queue_name = number.queue_name();
        let logger = ctx.logger.new(slog::o!("Partition" => number.as_u32()));
        slog::debug!(logger, "Starting subscriber on {}", queue_name);

        ctx.broker.declare_queue(&queue_name, QueueOptions::durable()).await?;
        let subscription = ctx.broker.subscribe(&queue_name).await?;
        let consumer = subscription.tag();

        tokio::task::spawn(consume_partition(
            logger.clone(),
            number,
            subscription,
            ctx.processor.clone(),
            ctx.in_flight.clone(),
        ));
        let consumer_check = PeriodicTimerHandle::spawn_timer_task(
            ctx.consumer_check_interval,
            ctx.client.clone(),
            TimerTick::ConsumerCountCheck(number),
        );

        Ok(PartitionHandle {
            logger,
            number,
            queue_name,
            consumer: Some(consumer),
            consumer_check: Some(consumer_check),
        })
    }

    pub(crate) fn number(&self) -> PartitionNumber {
        self.number
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.consumer.is_none()
    }

    /// A partition must have exactly one consumer cluster-wide. If the broker reports more than
    /// one, this node backs off and lets the other claimant keep it.
    pub(crate) async fn check_consumer_count<B: Broker>(&mut self, broker: &B) -> Result<ConsumerCheck, TransportError> {
        let status = broker.queue_status(&self.queue_name).await?;
        slog::debug!(
            self.logger,
            "Queue {} has {} subscribers and {} waiting messages",
            self.queue_name,
            status.subscriber_count,
            status.message_count
        );

        if status.subscriber_count > 1 {
            slog::error!(
                self.logger,
                "Detected extra consumers ({} total) on queue {}, cancelling subscription",
                status.subscriber_count,
                self.queue_name
            );
            self.stop(broker).await;
            return Ok(ConsumerCheck::DuplicateConsumers(status.subscriber_count));
        }

        Ok(ConsumerCheck::Exclusive)
    }

    /// Idempotent. Only the first call cancels the subscription.
    pub(crate) async fn stop<B: Broker>(&mut self, broker: &B) {
        self.consumer_check.take();

        let tag = match self.consumer.take() {
            Some(tag) => tag,
            None => return,
        };

        slog::debug!(self.logger, "Cancelling subscription {:?} on queue {}", tag, self.queue_name);
        if let Err(e) = broker.unsubscribe(&self.queue_name, tag).await {
            slog::warn!(self.logger, "Failed to cancel subscription on {}: {}", self.queue_name, e);
        }
    }
}

async fn consume_partition<P: ProcessMessage>(
    logger: slog::Logger,
    number: PartitionNumber,
    mut subscription: Subscription,
    processor: Arc<P>,
    in_flight: InFlightTracker,
) {
    while let Some(delivery) = subscription.next().await {
        slog::debug!(logger, "Got {} byte message", delivery.payload.len());
        let ack = Acknowledgement::new(delivery.acker, in_flight.start());
        processor.process(number, delivery.payload, ack);
    }

    slog::debug!(logger, "Subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::CoordinatorClient;
    use crate::cluster::processor::test_utils::RecordingProcessor;
    use crate::logging::test_utils::CapturedLogs;
    use crate::logging::LevelSwitch;
    use crate::transport::InMemoryBroker;
    use bytes::Bytes;
    use rand::Rng;

    #[test]
    fn queue_names() {
        assert_eq!(PartitionNumber::new(0).queue_name(), "vnode-0");
        assert_eq!(PartitionNumber::new(1023).queue_name(), "vnode-1023");
    }

    #[test]
    fn formatting() {
        assert_eq!(PartitionNumber::new(7).to_string(), "7");
        assert_eq!(format!("{:?}", PartitionNumber::new(7)), "PartitionNumber(7)");
    }

    #[test]
    fn ranges_split_evenly_with_remainder_on_last_node() {
        assert_eq!(partition_range(1024, 1, 1), Ok(0..1024));
        assert_eq!(partition_range(1024, 1, 4), Ok(0..256));
        assert_eq!(partition_range(1024, 4, 4), Ok(768..1024));
        assert_eq!(partition_range(10, 1, 3), Ok(0..3));
        assert_eq!(partition_range(10, 2, 3), Ok(3..6));
        assert_eq!(partition_range(10, 3, 3), Ok(6..10));
    }

    #[test]
    fn ranges_tile_the_partition_space() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let node_count = rng.gen_range(1..=64);
            let total = rng.gen_range(node_count..=4096);

            let mut next_start = 0;
            for index in 1..=node_count {
                let range = partition_range(total, index, node_count).expect("valid assignment");
                assert_eq!(range.start, next_start, "gap or overlap at node {} of {}", index, node_count);
                next_start = range.end;
            }
            assert_eq!(next_start, total);
        }
    }

    #[test]
    fn invalid_assignments_are_rejected() {
        assert_eq!(partition_range(1024, 1, 0), Err(PartitionRangeError::NoNodes));
        assert_eq!(
            partition_range(1024, 0, 3),
            Err(PartitionRangeError::IndexOutOfRange { index: 0, node_count: 3 })
        );
        assert_eq!(
            partition_range(1024, 4, 3),
            Err(PartitionRangeError::IndexOutOfRange { index: 4, node_count: 3 })
        );
        assert_eq!(
            partition_range(2, 1, 3),
            Err(PartitionRangeError::TooFewPartitions { total: 2, node_count: 3 })
        );
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        processor: Arc<RecordingProcessor>,
        deliveries: tokio::sync::mpsc::UnboundedReceiver<(PartitionNumber, Bytes)>,
        in_flight: InFlightTracker,
        captured: CapturedLogs,
        logger: slog::Logger,
        client: CoordinatorClient,
        _events: tokio::sync::mpsc::Receiver<crate::actor::Event>,
    }

    fn fixture(processor: (RecordingProcessor, tokio::sync::mpsc::UnboundedReceiver<(PartitionNumber, Bytes)>)) -> Fixture {
        let captured = CapturedLogs::default();
        let logger = captured.logger(LevelSwitch::new(slog::Level::Info));
        let (client, events) = CoordinatorClient::new(10);

        Fixture {
            broker: Arc::new(InMemoryBroker::new()),
            processor: Arc::new(processor.0),
            deliveries: processor.1,
            in_flight: InFlightTracker::new(),
            captured,
            logger,
            client,
            _events: events,
        }
    }

    async fn start_handle(f: &Fixture, number: u32) -> Result<PartitionHandle, TransportError> {
        let weak = f.client.weak();
        PartitionHandle::start(
            PartitionNumber::new(number),
            PartitionContext {
                logger: &f.logger,
                broker: &f.broker,
                processor: &f.processor,
                in_flight: &f.in_flight,
                client: &weak,
                consumer_check_interval: Duration::from_secs(3600),
            },
        )
        .await
    }

    #[tokio::test]
    async fn start_subscribes_and_feeds_the_processor() {
        let mut f = fixture(RecordingProcessor::acking());
        let handle = start_handle(&f, 7).await.unwrap();

        assert_eq!(f.broker.is_durable("vnode-7"), Some(true));
        assert_eq!(f.broker.subscriber_count("vnode-7"), 1);
        assert!(!handle.is_stopped());

        f.broker.publish("vnode-7", Bytes::from("payload")).await.unwrap();
        let (partition, payload) = f.deliveries.recv().await.unwrap();
        assert_eq!(partition, PartitionNumber::new(7));
        assert_eq!(payload, Bytes::from("payload"));
        assert_eq!(f.broker.unacked_count("vnode-7"), 0);
        assert_eq!(f.in_flight.outstanding(), 0);
    }

    #[tokio::test]
    async fn start_fails_when_queue_cannot_be_declared() {
        let f = fixture(RecordingProcessor::acking());
        f.broker.fail_declares_of("vnode-3");

        let result = start_handle(&f, 3).await;

        assert!(matches!(result, Err(TransportError::DeclareFailed { .. })));
        assert_eq!(f.broker.subscriber_count("vnode-3"), 0);
    }

    #[tokio::test]
    async fn unacked_work_is_tracked_and_redelivered_after_stop() {
        let mut f = fixture(RecordingProcessor::holding());
        let mut handle = start_handle(&f, 1).await.unwrap();

        f.broker.publish("vnode-1", Bytes::from("slow")).await.unwrap();
        f.deliveries.recv().await.unwrap();
        assert_eq!(f.in_flight.outstanding(), 1);

        handle.stop(&*f.broker).await;
        assert_eq!(f.broker.ready_count("vnode-1"), 1);

        f.processor.release_held();
        assert_eq!(f.in_flight.outstanding(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let f = fixture(RecordingProcessor::acking());
        let mut handle = start_handle(&f, 2).await.unwrap();

        handle.stop(&*f.broker).await;
        handle.stop(&*f.broker).await;

        assert!(handle.is_stopped());
        assert_eq!(f.broker.unsubscribe_count(), 1);
        assert_eq!(f.broker.subscriber_count("vnode-2"), 0);
        assert_eq!(f.captured.count_at(slog::Level::Warning), 0);
    }

    #[tokio::test]
    async fn single_consumer_is_left_alone() {
        let f = fixture(RecordingProcessor::acking());
        let mut handle = start_handle(&f, 4).await.unwrap();

        let check = handle.check_consumer_count(&*f.broker).await.unwrap();

        assert_eq!(check, ConsumerCheck::Exclusive);
        assert!(!handle.is_stopped());
    }

    #[tokio::test]
    async fn duplicate_consumer_makes_the_handle_stop_once() {
        let f = fixture(RecordingProcessor::acking());
        let mut handle = start_handle(&f, 5).await.unwrap();
        let other_node = f.broker.new_connection();
        let _their_subscription = other_node.subscribe("vnode-5").await.unwrap();

        let check = handle.check_consumer_count(&*f.broker).await.unwrap();
        assert_eq!(check, ConsumerCheck::DuplicateConsumers(2));
        assert!(handle.is_stopped());

        // The other claimant keeps the partition.
        assert_eq!(f.broker.subscriber_count("vnode-5"), 1);
        assert_eq!(f.broker.unsubscribe_count(), 1);
        let errors = f.captured.messages_at(slog::Level::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Detected extra consumers (2 total) on queue vnode-5"));
    }
}
