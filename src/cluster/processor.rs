use crate::cluster::partition::PartitionNumber;
use crate::transport::Acker;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// ProcessMessage is the application's work for one message delivered on a claimed partition.
///
/// It runs inline on the worker's event loop, so it must be fast or hand the work off (e.g.
/// `tokio::spawn`). Whatever it does, it must eventually call `Acknowledgement::ack()` exactly
/// once. Dropping the acknowledgement instead leaves the message unacked, and the broker will
/// redeliver it after this worker lets go of the partition.
pub trait ProcessMessage: Send + Sync + 'static {
    fn process(&self, partition: PartitionNumber, payload: Bytes, ack: Acknowledgement);
}

/// Acks every message without looking at it.
#[derive(Default)]
pub struct NoOpProcessor;

impl NoOpProcessor {
    pub fn new() -> Self {
        NoOpProcessor
    }
}

impl ProcessMessage for NoOpProcessor {
    fn process(&self, _: PartitionNumber, _: Bytes, ack: Acknowledgement) {
        ack.ack();
    }
}

pub struct Acknowledgement {
    acker: Acker,
    _in_flight: InFlightGuard,
}

impl Acknowledgement {
    pub(crate) fn new(acker: Acker, in_flight: InFlightGuard) -> Self {
        Acknowledgement {
            acker,
            _in_flight: in_flight,
        }
    }

    pub fn ack(self) {
        self.acker.ack();
    }
}

/// InFlightTracker counts acknowledgements that have been handed to the processor but not yet
/// acked or dropped. Shutdown waits for it to reach zero before closing the connection.
#[derive(Clone, Default)]
pub struct InFlightTracker {
    count: Arc<AtomicUsize>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        InFlightTracker::default()
    }

    pub fn outstanding(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn start(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            count: self.count.clone(),
        }
    }
}

pub(crate) struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_until_ack_or_drop() {
        let tracker = InFlightTracker::new();
        let acked = Arc::new(AtomicUsize::new(0));

        let first = {
            let acked = acked.clone();
            Acknowledgement::new(
                Acker::new(move || {
                    acked.fetch_add(1, Ordering::AcqRel);
                }),
                tracker.start(),
            )
        };
        let second = Acknowledgement::new(Acker::new(|| {}), tracker.start());
        assert_eq!(tracker.outstanding(), 2);

        first.ack();
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(acked.load(Ordering::Acquire), 1);

        drop(second);
        assert_eq!(tracker.outstanding(), 0);
    }
}
