use crate::actor::WeakCoordinatorClient;
use crate::cluster::partition::PartitionNumber;
use crate::cluster::timers::time::{Clock, RealClock};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// What a periodic timer asks the coordinator to do when it fires.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TimerTick {
    ConsumerCountCheck(PartitionNumber),
    PublishOwnership,
}

/// Keeps a periodic timer task alive. Dropping the handle stops the task at its next wake-up,
/// without it sending another tick.
pub(crate) struct PeriodicTimerHandle {
    _alive: Arc<()>,
}

struct PeriodicTimerTask<C: Clock> {
    alive: Weak<()>,
    period: Duration,
    next_tick: Instant,
    client: WeakCoordinatorClient,
    tick: TimerTick,
    clock: C,
}

impl PeriodicTimerHandle {
    pub(crate) fn spawn_timer_task(period: Duration, client: WeakCoordinatorClient, tick: TimerTick) -> Self {
        // Add minimal logic in this constructor, as it is untested.
        let (task, handle) = PeriodicTimerTask::new(period, client, tick, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> PeriodicTimerTask<C> {
    fn new(period: Duration, client: WeakCoordinatorClient, tick: TimerTick, clock: C) -> (Self, PeriodicTimerHandle) {
        let alive = Arc::new(());
        let task = PeriodicTimerTask {
            alive: Arc::downgrade(&alive),
            period,
            next_tick: clock.now() + period,
            client,
            tick,
            clock,
        };

        (task, PeriodicTimerHandle { _alive: alive })
    }

    async fn run(mut self) {
        loop {
            self.clock.sleep_until(self.next_tick).await;

            if self.alive.upgrade().is_none() {
                return;
            }
            if !self.client.timer_tick(self.tick).await {
                // Coordinator is gone.
                return;
            }

            // Ticks missed while the coordinator was busy are skipped, not replayed.
            self.next_tick += self.period;
            let now = self.clock.now();
            if self.next_tick <= now {
                self.next_tick = now + self.period;
            }
        }
    }
}
