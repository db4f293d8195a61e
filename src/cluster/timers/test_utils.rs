use crate::actor::Event;
use crate::cluster::timers::TimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stands in for the coordinator's event loop, so timer tasks can be driven directly.
pub(crate) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl TestUtilActor {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    pub(crate) async fn recv(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Expected event")
    }

    pub(crate) async fn assert_timer_tick(&mut self, expected: TimerTick) {
        match self.recv().await {
            Event::Timer(tick) => assert_eq!(tick, expected),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(crate) async fn assert_no_event(&mut self) {
        tokio::time::timeout(self.quiet_period, self.rx.recv())
            .await
            .expect_err("Expected timeout");
    }
}
