use crate::cluster::{
    ControlMessageSink, CoordinatorFailure, CoordinatorSnapshot, PartitionCoordinator, ProcessMessage, TimerTick,
};
use crate::transport::{Acker, Broker};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

// Every change to a node's partition ownership happens on the coordinator's event loop, one event
// at a time. Control channel pumps, timers and the public client only ever send events.
#[derive(Debug)]
pub(crate) enum Event {
    // A raw control message from any of the three control queues. Acked after it's handled.
    ControlMessage(Bytes, Acker),

    // The broker ended one of the control subscriptions.
    ControlChannelClosed(&'static str),

    // Periodic work: duplicate consumer checks per partition, ownership broadcasts.
    Timer(TimerTick),

    Snapshot(Callback<CoordinatorSnapshot>),

    // Release everything. The event loop exits after replying.
    Stop(Callback<()>),
}

#[derive(Debug)]
pub(crate) struct Callback<T>(oneshot::Sender<T>);

impl<T> Callback<T> {
    pub fn send(self, message: T) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Partition coordinator has exited")]
    CoordinatorExited,
}

#[derive(Clone)]
pub struct CoordinatorClient {
    sender: mpsc::Sender<Event>,
}

impl CoordinatorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (CoordinatorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakCoordinatorClient {
        WeakCoordinatorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Snapshot(Callback(tx))).await?;

        rx.await.map_err(|_| ClientError::CoordinatorExited)
    }

    /// Releases every owned partition and ends the event loop.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Stop(Callback(tx))).await?;

        rx.await.map_err(|_| ClientError::CoordinatorExited)
    }

    async fn send(&self, event: Event) -> Result<(), ClientError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| ClientError::CoordinatorExited)
    }
}

/// The coordinator's own background tasks hold this, so they don't keep its event loop alive.
#[derive(Clone)]
pub(crate) struct WeakCoordinatorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakCoordinatorClient {
    pub(crate) async fn timer_tick(&self, tick: TimerTick) -> bool {
        self.send(Event::Timer(tick)).await
    }

    async fn send(&self, event: Event) -> bool {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ControlMessageSink for WeakCoordinatorClient {
    async fn deliver(&self, payload: Bytes, acker: Acker) -> bool {
        self.send(Event::ControlMessage(payload, acker)).await
    }

    async fn channel_closed(&self, channel: &'static str) {
        self.send(Event::ControlChannelClosed(channel)).await;
    }
}

/// How the event loop ended. `None` while it is still running.
pub(crate) type Outcome = Option<Result<(), CoordinatorFailure>>;

pub(crate) fn outcome_channel() -> (watch::Sender<Outcome>, watch::Receiver<Outcome>) {
    watch::channel(None)
}

/// CoordinatorActor runs a `PartitionCoordinator` in actor model.
pub(crate) struct CoordinatorActor<B: Broker, P: ProcessMessage> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    coordinator: PartitionCoordinator<B, P>,
    outcome: watch::Sender<Outcome>,
}

impl<B: Broker, P: ProcessMessage> CoordinatorActor<B, P> {
    pub(crate) fn new(
        logger: slog::Logger,
        receiver: mpsc::Receiver<Event>,
        coordinator: PartitionCoordinator<B, P>,
        outcome: watch::Sender<Outcome>,
    ) -> Self {
        CoordinatorActor {
            logger,
            receiver,
            coordinator,
            outcome,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }

        // Every client went away without asking for a stop.
        if !self.coordinator.is_stopping() {
            self.coordinator.stop().await;
        }

        let outcome = match self.coordinator.failure() {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        };
        slog::info!(self.logger, "Coordinator event loop exited"; "failed" => outcome.is_err());
        // Nobody waiting on the outcome is fine.
        let _ = self.outcome.send(Some(outcome));
    }

    // Returns false when the loop should exit. Broker calls are awaited inline, which is what
    // keeps ownership changes strictly ordered.
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::ControlMessage(payload, acker) => {
                self.coordinator.handle_control_message(&payload).await;
                acker.ack();
            }
            Event::ControlChannelClosed(channel) => {
                self.coordinator.control_channel_closed(channel).await;
            }
            Event::Timer(tick) => {
                self.coordinator.handle_timer_tick(tick).await;
            }
            Event::Snapshot(callback) => {
                callback.send(self.coordinator.snapshot());
            }
            Event::Stop(callback) => {
                self.coordinator.stop().await;
                callback.send(());
                return false;
            }
        }

        self.coordinator.failure().is_none()
    }
}
