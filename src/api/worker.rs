use crate::actor::{ClientError, CoordinatorClient, Outcome};
use crate::cluster::{CoordinatorFailure, CoordinatorSnapshot, InFlightTracker, NodeIdentity};
use crate::transport::Broker;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// ClusterWorker is a running member of the cluster, returned by `start_cluster_worker()`.
pub struct ClusterWorker<B: Broker> {
    pub(super) logger: slog::Logger,
    pub(super) identity: NodeIdentity,
    pub(super) partitions: Range<u32>,
    pub(super) client: CoordinatorClient,
    pub(super) broker: Arc<B>,
    pub(super) in_flight: InFlightTracker,
    pub(super) drain_poll_interval: Duration,
    pub(super) event_loop: JoinHandle<()>,
    pub(super) outcome: watch::Receiver<Outcome>,
}

impl<B: Broker> ClusterWorker<B> {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The range this worker claimed at startup. What it holds now may differ; see `snapshot()`.
    pub fn initial_partitions(&self) -> Range<u32> {
        self.partitions.clone()
    }

    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }

    pub fn client(&self) -> &CoordinatorClient {
        &self.client
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot, ClientError> {
        self.client.snapshot().await
    }

    /// Resolves once the coordinator has finished, either through `stop()` or because it lost the
    /// broker. An error means the worker is dead and the process should exit; call `stop()` to
    /// drain in-flight work first.
    pub async fn terminated(&self) -> Result<(), CoordinatorFailure> {
        let mut outcome = self.outcome.clone();
        loop {
            let current = outcome.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            if outcome.changed().await.is_err() {
                return Err(CoordinatorFailure::EventLoopAborted);
            }
        }
    }

    /// Leaves the cluster: releases every partition, waits for messages already handed to the
    /// processor to be acknowledged, then closes the broker connection. Returns the failure that
    /// ended the coordinator, if it had already given up on its own.
    pub async fn stop(self) -> Result<(), CoordinatorFailure> {
        slog::info!(self.logger, "Stopping worker");
        if let Err(e) = self.client.stop().await {
            slog::info!(self.logger, "Coordinator had already exited: {}", e);
        }

        self.wait_for_in_flight_work().await;
        self.broker.close().await;

        drop(self.client);
        if let Err(e) = self.event_loop.await {
            slog::error!(self.logger, "Coordinator event loop failed: {}", e);
        }

        let outcome = self.outcome.borrow().clone();
        let result = outcome.unwrap_or(Err(CoordinatorFailure::EventLoopAborted));
        match &result {
            Ok(()) => slog::info!(self.logger, "Worker stopped"),
            Err(e) => slog::warn!(self.logger, "Worker stopped after failure: {}", e),
        }

        result
    }

    async fn wait_for_in_flight_work(&self) {
        loop {
            let outstanding = self.in_flight.outstanding();
            if outstanding == 0 {
                return;
            }

            slog::info!(self.logger, "Waiting on {} unacknowledged messages", outstanding);
            tokio::time::sleep(self.drain_poll_interval).await;
        }
    }
}
