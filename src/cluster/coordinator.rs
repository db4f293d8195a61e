use crate::actor::WeakCoordinatorClient;
use crate::cluster::control_message::{
    ControlMessage, ControlMessageDecodeError, LogLevelReply, NodeAnnouncement, TableAction,
};
use crate::cluster::identity::{ControlChannels, NodeIdentity};
use crate::cluster::ownership_table::{OwnershipTable, OwnershipTableError};
use crate::cluster::partition::{ConsumerCheck, PartitionContext, PartitionHandle, PartitionNumber};
use crate::cluster::processor::{InFlightTracker, ProcessMessage};
use crate::cluster::timers::{PeriodicTimerHandle, TimerTick};
use crate::logging::{self, LevelSwitch};
use crate::transport::{Broker, QueueOptions, TransportError};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ControlMessageError {
    #[error("Invalid control message: {0}")]
    Decode(#[from] ControlMessageDecodeError),
    #[error("Invalid ownership table update: {0}")]
    Table(#[from] OwnershipTableError),
    #[error("Control message action '{0}' is not implemented")]
    Unimplemented(&'static str),
    #[error("Unknown log level '{0}'")]
    InvalidLogLevel(String),
    #[error("Failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Broker error: {0}")]
    Transport(#[from] TransportError),
}

impl ControlMessageError {
    fn is_connection_lost(&self) -> bool {
        matches!(self, ControlMessageError::Transport(e) if e.is_connection_lost())
    }
}

/// Why a coordinator gave up. Once it has, the worker is finished and the process should exit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorFailure {
    #[error("Lost the broker: {0}")]
    Transport(#[from] TransportError),
    #[error("The {0} control subscription ended while the worker was running")]
    ControlChannelClosed(&'static str),
    #[error("Coordinator event loop ended without reporting an outcome")]
    EventLoopAborted,
}

/// A point-in-time view of one coordinator, for tests and operators.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSnapshot {
    pub local_node: NodeIdentity,
    pub owned_partitions: Vec<PartitionNumber>,
    pub ownership: Vec<(NodeIdentity, Vec<PartitionNumber>)>,
    pub leader: Option<NodeIdentity>,
    pub is_leader: bool,
    pub log_level: String,
    pub stopping: bool,
}

pub(crate) struct CoordinatorConfig<B, P> {
    pub(crate) logger: slog::Logger,
    pub(crate) broker: Arc<B>,
    pub(crate) processor: Arc<P>,
    pub(crate) identity: NodeIdentity,
    pub(crate) in_flight: InFlightTracker,
    pub(crate) level_switch: LevelSwitch,
    pub(crate) client: WeakCoordinatorClient,
    pub(crate) consumer_check_interval: Duration,
    // None disables periodic ownership broadcasts.
    pub(crate) table_publish_interval: Option<Duration>,
}

/// PartitionCoordinator is one node's side of cluster coordination. It owns the node's partition
/// handles and its view of who owns what, and it is the only thing that acts on control messages.
///
/// It is driven by `CoordinatorActor`; nothing here is shared across tasks.
pub(crate) struct PartitionCoordinator<B: Broker, P: ProcessMessage> {
    logger: slog::Logger,
    broker: Arc<B>,
    processor: Arc<P>,
    identity: NodeIdentity,
    channels: ControlChannels<B>,
    owned: BTreeMap<PartitionNumber, PartitionHandle>,
    table: OwnershipTable,
    in_flight: InFlightTracker,
    level_switch: LevelSwitch,
    client: WeakCoordinatorClient,
    consumer_check_interval: Duration,
    table_publish_interval: Option<Duration>,
    table_publisher: Option<PeriodicTimerHandle>,
    stopping: bool,
    failure: Option<CoordinatorFailure>,
}

impl<B: Broker, P: ProcessMessage> PartitionCoordinator<B, P> {
    pub(crate) fn new(config: CoordinatorConfig<B, P>) -> Self {
        let channels = ControlChannels::new(config.logger.clone(), config.broker.clone(), config.identity.clone());

        PartitionCoordinator {
            logger: config.logger,
            broker: config.broker,
            processor: config.processor,
            identity: config.identity,
            channels,
            owned: BTreeMap::new(),
            table: OwnershipTable::new(),
            in_flight: config.in_flight,
            level_switch: config.level_switch,
            client: config.client,
            consumer_check_interval: config.consumer_check_interval,
            table_publish_interval: config.table_publish_interval,
            table_publisher: None,
            stopping: false,
            failure: None,
        }
    }

    /// Opens the control channels and claims the initial partitions. Only control channel
    /// failures are returned; a partition that can't be claimed is logged and skipped.
    pub(crate) async fn start<I>(&mut self, initial_partitions: I) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = PartitionNumber>,
    {
        slog::info!(self.logger, "Starting partition coordinator as {}", self.identity);
        self.channels.start(self.client.clone()).await?;

        for partition in initial_partitions {
            self.claim_partition(partition).await;
        }
        self.ensure_alive()?;
        slog::info!(self.logger, "Holding {} partitions", self.owned.len());

        if let Some(period) = self.table_publish_interval {
            self.publish_ownership_or_warn().await;
            self.ensure_alive()?;
            self.table_publisher = Some(PeriodicTimerHandle::spawn_timer_task(
                period,
                self.client.clone(),
                TimerTick::PublishOwnership,
            ));
        }

        Ok(())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub(crate) fn failure(&self) -> Option<&CoordinatorFailure> {
        self.failure.as_ref()
    }

    fn ensure_alive(&self) -> Result<(), TransportError> {
        match &self.failure {
            Some(_) => Err(TransportError::ConnectionClosed),
            None => Ok(()),
        }
    }

    /// Gives up: records why, then releases everything as far as the broker still allows. The
    /// event loop exits after the current event.
    async fn fail(&mut self, failure: CoordinatorFailure) {
        if self.stopping {
            return;
        }

        slog::error!(self.logger, "Leaving the cluster: {}", failure);
        self.failure = Some(failure);
        self.stop().await;
    }

    /// Any control subscription ending on its own means the broker let go of this node.
    pub(crate) async fn control_channel_closed(&mut self, channel: &'static str) {
        if self.stopping {
            slog::debug!(self.logger, "{} control subscription closed", channel);
            return;
        }

        self.fail(CoordinatorFailure::ControlChannelClosed(channel)).await;
    }

    /// Returns whether this node holds the partition afterwards.
    pub(crate) async fn claim_partition(&mut self, partition: PartitionNumber) -> bool {
        if self.stopping {
            slog::info!(self.logger, "Not claiming partition {} while stopping", partition);
            return false;
        }
        if self.owned.contains_key(&partition) {
            slog::info!(self.logger, "Already holding partition {}, ignoring claim", partition);
            return true;
        }

        let started = PartitionHandle::start(
            partition,
            PartitionContext {
                logger: &self.logger,
                broker: &self.broker,
                processor: &self.processor,
                in_flight: &self.in_flight,
                client: &self.client,
                consumer_check_interval: self.consumer_check_interval,
            },
        )
        .await;

        match started {
            Ok(handle) => {
                self.partition_claimed(handle);
                self.check_consumer_count(partition).await;
                self.owned.contains_key(&partition)
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to start subscriber on partition {}: {}", partition, e);
                if e.is_connection_lost() {
                    self.fail(e.into()).await;
                }
                false
            }
        }
    }

    fn partition_claimed(&mut self, handle: PartitionHandle) {
        slog::debug!(self.logger, "Claimed partition {}", handle.number());
        self.owned.insert(handle.number(), handle);
    }

    fn partition_released(&mut self, partition: PartitionNumber) {
        if self.owned.remove(&partition).is_some() {
            slog::info!(self.logger, "Released partition {}", partition);
        }
    }

    async fn check_consumer_count(&mut self, partition: PartitionNumber) {
        let handle = match self.owned.get_mut(&partition) {
            Some(handle) => handle,
            None => return,
        };

        match handle.check_consumer_count(&*self.broker).await {
            Ok(ConsumerCheck::Exclusive) => {}
            Ok(ConsumerCheck::DuplicateConsumers(consumers)) => {
                slog::info!(
                    self.logger,
                    "Leaving partition {} to the other {} consumers",
                    partition,
                    consumers - 1
                );
                self.partition_released(partition);
            }
            Err(e) => {
                slog::warn!(self.logger, "Could not check consumers of partition {}: {}", partition, e);
                if e.is_connection_lost() {
                    self.fail(e.into()).await;
                }
            }
        }
    }

    /// Never fails. Anything that goes wrong is logged, and the next message is handled normally.
    pub(crate) async fn handle_control_message(&mut self, payload: &[u8]) {
        if self.stopping {
            slog::info!(self.logger, "Ignoring control message while stopping");
            return;
        }

        if let Err(e) = self.try_handle_control_message(payload).await {
            slog::error!(
                self.logger,
                "Error processing a control message: {}", e;
                "payload" => String::from_utf8_lossy(payload).into_owned()
            );
            if e.is_connection_lost() {
                self.fail(TransportError::ConnectionClosed.into()).await;
            }
        }
    }

    async fn try_handle_control_message(&mut self, payload: &[u8]) -> Result<(), ControlMessageError> {
        let message = ControlMessage::decode(payload)?;
        slog::debug!(self.logger, "Handling control message {:?}", message);

        match message {
            ControlMessage::ClaimVnode { vnode_id } => {
                self.claim_partition(vnode_id).await;
            }
            ControlMessage::RecoverVnode { vnode_id } => {
                self.recover_partition(vnode_id).await?;
            }
            ControlMessage::ReleaseVnodes => {
                return Err(ControlMessageError::Unimplemented("release_vnodes"));
            }
            ControlMessage::UpdateVnodeTable { data } => {
                self.table.update_table(&data)?;
            }
            ControlMessage::VnodeTablePublish => {
                self.publish_ownership().await?;
            }
            ControlMessage::Status { rsvp } => {
                self.reply_with_status(&rsvp).await?;
            }
            ControlMessage::SetLogLevel { level, rsvp } => {
                self.set_log_level(&level, rsvp.as_deref()).await?;
            }
        }

        Ok(())
    }

    pub(crate) async fn handle_timer_tick(&mut self, tick: TimerTick) {
        if self.stopping {
            return;
        }

        match tick {
            TimerTick::ConsumerCountCheck(partition) => self.check_consumer_count(partition).await,
            TimerTick::PublishOwnership => self.publish_ownership_or_warn().await,
        }
    }

    /// Only the leader turns a recovery request into a claim, and it hands that claim to whichever
    /// node takes it off the shared queue first.
    async fn recover_partition(&mut self, partition: PartitionNumber) -> Result<(), ControlMessageError> {
        if !self.table.local_node_is_leader(&self.identity) {
            slog::debug!(self.logger, "Ignoring recovery of partition {}, not the leader", partition);
            return Ok(());
        }

        slog::info!(self.logger, "Recovering partition {}", partition);
        let claim = ControlMessage::ClaimVnode { vnode_id: partition }.encode()?;
        self.channels.shared_message(claim).await?;

        Ok(())
    }

    fn owned_partitions(&self) -> Vec<PartitionNumber> {
        self.owned.keys().copied().collect()
    }

    fn announcement(&self, action: Option<TableAction>) -> NodeAnnouncement {
        NodeAnnouncement::new(self.identity.clone(), self.owned_partitions(), action)
    }

    async fn publish_ownership(&mut self) -> Result<(), ControlMessageError> {
        let update = ControlMessage::UpdateVnodeTable {
            data: self.announcement(Some(TableAction::Add)),
        };
        self.channels.broadcast_message(update.encode()?).await?;

        Ok(())
    }

    async fn publish_ownership_or_warn(&mut self) {
        if let Err(e) = self.publish_ownership().await {
            slog::warn!(self.logger, "Failed to publish partition ownership: {}", e);
            if e.is_connection_lost() {
                self.fail(TransportError::ConnectionClosed.into()).await;
            }
        }
    }

    async fn reply(&self, rsvp: &str, payload: Bytes) -> Result<(), TransportError> {
        self.broker.declare_queue(rsvp, QueueOptions::transient()).await?;
        self.broker.publish(rsvp, payload).await
    }

    async fn reply_with_status(&mut self, rsvp: &str) -> Result<(), ControlMessageError> {
        let status = self.announcement(None).encode()?;
        self.reply(rsvp, status).await?;

        Ok(())
    }

    async fn set_log_level(&mut self, level: &str, rsvp: Option<&str>) -> Result<(), ControlMessageError> {
        let parsed = logging::parse_level(level).ok_or_else(|| ControlMessageError::InvalidLogLevel(level.to_string()))?;
        slog::info!(self.logger, "Setting log level to {}", logging::level_name(parsed));
        self.level_switch.set(parsed);

        if let Some(rsvp) = rsvp {
            let reply = LogLevelReply {
                level: logging::level_name(parsed).to_string(),
                node: self.identity.clone(),
            };
            self.reply(rsvp, reply.encode()?).await?;
        }

        Ok(())
    }

    /// Lets go of everything: tells peers this node is leaving, stops listening for control
    /// messages, then releases every partition. Safe to call more than once.
    pub(crate) async fn stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        slog::info!(self.logger, "Stopping partition coordinator");

        self.table_publisher.take();
        let departure = ControlMessage::UpdateVnodeTable {
            data: self.announcement(Some(TableAction::Remove)),
        };
        match departure.encode() {
            Ok(payload) => {
                if let Err(e) = self.channels.broadcast_message(payload).await {
                    slog::warn!(self.logger, "Failed to announce departure: {}", e);
                }
            }
            Err(e) => slog::warn!(self.logger, "Failed to encode departure: {}", e),
        }

        self.channels.stop().await;

        let partitions = self.owned_partitions();
        for partition in partitions.iter() {
            if let Some(handle) = self.owned.get_mut(partition) {
                handle.stop(&*self.broker).await;
            }
            self.partition_released(*partition);
        }
        slog::info!(self.logger, "Released {} partitions", partitions.len());
    }

    pub(crate) fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            local_node: self.identity.clone(),
            owned_partitions: self.owned_partitions(),
            ownership: self.table.entries(),
            leader: self.table.leader().cloned(),
            is_leader: self.table.local_node_is_leader(&self.identity),
            log_level: logging::level_name(self.level_switch.level()).to_string(),
            stopping: self.stopping,
        }
    }
}
