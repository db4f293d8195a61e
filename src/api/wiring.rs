use crate::actor::{self, CoordinatorActor, CoordinatorClient};
use crate::api::options::WorkerOptionsValidated;
use crate::api::worker::ClusterWorker;
use crate::cluster::{
    partition_range, CoordinatorConfig, InFlightTracker, NodeIdentity, PartitionCoordinator, PartitionNumber,
    PartitionRangeError, ProcessMessage,
};
use crate::logging::LevelSwitch;
use crate::transport::{Broker, BrokerConfig, Connector, TransportError};
use crate::WorkerOptions;
use std::convert::TryFrom;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub struct WorkerConfig<C, P> {
    pub connector: C,
    pub broker_config: BrokerConfig,
    pub processor: P,
    // 1-based position of this worker among `node_count` workers.
    pub node_index: u32,
    pub node_count: u32,
    pub total_partitions: u32,
    pub logger: slog::Logger,
    pub level_switch: LevelSwitch,
    pub options: WorkerOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerStartError {
    #[error("Illegal worker options: {0}")]
    IllegalOptions(String),
    #[error("Invalid partition assignment: {0}")]
    InvalidPartitionRange(#[from] PartitionRangeError),
    #[error("Could not determine local node identity")]
    LocalIdentity(#[source] io::Error),
    #[error("Broker failure during startup: {0}")]
    Transport(#[from] TransportError),
}

/// Connects to the broker (retrying for as long as it takes), claims this worker's initial
/// partition range and starts coordinating with the rest of the cluster.
pub async fn start_cluster_worker<C, P>(config: WorkerConfig<C, P>) -> Result<ClusterWorker<C::Broker>, WorkerStartError>
where
    C: Connector,
    P: ProcessMessage,
{
    let options = WorkerOptionsValidated::try_from(config.options)
        .map_err(|e| WorkerStartError::IllegalOptions(e.to_string()))?;
    let partitions = partition_range(config.total_partitions, config.node_index, config.node_count)?;
    let identity = NodeIdentity::local(&config.logger).map_err(WorkerStartError::LocalIdentity)?;

    let logger = config.logger.new(slog::o!("Node" => identity.identifier()));
    slog::info!(
        logger,
        "Starting worker {} of {}, initial partitions {}..{} of {}",
        config.node_index,
        config.node_count,
        partitions.start,
        partitions.end,
        config.total_partitions
    );

    let broker = connect_with_retry(&logger, &config.connector, &config.broker_config, options.reconnect_delay).await?;
    let broker = Arc::new(broker);

    let (client, receiver) = CoordinatorClient::new(options.event_queue_size);
    let in_flight = InFlightTracker::new();
    let mut coordinator = PartitionCoordinator::new(CoordinatorConfig {
        logger: logger.clone(),
        broker: broker.clone(),
        processor: Arc::new(config.processor),
        identity: identity.clone(),
        in_flight: in_flight.clone(),
        level_switch: config.level_switch,
        client: client.weak(),
        consumer_check_interval: options.consumer_check_interval,
        table_publish_interval: options.table_publish_interval,
    });

    if let Err(e) = coordinator.start(partitions.clone().map(PartitionNumber::new)).await {
        slog::error!(logger, "Failed to start partition coordinator: {}", e);
        broker.close().await;
        return Err(e.into());
    }

    let (outcome_tx, outcome) = actor::outcome_channel();
    let actor = CoordinatorActor::new(logger.clone(), receiver, coordinator, outcome_tx);
    let event_loop = tokio::task::spawn(actor.run_event_loop());

    Ok(ClusterWorker {
        logger,
        identity,
        partitions,
        client,
        broker,
        in_flight,
        drain_poll_interval: options.drain_poll_interval,
        event_loop,
        outcome,
    })
}

/// Only `CouldNotConnect` is retried, with a hard reset before each wait. There is no cap on
/// attempts. Any other failure (e.g. bad credentials) is returned right away.
async fn connect_with_retry<C: Connector>(
    logger: &slog::Logger,
    connector: &C,
    broker_config: &BrokerConfig,
    reconnect_delay: Duration,
) -> Result<C::Broker, TransportError> {
    loop {
        match connector.connect(broker_config).await {
            Ok(broker) => {
                slog::info!(logger, "Connected to broker {:?}", broker_config);
                return Ok(broker);
            }
            Err(e) if e.is_could_not_connect() => {
                slog::error!(
                    logger,
                    "Could not connect to broker: {}. Retrying in {:?}",
                    e,
                    reconnect_delay
                );
                connector.hard_reset().await;
                tokio::time::sleep(reconnect_delay).await;
            }
            Err(e) => {
                slog::error!(logger, "Broker connection failed: {}", e);
                return Err(e);
            }
        }
    }
}
