mod actor;
mod api;
mod cluster;
mod logging;
mod transport;

pub use actor::ClientError;
pub use actor::CoordinatorClient;
pub use api::start_cluster_worker;
pub use api::ClusterWorker;
pub use api::WorkerConfig;
pub use api::WorkerOptions;
pub use api::WorkerStartError;
pub use cluster::partition_range;
pub use cluster::Acknowledgement;
pub use cluster::ControlMessage;
pub use cluster::ControlMessageDecodeError;
pub use cluster::ControlMessageError;
pub use cluster::CoordinatorFailure;
pub use cluster::CoordinatorSnapshot;
pub use cluster::InFlightTracker;
pub use cluster::LogLevelReply;
pub use cluster::NoOpProcessor;
pub use cluster::NodeAnnouncement;
pub use cluster::NodeIdentity;
pub use cluster::OwnershipTable;
pub use cluster::OwnershipTableError;
pub use cluster::PartitionNumber;
pub use cluster::PartitionRangeError;
pub use cluster::ProcessMessage;
pub use cluster::TableAction;
pub use cluster::DEFAULT_TOTAL_PARTITIONS;
pub use logging::create_root_logger_for_file;
pub use logging::create_root_logger_for_stdout;
pub use logging::discard_logger;
pub use logging::level_name;
pub use logging::parse_level;
pub use logging::LevelSwitch;
pub use logging::RuntimeLevelFilter;
pub use transport::Acker;
pub use transport::Broker;
pub use transport::BrokerConfig;
pub use transport::Connector;
pub use transport::ConsumerTag;
pub use transport::Delivery;
pub use transport::InMemoryBroker;
pub use transport::InMemoryConnector;
pub use transport::QueueOptions;
pub use transport::QueueStatus;
pub use transport::Subscription;
pub use transport::TransportError;

// `crate::{root_mod}` holds no code, only `mod` and `pub use` statements. No `mod` is `pub`;
// everything public is exported through an individual `pub use`.
