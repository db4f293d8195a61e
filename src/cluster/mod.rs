mod control_message;
mod coordinator;
mod identity;
mod ownership_table;
mod partition;
mod processor;
mod timers;

pub use control_message::ControlMessage;
pub use control_message::ControlMessageDecodeError;
pub use control_message::LogLevelReply;
pub use control_message::NodeAnnouncement;
pub use control_message::TableAction;
pub use coordinator::ControlMessageError;
pub use coordinator::CoordinatorFailure;
pub use coordinator::CoordinatorSnapshot;
pub use identity::NodeIdentity;
pub use ownership_table::OwnershipTable;
pub use ownership_table::OwnershipTableError;
pub use partition::partition_range;
pub use partition::PartitionNumber;
pub use partition::PartitionRangeError;
pub use partition::DEFAULT_TOTAL_PARTITIONS;
pub use processor::Acknowledgement;
pub use processor::InFlightTracker;
pub use processor::NoOpProcessor;
pub use processor::ProcessMessage;

pub(crate) use coordinator::CoordinatorConfig;
pub(crate) use coordinator::PartitionCoordinator;
pub(crate) use identity::ControlMessageSink;
pub(crate) use timers::TimerTick;
