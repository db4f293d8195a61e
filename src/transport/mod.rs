mod api;
mod in_memory;

pub use api::Acker;
pub use api::Broker;
pub use api::BrokerConfig;
pub use api::Connector;
pub use api::ConsumerTag;
pub use api::Delivery;
pub use api::QueueOptions;
pub use api::QueueStatus;
pub use api::Subscription;
pub use api::TransportError;
pub use in_memory::InMemoryBroker;
pub use in_memory::InMemoryConnector;
