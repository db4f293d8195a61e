//! This mod holds the library's client-facing API for running a cluster worker.
mod options;
mod wiring;
mod worker;

pub use options::WorkerOptions;
pub use wiring::start_cluster_worker;
pub use wiring::WorkerConfig;
pub use wiring::WorkerStartError;
pub use worker::ClusterWorker;
