pub mod cluster_config;
pub mod observability;
pub mod worker;
pub mod zookeeper;

pub use cluster_config::ClusterConfig;
pub use observability::ObservabilityConfig;
pub use worker::{EmbeddedWorkerConfig, TargetConfig, WorkerConfig};
pub use zookeeper::ZookeeperConfig;
