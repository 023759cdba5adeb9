pub mod affinity;
pub mod cluster_watcher;
pub mod config_distributor;
pub mod elector;
pub mod registrar;
pub mod request_channel;

pub use affinity::{eligible, AffinityResolver};
pub use cluster_watcher::ClusterWatcher;
pub use config_distributor::ConfigDistributor;
pub use elector::{
    ClaimOutcome, ElectionState, LossReason, OwnershipElector, OwnershipEvent, ReleaseReason,
};
pub use registrar::{MembershipEvent, WorkerRegistrar};
pub use request_channel::RequestChannel;
