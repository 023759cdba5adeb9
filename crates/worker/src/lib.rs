//! JMX监控集群Worker
//!
//! 每个Worker在协调服务上注册心跳，竞争监控目标的所有权，
//! 把获得的目标及其配置交给轮询引擎，并处理发给所有者的控制请求。

pub mod admin;
pub mod components;
pub mod health;
pub mod polling_engine;
pub mod service;

pub use admin::ClusterAdmin;
pub use components::{
    eligible, AffinityResolver, ClaimOutcome, ClusterWatcher, ConfigDistributor, ElectionState,
    LossReason, MembershipEvent, OwnershipElector, OwnershipEvent, ReleaseReason,
    RequestChannel, WorkerRegistrar,
};
pub use health::{HealthReporter, HealthStatus};
pub use polling_engine::{LoggingPollingEngine, PollingEngine};
pub use service::{ClusterWorker, ClusterWorkerBuilder};
