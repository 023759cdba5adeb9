//! JMX监控集群协调核心
//!
//! 包含路径方案、协调服务客户端抽象、数据模型、配置和错误类型。
//! 其余组件只通过这里定义的接口访问协调服务。

pub mod config;
pub mod errors;
pub mod models;
pub mod paths;
pub mod retry;
pub mod traits;

pub use config::{
    ClusterConfig, EmbeddedWorkerConfig, ObservabilityConfig, TargetConfig, WorkerConfig,
    ZookeeperConfig,
};
pub use errors::*;
pub use models::{
    Command, ConfigBlob, MonitoredTarget, OwnerPayload, OwnershipRecord, RequestMessage,
    WorkerMetadata,
};
pub use paths::{PathKind, PathScheme};
pub use retry::RetryPolicy;
pub use traits::{
    CoordinationClient, CoordinationClientExt, CreateMode, NodeStat, NodeVersion, SessionEvent,
    SessionId, SessionState, WatchEvent, WatchEventKind, WatchId, WatchReceiver, WatchSender,
};
