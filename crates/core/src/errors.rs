use thiserror::Error;

/// 集群协调错误类型定义
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("无效的别名 '{alias}': {reason}")]
    InvalidAlias { alias: String, reason: String },

    #[error("节点已存在: {path}")]
    NodeExists { path: String },

    #[error("节点不存在: {path}")]
    NodeNotFound { path: String },

    #[error("节点版本冲突: {path} (期望版本 {expected})")]
    VersionConflict { path: String, expected: i32 },

    #[error("节点仍有子节点: {path}")]
    NodeNotEmpty { path: String },

    #[error("协调服务会话已断开")]
    SessionDisconnected,

    #[error("协调服务会话已过期")]
    SessionExpired,

    #[error("协调服务不可用: {0}")]
    CoordinationUnavailable(String),

    #[error("Worker别名重复: {alias}")]
    DuplicateWorker { alias: String },

    #[error("监控目标不存在: {alias}")]
    TargetNotFound { alias: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    pub fn invalid_alias<A: Into<String>, R: Into<String>>(alias: A, reason: R) -> Self {
        Self::InvalidAlias {
            alias: alias.into(),
            reason: reason.into(),
        }
    }
    pub fn node_exists<S: Into<String>>(path: S) -> Self {
        Self::NodeExists { path: path.into() }
    }
    pub fn node_not_found<S: Into<String>>(path: S) -> Self {
        Self::NodeNotFound { path: path.into() }
    }
    pub fn version_conflict<S: Into<String>>(path: S, expected: i32) -> Self {
        Self::VersionConflict {
            path: path.into(),
            expected,
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 会话类错误：断开后自动重连即可恢复
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ClusterError::SessionDisconnected | ClusterError::SessionExpired
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::SessionDisconnected
                | ClusterError::SessionExpired
                | ClusterError::CoordinationUnavailable(_)
        )
    }

    /// 致命错误不重试，直接交给调用方
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidAlias { .. }
                | ClusterError::DuplicateWorker { .. }
                | ClusterError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ClusterError {
    fn from(err: anyhow::Error) -> Self {
        ClusterError::Internal(err.to_string())
    }
}
