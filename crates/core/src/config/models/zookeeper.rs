use serde::{Deserialize, Serialize};

use crate::errors::ClusterResult;
use crate::paths::PathScheme;

/// 协调服务相关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZookeeperConfig {
    pub connection_string: String,
    pub heartbeat_path: String,
    pub config_path: String,
    pub connect_timeout_ms: u64,
    /// 连续失败多少次后把Worker标记为不健康（之后继续重试）
    pub connect_retry: u32,
    pub session_timeout_ms: u64,
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            connection_string: "localhost:2181".to_string(),
            heartbeat_path: "/jmxtrans/workers".to_string(),
            config_path: "/jmxtrans/jvms".to_string(),
            connect_timeout_ms: 5_000,
            connect_retry: 5,
            session_timeout_ms: 30_000,
        }
    }
}

impl ZookeeperConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_string.is_empty() {
            return Err(anyhow::anyhow!("协调服务连接串不能为空"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        if self.connect_retry == 0 {
            return Err(anyhow::anyhow!("连接重试次数必须大于0"));
        }
        if self.session_timeout_ms == 0 {
            return Err(anyhow::anyhow!("会话超时时间必须大于0"));
        }
        self.path_scheme()?;
        Ok(())
    }

    pub fn path_scheme(&self) -> ClusterResult<PathScheme> {
        PathScheme::new(self.config_path.clone(), self.heartbeat_path.clone())
    }
}
