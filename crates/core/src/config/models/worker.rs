use serde::{Deserialize, Serialize};

use crate::paths::PathScheme;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub alias: String,
    pub affinity: Option<String>,
    /// 因控制请求释放目标后，本Worker暂停认领该目标的时间
    pub release_cooldown_seconds: u64,
    /// 全量重新评估所有目标的间隔，兜底丢失的变更通知
    pub resync_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let alias = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "worker-001".to_string());
        Self {
            alias,
            affinity: None,
            release_cooldown_seconds: 10,
            resync_interval_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        PathScheme::validate_alias(&self.alias)
            .map_err(|e| anyhow::anyhow!("Worker别名无效: {e}"))?;
        if let Some(affinity) = &self.affinity {
            PathScheme::validate_alias(affinity)
                .map_err(|e| anyhow::anyhow!("亲和性标签无效: {e}"))?;
        }
        if self.resync_interval_seconds == 0 {
            return Err(anyhow::anyhow!("重新评估间隔必须大于0"));
        }
        Ok(())
    }
}

/// 嵌入模式下同进程运行的额外Worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedWorkerConfig {
    pub alias: String,
    #[serde(default)]
    pub affinity: Option<String>,
}

/// 嵌入模式下启动时注册的监控目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub alias: String,
    #[serde(default)]
    pub affinity: Option<String>,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TargetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        PathScheme::validate_alias(&self.alias)
            .map_err(|e| anyhow::anyhow!("监控目标别名无效: {e}"))?;
        if let Some(affinity) = &self.affinity {
            PathScheme::validate_alias(affinity)
                .map_err(|e| anyhow::anyhow!("监控目标 {} 的亲和性标签无效: {e}", self.alias))?;
        }
        Ok(())
    }
}
