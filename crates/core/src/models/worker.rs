use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ClusterResult;
use crate::traits::SessionId;

/// Worker心跳节点中保存的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub alias: String,
    pub hostname: String,
    /// 亲和组标签，None表示可以认领任何无约束的监控目标
    pub affinity: Option<String>,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
}

impl WorkerMetadata {
    pub fn new(alias: String, affinity: Option<String>, session_id: SessionId) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            alias,
            hostname,
            affinity,
            session_id,
            started_at: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> ClusterResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
