use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::ClusterResult;
use crate::traits::{NodeVersion, SessionId};

/// 监控目标（JVM）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredTarget {
    pub alias: String,
    /// 要求的亲和性标签，None表示无约束
    pub affinity: Option<String>,
    pub owner: Option<OwnerPayload>,
    pub config_version: Option<NodeVersion>,
}

impl MonitoredTarget {
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owned_by(&self, worker_alias: &str) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.worker_alias == worker_alias)
    }
}

/// owner临时节点的内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerPayload {
    pub worker_alias: String,
    pub session_token: SessionId,
}

impl OwnerPayload {
    pub fn to_payload(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> ClusterResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// 所有权记录：监控目标 -> Worker，绑定到所有者的协调会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub target: String,
    pub worker_alias: String,
    pub session_token: SessionId,
    /// 认领时owner节点的版本，释放时用于条件删除
    pub version: NodeVersion,
    pub claimed_at: DateTime<Utc>,
}

/// 监控配置。内容对协调层不透明，版本号用于判断是否过期。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob {
    pub target: String,
    pub data: Vec<u8>,
    pub version: NodeVersion,
}

impl ConfigBlob {
    pub fn new(target: String, data: Vec<u8>, version: NodeVersion) -> Self {
        Self {
            target,
            data,
            version,
        }
    }

    /// 按JSON解析配置内容（连接参数、查询定义等由轮询引擎定义结构）
    pub fn parse<T: DeserializeOwned>(&self) -> ClusterResult<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn is_newer_than(&self, applied: Option<NodeVersion>) -> bool {
        match applied {
            Some(v) => self.version > v,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_payload_round_trip() {
        let owner = OwnerPayload {
            worker_alias: "w1".to_string(),
            session_token: 42,
        };
        let decoded = OwnerPayload::from_payload(&owner.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, owner);
    }

    #[test]
    fn test_config_blob_versions() {
        let blob = ConfigBlob::new("jvm-1".to_string(), br#"{"host":"db1","port":9999}"#.to_vec(), 3);
        assert!(blob.is_newer_than(None));
        assert!(blob.is_newer_than(Some(2)));
        assert!(!blob.is_newer_than(Some(3)));
        assert!(!blob.is_newer_than(Some(4)));

        let value: serde_json::Value = blob.parse().unwrap();
        assert_eq!(value["port"], 9999);
    }

    #[test]
    fn test_target_ownership() {
        let target = MonitoredTarget {
            alias: "jvm-1".to_string(),
            affinity: None,
            owner: Some(OwnerPayload {
                worker_alias: "w2".to_string(),
                session_token: 1,
            }),
            config_version: Some(0),
        };
        assert!(target.is_owned());
        assert!(target.owned_by("w2"));
        assert!(!target.owned_by("w1"));
    }
}
