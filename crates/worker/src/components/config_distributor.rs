use std::collections::HashMap;
use std::sync::Arc;

use jmx_cluster_core::{
    ClusterResult, ConfigBlob, CoordinationClient, CoordinationClientExt, NodeVersion, PathScheme,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 监控配置分发：读取目标的config节点，并保证每个版本只交付一次
pub struct ConfigDistributor {
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    applied: RwLock<HashMap<String, NodeVersion>>,
}

impl ConfigDistributor {
    pub fn new(client: Arc<dyn CoordinationClient>, paths: PathScheme) -> Self {
        Self {
            client,
            paths,
            applied: RwLock::new(HashMap::new()),
        }
    }

    pub async fn read(&self, target: &str) -> ClusterResult<ConfigBlob> {
        let path = self.paths.config_path(target)?;
        let (data, stat) = self.client.read_node(&path).await?;
        Ok(ConfigBlob::new(target.to_string(), data, stat.version))
    }

    pub async fn read_optional(&self, target: &str) -> ClusterResult<Option<ConfigBlob>> {
        let path = self.paths.config_path(target)?;
        Ok(self
            .client
            .read_optional(&path)
            .await?
            .map(|(data, stat)| ConfigBlob::new(target.to_string(), data, stat.version)))
    }

    /// 读取当前配置，版本比上次交付的新时返回并记为已交付
    pub async fn check_for_update(&self, target: &str) -> ClusterResult<Option<ConfigBlob>> {
        let Some(blob) = self.read_optional(target).await? else {
            return Ok(None);
        };
        let mut applied = self.applied.write().await;
        let last = applied.get(target).copied();
        if !blob.is_newer_than(last) {
            debug!(
                "目标 {} 的配置版本 {} 已交付 (上次 {:?})",
                target, blob.version, last
            );
            return Ok(None);
        }
        applied.insert(target.to_string(), blob.version);
        info!("目标 {} 的监控配置更新到版本 {}", target, blob.version);
        Ok(Some(blob))
    }

    /// 记录在其他路径上交付的版本（例如重新加载请求）
    pub async fn mark_applied(&self, target: &str, version: NodeVersion) {
        let mut applied = self.applied.write().await;
        let entry = applied.entry(target.to_string()).or_insert(version);
        if *entry < version {
            *entry = version;
        }
    }

    pub async fn applied_version(&self, target: &str) -> Option<NodeVersion> {
        self.applied.read().await.get(target).copied()
    }

    /// 失去所有权后清除交付记录，下次获得所有权时重新交付当前版本
    pub async fn forget(&self, target: &str) {
        self.applied.write().await.remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jmx_cluster_core::{ClusterError, CreateMode};
    use jmx_cluster_infrastructure::InMemoryCoordinationService;

    fn paths() -> PathScheme {
        PathScheme::new("/jmxtrans/jvms", "/jmxtrans/workers").unwrap()
    }

    #[tokio::test]
    async fn test_each_version_delivered_once() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        client.ensure_path("/jmxtrans/jvms/jvm-1").await.unwrap();
        let configs = ConfigDistributor::new(client.clone(), paths());

        assert!(configs.check_for_update("jvm-1").await.unwrap().is_none());
        client
            .create_node("/jmxtrans/jvms/jvm-1/config", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let blob = configs.check_for_update("jvm-1").await.unwrap().unwrap();
        assert_eq!(blob.data, b"v0");
        assert_eq!(blob.version, 0);
        assert!(configs.check_for_update("jvm-1").await.unwrap().is_none());

        client
            .write_node("/jmxtrans/jvms/jvm-1/config", b"v1".to_vec(), None)
            .await
            .unwrap();
        let blob = configs.check_for_update("jvm-1").await.unwrap().unwrap();
        assert_eq!((blob.data.as_slice(), blob.version), (&b"v1"[..], 1));
        assert_eq!(configs.applied_version("jvm-1").await, Some(1));

        configs.forget("jvm-1").await;
        assert!(configs.check_for_update("jvm-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_missing_config() {
        let service = InMemoryCoordinationService::new();
        let configs = ConfigDistributor::new(service.connect(), paths());
        assert!(matches!(
            configs.read("jvm-1").await,
            Err(ClusterError::NodeNotFound { .. })
        ));
        assert!(configs.read_optional("jvm-1").await.unwrap().is_none());
    }
}
