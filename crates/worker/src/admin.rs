use std::sync::Arc;

use jmx_cluster_core::{
    ClusterError, ClusterResult, Command, CoordinationClient, CoordinationClientExt, CreateMode,
    MonitoredTarget, NodeVersion, OwnerPayload, PathScheme, RequestMessage, WorkerMetadata,
};
use tracing::{debug, info, warn};

use crate::components::RequestChannel;

/// 删除目标时子节点并发变化的重试上限
const MAX_REMOVE_ATTEMPTS: u32 = 10;

/// 集群管理操作：维护监控目标、亲和性和配置，并向所有者发送请求
pub struct ClusterAdmin {
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    requests: RequestChannel,
    issuer: String,
}

impl ClusterAdmin {
    pub fn new<S: Into<String>>(
        client: Arc<dyn CoordinationClient>,
        paths: PathScheme,
        issuer: S,
    ) -> Self {
        Self {
            requests: RequestChannel::new(Arc::clone(&client), paths.clone()),
            client,
            paths,
            issuer: issuer.into(),
        }
    }

    /// 注册监控目标。
    ///
    /// config节点最后写入：Worker只认领已有配置的目标，亲和性要求在目标可认领前就已生效。
    pub async fn register_target(
        &self,
        alias: &str,
        affinity: Option<&str>,
        config: Vec<u8>,
    ) -> ClusterResult<()> {
        let target_path = self.paths.target_path(alias)?;
        if let Some(label) = affinity {
            PathScheme::validate_alias(label)?;
        }
        self.client.ensure_path(self.paths.config_root()).await?;
        self.client
            .create_node(&target_path, Vec::new(), CreateMode::Persistent)
            .await?;
        if let Some(label) = affinity {
            self.client
                .create_node(
                    &self.paths.affinity_path(alias)?,
                    label.as_bytes().to_vec(),
                    CreateMode::Persistent,
                )
                .await?;
        }
        self.client
            .create_node(&self.paths.config_path(alias)?, config, CreateMode::Persistent)
            .await?;
        info!("注册监控目标 {} (亲和组 {:?})", alias, affinity);
        Ok(())
    }

    /// 删除监控目标及其全部子节点，目标不存在时视为成功
    pub async fn remove_target(&self, alias: &str) -> ClusterResult<()> {
        let target_path = self.paths.target_path(alias)?;
        // 先删config，目标不再可认领；再删owner
        let ordered = [
            self.paths.config_path(alias)?,
            self.paths.affinity_path(alias)?,
            self.paths.request_path(alias)?,
            self.paths.owner_path(alias)?,
        ];

        for attempt in 1..=MAX_REMOVE_ATTEMPTS {
            for path in &ordered {
                self.delete_if_exists(path).await?;
            }
            let children = match self.client.list_children(&target_path).await {
                Ok(children) => children,
                Err(ClusterError::NodeNotFound { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            for child in children {
                self.delete_if_exists(&format!("{target_path}/{child}")).await?;
            }

            match self.client.delete_node(&target_path, None).await {
                Ok(()) | Err(ClusterError::NodeNotFound { .. }) => {
                    info!("删除监控目标 {}", alias);
                    return Ok(());
                }
                Err(ClusterError::NodeNotEmpty { .. }) => {
                    debug!("目标 {} 仍有子节点（第 {} 次）", alias, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("目标 {} 的子节点持续变化，放弃删除", alias);
        Err(ClusterError::NodeNotEmpty { path: target_path })
    }

    async fn delete_if_exists(&self, path: &str) -> ClusterResult<()> {
        match self.client.delete_node(path, None).await {
            Ok(()) | Err(ClusterError::NodeNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 修改亲和性要求，None表示取消约束
    pub async fn set_affinity(&self, alias: &str, affinity: Option<&str>) -> ClusterResult<()> {
        self.require_target(alias).await?;
        let path = self.paths.affinity_path(alias)?;
        match affinity {
            None => self.delete_if_exists(&path).await?,
            Some(label) => {
                PathScheme::validate_alias(label)?;
                self.upsert(&path, label.as_bytes().to_vec()).await?;
            }
        }
        info!("目标 {} 的亲和性要求改为 {:?}", alias, affinity);
        Ok(())
    }

    /// 写入新配置，返回新版本号
    pub async fn update_config(&self, alias: &str, config: Vec<u8>) -> ClusterResult<NodeVersion> {
        self.require_target(alias).await?;
        let version = self.upsert(&self.paths.config_path(alias)?, config).await?;
        info!("目标 {} 的监控配置更新到版本 {}", alias, version);
        Ok(version)
    }

    async fn upsert(&self, path: &str, payload: Vec<u8>) -> ClusterResult<NodeVersion> {
        match self.client.write_node(path, payload.clone(), None).await {
            Ok(stat) => Ok(stat.version),
            Err(ClusterError::NodeNotFound { .. }) => {
                match self
                    .client
                    .create_node(path, payload.clone(), CreateMode::Persistent)
                    .await
                {
                    Ok(stat) => Ok(stat.version),
                    // 并发创建时退回到写入
                    Err(ClusterError::NodeExists { .. }) => {
                        Ok(self.client.write_node(path, payload, None).await?.version)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn require_target(&self, alias: &str) -> ClusterResult<()> {
        match self.client.exists(&self.paths.target_path(alias)?).await? {
            Some(_) => Ok(()),
            None => Err(ClusterError::TargetNotFound {
                alias: alias.to_string(),
            }),
        }
    }

    pub async fn send_request(
        &self,
        alias: &str,
        command: Command,
    ) -> ClusterResult<Option<RequestMessage>> {
        self.requests.send(alias, command, &self.issuer).await
    }

    pub async fn owner_of(&self, alias: &str) -> ClusterResult<Option<OwnerPayload>> {
        match self
            .client
            .read_optional(&self.paths.owner_path(alias)?)
            .await?
        {
            Some((payload, _)) => Ok(Some(OwnerPayload::from_payload(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn list_targets(&self) -> ClusterResult<Vec<String>> {
        match self.client.list_children(self.paths.config_root()).await {
            Ok(children) => Ok(children),
            Err(ClusterError::NodeNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn describe_target(&self, alias: &str) -> ClusterResult<MonitoredTarget> {
        self.require_target(alias).await?;
        let affinity = match self
            .client
            .read_optional(&self.paths.affinity_path(alias)?)
            .await?
        {
            Some((payload, _)) => {
                let label = String::from_utf8_lossy(&payload).trim().to_string();
                (!label.is_empty()).then_some(label)
            }
            None => None,
        };
        let config_version = self
            .client
            .exists(&self.paths.config_path(alias)?)
            .await?
            .map(|stat| stat.version);

        Ok(MonitoredTarget {
            alias: alias.to_string(),
            affinity,
            owner: self.owner_of(alias).await?,
            config_version,
        })
    }

    /// 当前存活的Worker
    pub async fn live_workers(&self) -> ClusterResult<Vec<WorkerMetadata>> {
        let children = match self.client.list_children(self.paths.heartbeat_root()).await {
            Ok(children) => children,
            Err(ClusterError::NodeNotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut workers = Vec::with_capacity(children.len());
        for child in children {
            if let Some((payload, _)) = self
                .client
                .read_optional(&self.paths.worker_path(&child)?)
                .await?
            {
                match WorkerMetadata::from_payload(&payload) {
                    Ok(metadata) => workers.push(metadata),
                    Err(e) => warn!("无法解析Worker {} 的心跳数据: {}", child, e),
                }
            }
        }
        Ok(workers)
    }
}
