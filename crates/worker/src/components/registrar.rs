use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jmx_cluster_core::{
    ClusterError, ClusterResult, CoordinationClient, CoordinationClientExt, CreateMode, NodeStat,
    PathScheme, RetryPolicy, SessionId, WorkerMetadata,
};
use metrics::{counter, gauge};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::health::HealthReporter;

/// 集群成员变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    WorkerJoined(WorkerMetadata),
    WorkerLost(String),
}

#[derive(Debug, Clone)]
struct Registration {
    metadata: WorkerMetadata,
    stat: NodeStat,
}

/// Worker注册：在心跳根路径下维护本Worker的临时节点，并跟踪存活成员
pub struct WorkerRegistrar {
    alias: String,
    affinity: Option<String>,
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    retry: RetryPolicy,
    /// 连续失败达到该次数后上报不健康，但仍继续重试
    retry_budget: u32,
    health: HealthReporter,
    registration: RwLock<Option<Registration>>,
    members: RwLock<BTreeMap<String, WorkerMetadata>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl WorkerRegistrar {
    pub fn new(
        alias: String,
        affinity: Option<String>,
        client: Arc<dyn CoordinationClient>,
        paths: PathScheme,
        retry: RetryPolicy,
        retry_budget: u32,
        health: HealthReporter,
    ) -> ClusterResult<Self> {
        PathScheme::validate_alias(&alias)?;
        if let Some(label) = &affinity {
            PathScheme::validate_alias(label)?;
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            alias,
            affinity,
            client,
            paths,
            retry,
            retry_budget: retry_budget.max(1),
            health,
            registration: RwLock::new(None),
            members: RwLock::new(BTreeMap::new()),
            events,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn affinity(&self) -> Option<&str> {
        self.affinity.as_deref()
    }

    /// 按重试预算退避完所需的时间，会话中断超过它即视为协调服务不可用
    pub fn outage_budget(&self) -> Duration {
        (0..self.retry_budget).map(|attempt| self.retry.delay_for(attempt)).sum()
    }

    /// 注册本Worker，可重试错误按退避策略无限重试。
    ///
    /// 别名已被其他存活会话占用时返回 `DuplicateWorker`，属于致命错误。
    pub async fn register(&self) -> ClusterResult<WorkerMetadata> {
        let mut attempt: u32 = 0;
        loop {
            match self.try_register().await {
                Ok(metadata) => {
                    if attempt > 0 {
                        info!("Worker {} 经过 {} 次重试后注册成功", self.alias, attempt);
                    }
                    return Ok(metadata);
                }
                Err(e) if e.is_retryable() => {
                    attempt = attempt.saturating_add(1);
                    counter!("jmx_cluster_registration_retries_total").increment(1);
                    if attempt == self.retry_budget {
                        self.health
                            .set_unhealthy(format!("注册失败 {attempt} 次，协调服务不可用: {e}"));
                    } else {
                        warn!("Worker {} 注册失败（第 {} 次）: {}", self.alias, attempt, e);
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.health.set_unhealthy(e.to_string());
                    }
                    error!("Worker {} 注册失败: {}", self.alias, e);
                    return Err(e);
                }
            }
        }
    }

    async fn try_register(&self) -> ClusterResult<WorkerMetadata> {
        let session_id = self.current_session()?;
        let path = self.paths.worker_path(&self.alias)?;
        self.client.ensure_path(self.paths.heartbeat_root()).await?;

        let metadata = WorkerMetadata::new(self.alias.clone(), self.affinity.clone(), session_id);
        let stat = match self
            .client
            .create_node(&path, metadata.to_payload()?, CreateMode::Ephemeral)
            .await
        {
            Ok(stat) => stat,
            Err(ClusterError::NodeExists { .. }) => {
                let (_, stat) = self.client.read_node(&path).await?;
                if stat.ephemeral_owner != Some(session_id) {
                    return Err(ClusterError::DuplicateWorker {
                        alias: self.alias.clone(),
                    });
                }
                // 同一会话中重复注册，沿用已有节点
                debug!("心跳节点 {} 已属于当前会话", path);
                stat
            }
            Err(e) => return Err(e),
        };

        *self.registration.write().await = Some(Registration {
            metadata: metadata.clone(),
            stat,
        });
        counter!("jmx_cluster_registrations_total").increment(1);
        info!(
            "Worker {} 已注册 (会话 {}, 亲和组 {:?})",
            self.alias, session_id, self.affinity
        );
        Ok(metadata)
    }

    fn current_session(&self) -> ClusterResult<SessionId> {
        if !self.client.session_state().is_connected() {
            return Err(ClusterError::SessionDisconnected);
        }
        self.client.session_id().ok_or(ClusterError::SessionExpired)
    }

    /// 主动删除心跳节点。节点已不存在或属于其他会话时视为成功。
    pub async fn deregister(&self) -> ClusterResult<()> {
        let Some(registration) = self.registration.write().await.take() else {
            return Ok(());
        };
        let path = self.paths.worker_path(&self.alias)?;
        match self
            .client
            .delete_node(&path, Some(registration.stat.version))
            .await
        {
            Ok(()) => {
                info!("Worker {} 已注销", self.alias);
                Ok(())
            }
            Err(ClusterError::NodeNotFound { .. }) | Err(ClusterError::VersionConflict { .. }) => {
                debug!("Worker {} 的心跳节点已不存在", self.alias);
                Ok(())
            }
            Err(e) if e.is_session_error() => {
                // 会话结束后临时节点会被服务端删除
                warn!("注销Worker {} 时会话不可用: {}", self.alias, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 会话过期后，临时节点已被删除
    pub async fn mark_unregistered(&self) {
        if self.registration.write().await.take().is_some() {
            warn!("Worker {} 的注册随会话一起失效", self.alias);
        }
    }

    pub async fn is_registered(&self) -> bool {
        self.registration.read().await.is_some()
    }

    pub async fn registration(&self) -> Option<WorkerMetadata> {
        self.registration
            .read()
            .await
            .as_ref()
            .map(|r| r.metadata.clone())
    }

    /// 重新读取心跳子节点，返回与上次相比的成员变化
    pub async fn refresh_members(&self) -> ClusterResult<Vec<MembershipEvent>> {
        let children = match self.client.list_children(self.paths.heartbeat_root()).await {
            Ok(children) => children,
            Err(ClusterError::NodeNotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut current = BTreeMap::new();
        for child in children {
            let path = self.paths.worker_path(&child)?;
            let Some((payload, _)) = self.client.read_optional(&path).await? else {
                continue;
            };
            match WorkerMetadata::from_payload(&payload) {
                Ok(metadata) => {
                    current.insert(child, metadata);
                }
                Err(e) => warn!("无法解析Worker {} 的心跳数据: {}", child, e),
            }
        }

        let mut members = self.members.write().await;
        let mut changes = Vec::new();
        for alias in members.keys() {
            if !current.contains_key(alias) {
                changes.push(MembershipEvent::WorkerLost(alias.clone()));
            }
        }
        for (alias, metadata) in &current {
            if members.get(alias) != Some(metadata) {
                changes.push(MembershipEvent::WorkerJoined(metadata.clone()));
            }
        }
        *members = current;
        gauge!("jmx_cluster_live_workers").set(members.len() as f64);
        drop(members);

        for change in &changes {
            match change {
                MembershipEvent::WorkerJoined(m) => info!("Worker {} 加入集群", m.alias),
                MembershipEvent::WorkerLost(alias) => warn!("Worker {} 离开集群", alias),
            }
            let _ = self.events.send(change.clone());
        }
        Ok(changes)
    }

    pub async fn is_alive(&self, alias: &str) -> bool {
        self.members.read().await.contains_key(alias)
    }

    pub async fn member(&self, alias: &str) -> Option<WorkerMetadata> {
        self.members.read().await.get(alias).cloned()
    }

    pub async fn members(&self) -> Vec<WorkerMetadata> {
        self.members.read().await.values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
