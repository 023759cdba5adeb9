use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use jmx_cluster_core::{
    ClusterError, ClusterResult, CoordinationClient, CreateMode, NodeStat, NodeVersion,
    OwnerPayload, OwnershipRecord, PathScheme, SessionId,
};
use metrics::{counter, gauge};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::AffinityResolver;

/// 单个监控目标的选举状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    Unclaimed,
    Claiming,
    Owned(OwnershipRecord),
    Releasing,
    /// Worker正在停止，不再认领
    Released,
}

/// 主动释放所有权的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Shutdown,
    Requested,
    Reassigned,
    AffinityChanged,
    TargetRemoved,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Shutdown => "shutdown",
            ReleaseReason::Requested => "requested",
            ReleaseReason::Reassigned => "reassigned",
            ReleaseReason::AffinityChanged => "affinity_changed",
            ReleaseReason::TargetRemoved => "target_removed",
        }
    }

    /// 按请求释放后，在冷却期内不再重新认领，让其他Worker有机会接手
    fn applies_cooldown(&self) -> bool {
        matches!(self, ReleaseReason::Requested | ReleaseReason::Reassigned)
    }
}

/// 被动失去所有权的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    SessionExpired,
    /// owner节点已被删除
    OwnerNodeMissing,
    /// owner节点已属于其他会话
    OwnerNodeReplaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired(OwnershipRecord),
    AlreadyOwned,
    /// 已被其他Worker认领，附带读到的所有者别名
    OwnedByOther(Option<String>),
    Ineligible,
    /// 会话不可用，暂停认领
    Suspended,
    CoolingDown,
    /// 同一目标上已有认领或释放在进行
    InProgress,
    /// 认领期间被释放请求取消
    Cancelled,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipEvent {
    Acquired(OwnershipRecord),
    Released {
        target: String,
        reason: ReleaseReason,
    },
    Lost {
        target: String,
        reason: LossReason,
    },
}

#[derive(Debug)]
struct TargetEntry {
    state: ElectionState,
    /// 每次发起或取消认领时递增，用于识别过期的认领结果
    generation: u64,
    cooldown_until: Option<Instant>,
    /// 已发出但尚未返回的创建请求数
    inflight: usize,
    /// 会话中断时没能删除的owner节点，重连后再删除
    pending_release: Option<OwnershipRecord>,
}

impl TargetEntry {
    fn new() -> Self {
        Self {
            state: ElectionState::Unclaimed,
            generation: 0,
            cooldown_until: None,
            inflight: 0,
            pending_release: None,
        }
    }

    fn owned(&self) -> Option<&OwnershipRecord> {
        match &self.state {
            ElectionState::Owned(record) => Some(record),
            _ => None,
        }
    }
}

/// 所有权选举
///
/// 通过在目标下原子创建临时owner节点来认领，创建成功者即为唯一所有者。
/// 每个目标有独立的锁，同一目标上的认领和释放串行执行，不同目标互不阻塞。
pub struct OwnershipElector {
    alias: String,
    affinity: Option<String>,
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    resolver: Arc<AffinityResolver>,
    release_cooldown: Duration,
    targets: RwLock<HashMap<String, Arc<Mutex<TargetEntry>>>>,
    suspended: AtomicBool,
    stopped: AtomicBool,
    events: broadcast::Sender<OwnershipEvent>,
}

impl OwnershipElector {
    pub fn new(
        alias: String,
        affinity: Option<String>,
        client: Arc<dyn CoordinationClient>,
        paths: PathScheme,
        resolver: Arc<AffinityResolver>,
        release_cooldown: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            alias,
            affinity,
            client,
            paths,
            resolver,
            release_cooldown,
            targets: RwLock::new(HashMap::new()),
            suspended: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OwnershipEvent> {
        self.events.subscribe()
    }

    pub fn release_cooldown(&self) -> Duration {
        self.release_cooldown
    }

    /// 会话中断期间暂停认领
    pub fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            warn!("Worker {} 暂停认领监控目标", self.alias);
        }
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            info!("Worker {} 恢复认领监控目标", self.alias);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    async fn entry(&self, target: &str) -> Arc<Mutex<TargetEntry>> {
        if let Some(entry) = self.targets.read().await.get(target) {
            return Arc::clone(entry);
        }
        let mut targets = self.targets.write().await;
        Arc::clone(
            targets
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TargetEntry::new()))),
        )
    }

    async fn existing_entry(&self, target: &str) -> Option<Arc<Mutex<TargetEntry>>> {
        self.targets.read().await.get(target).cloned()
    }

    async fn entries(&self) -> Vec<(String, Arc<Mutex<TargetEntry>>)> {
        self.targets
            .read()
            .await
            .iter()
            .map(|(target, entry)| (target.clone(), Arc::clone(entry)))
            .collect()
    }

    fn emit(&self, event: OwnershipEvent) {
        let _ = self.events.send(event);
    }

    fn owned_gauge(&self, delta: f64) {
        let gauge = gauge!("jmx_cluster_owned_targets", "worker" => self.alias.clone());
        if delta >= 0.0 {
            gauge.increment(delta);
        } else {
            gauge.decrement(-delta);
        }
    }

    /// 尝试认领监控目标
    pub async fn claim(&self, target: &str) -> ClusterResult<ClaimOutcome> {
        let owner_path = self.paths.owner_path(target)?;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(ClaimOutcome::Stopped);
        }
        if self.is_suspended() {
            return Ok(ClaimOutcome::Suspended);
        }
        let Some(session_token) = self.client.session_id() else {
            return Ok(ClaimOutcome::Suspended);
        };
        let payload = OwnerPayload {
            worker_alias: self.alias.clone(),
            session_token,
        }
        .to_payload()?;

        let entry = self.entry(target).await;
        let generation = {
            let mut e = entry.lock().await;
            match &e.state {
                ElectionState::Unclaimed => {}
                ElectionState::Owned(_) => return Ok(ClaimOutcome::AlreadyOwned),
                ElectionState::Claiming | ElectionState::Releasing => {
                    return Ok(ClaimOutcome::InProgress)
                }
                ElectionState::Released => return Ok(ClaimOutcome::Stopped),
            }
            if let Some(until) = e.cooldown_until {
                if Instant::now() < until {
                    return Ok(ClaimOutcome::CoolingDown);
                }
                e.cooldown_until = None;
            }
            if !self
                .resolver
                .is_eligible(self.affinity.as_deref(), target)
                .await?
            {
                debug!("Worker {} 不满足目标 {} 的亲和性要求", self.alias, target);
                return Ok(ClaimOutcome::Ineligible);
            }
            e.state = ElectionState::Claiming;
            e.generation += 1;
            e.inflight += 1;
            e.generation
        };

        counter!("jmx_cluster_claim_attempts_total").increment(1);
        // 创建期间不持有目标锁，释放请求可以取消本次认领
        let result = self
            .client
            .create_node(&owner_path, payload, CreateMode::Ephemeral)
            .await;

        let mut e = entry.lock().await;
        e.inflight -= 1;
        let current = e.generation == generation && e.state == ElectionState::Claiming;
        match result {
            // 认领期间会话已更换，节点内容里的会话号已失效
            Ok(stat) if stat.ephemeral_owner != Some(session_token) => {
                if current {
                    e.state = ElectionState::Unclaimed;
                }
                drop(e);
                warn!(
                    "目标 {} 的owner节点创建于会话 {:?}，与认领时的会话 {} 不一致，删除后重试",
                    target, stat.ephemeral_owner, session_token
                );
                if let Some(owner) = stat.ephemeral_owner {
                    self.delete_guarded(&owner_path, stat.version, owner).await?;
                }
                Ok(ClaimOutcome::Suspended)
            }
            Ok(stat) if !current => {
                drop(e);
                warn!("目标 {} 的认领已被取消，删除刚创建的owner节点", target);
                self.delete_guarded(&owner_path, stat.version, session_token)
                    .await?;
                Ok(ClaimOutcome::Cancelled)
            }
            Ok(stat) => {
                let record = OwnershipRecord {
                    target: target.to_string(),
                    worker_alias: self.alias.clone(),
                    session_token,
                    version: stat.version,
                    claimed_at: Utc::now(),
                };
                e.state = ElectionState::Owned(record.clone());
                drop(e);
                self.on_acquired(&record);
                Ok(ClaimOutcome::Acquired(record))
            }
            // 节点不是本次创建的，已取消的认领不删除它
            Err(ClusterError::NodeExists { .. }) if !current => Ok(ClaimOutcome::Cancelled),
            Err(ClusterError::NodeExists { .. }) => {
                counter!("jmx_cluster_claim_conflicts_total").increment(1);
                if e.inflight > 0 {
                    // 之前被取消的认领还没返回，它创建的节点随后会被删除
                    e.state = ElectionState::Unclaimed;
                    return Ok(ClaimOutcome::InProgress);
                }
                match self.read_owner(&owner_path).await {
                    // 本会话之前创建的owner节点仍然有效（例如释放时连接中断），直接接管
                    Ok(Some((owner, stat)))
                        if owner.worker_alias == self.alias
                            && stat.ephemeral_owner.is_some()
                            && stat.ephemeral_owner == self.client.session_id() =>
                    {
                        let session = stat.ephemeral_owner.unwrap_or(session_token);
                        let version = if owner.session_token == session {
                            stat.version
                        } else {
                            // 节点内容里的会话号过期，改写为当前会话
                            let payload = OwnerPayload {
                                worker_alias: self.alias.clone(),
                                session_token: session,
                            }
                            .to_payload()?;
                            match self
                                .client
                                .write_node(&owner_path, payload, Some(stat.version))
                                .await
                            {
                                Ok(updated) => updated.version,
                                Err(err) => {
                                    e.state = ElectionState::Unclaimed;
                                    return match err {
                                        ClusterError::VersionConflict { .. }
                                        | ClusterError::NodeNotFound { .. } => {
                                            Ok(ClaimOutcome::InProgress)
                                        }
                                        err if err.is_session_error() => {
                                            Ok(ClaimOutcome::Suspended)
                                        }
                                        err => Err(err),
                                    };
                                }
                            }
                        };
                        let record = OwnershipRecord {
                            target: target.to_string(),
                            worker_alias: self.alias.clone(),
                            session_token: session,
                            version,
                            claimed_at: Utc::now(),
                        };
                        e.state = ElectionState::Owned(record.clone());
                        e.pending_release = None;
                        drop(e);
                        info!("Worker {} 接管本会话已有的owner节点 {}", self.alias, target);
                        self.on_acquired(&record);
                        Ok(ClaimOutcome::Acquired(record))
                    }
                    other => {
                        e.state = ElectionState::Unclaimed;
                        let owner = match other {
                            Ok(Some((owner, _))) => Some(owner.worker_alias),
                            _ => None,
                        };
                        debug!("目标 {} 已被 {:?} 认领", target, owner);
                        Ok(ClaimOutcome::OwnedByOther(owner))
                    }
                }
            }
            Err(err) => {
                if current {
                    e.state = ElectionState::Unclaimed;
                }
                match err {
                    ClusterError::NodeNotFound { .. } => Err(ClusterError::TargetNotFound {
                        alias: target.to_string(),
                    }),
                    err if err.is_session_error() => Ok(ClaimOutcome::Suspended),
                    err => Err(err),
                }
            }
        }
    }

    fn on_acquired(&self, record: &OwnershipRecord) {
        counter!("jmx_cluster_claims_acquired_total").increment(1);
        self.owned_gauge(1.0);
        info!(
            "Worker {} 获得监控目标 {} 的所有权 (会话 {})",
            self.alias, record.target, record.session_token
        );
        self.emit(OwnershipEvent::Acquired(record.clone()));
    }

    async fn read_owner(&self, owner_path: &str) -> ClusterResult<Option<(OwnerPayload, NodeStat)>> {
        match self.client.read_node(owner_path).await {
            Ok((payload, stat)) => Ok(Some((OwnerPayload::from_payload(&payload)?, stat))),
            Err(ClusterError::NodeNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 只删除本会话创建的owner节点。节点已不存在或已属于其他会话都视为已释放。
    async fn delete_guarded(
        &self,
        owner_path: &str,
        version: NodeVersion,
        session_token: SessionId,
    ) -> ClusterResult<()> {
        let Some(stat) = self.client.exists(owner_path).await? else {
            return Ok(());
        };
        if stat.ephemeral_owner != Some(session_token) {
            debug!("owner节点 {} 已属于其他会话，跳过删除", owner_path);
            return Ok(());
        }
        match self.client.delete_node(owner_path, Some(version)).await {
            Ok(())
            | Err(ClusterError::NodeNotFound { .. })
            | Err(ClusterError::VersionConflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 释放监控目标。重复释放或释放未持有的目标是无操作，返回false。
    pub async fn release(&self, target: &str, reason: ReleaseReason) -> ClusterResult<bool> {
        let owner_path = self.paths.owner_path(target)?;
        let Some(entry) = self.existing_entry(target).await else {
            return Ok(false);
        };
        let mut e = entry.lock().await;
        let next = if reason == ReleaseReason::Shutdown {
            ElectionState::Released
        } else {
            ElectionState::Unclaimed
        };
        let cooldown = reason
            .applies_cooldown()
            .then(|| Instant::now() + self.release_cooldown);

        match std::mem::replace(&mut e.state, ElectionState::Releasing) {
            ElectionState::Owned(record) => {
                e.cooldown_until = cooldown;
                let result = self
                    .delete_guarded(&owner_path, record.version, record.session_token)
                    .await;
                e.state = next;
                match result {
                    Ok(()) => {}
                    Err(err) if err.is_session_error() => {
                        warn!("释放目标 {} 时会话不可用，重连后再删除owner节点", target);
                        e.pending_release = Some(record);
                    }
                    Err(err) => {
                        warn!("删除目标 {} 的owner节点失败: {}", target, err);
                        e.pending_release = Some(record);
                    }
                }
                drop(e);

                counter!("jmx_cluster_releases_total", "reason" => reason.as_str()).increment(1);
                self.owned_gauge(-1.0);
                info!(
                    "Worker {} 释放监控目标 {} ({})",
                    self.alias,
                    target,
                    reason.as_str()
                );
                self.emit(OwnershipEvent::Released {
                    target: target.to_string(),
                    reason,
                });
                Ok(true)
            }
            ElectionState::Claiming => {
                e.generation += 1;
                e.cooldown_until = cooldown;
                e.state = next;
                info!("取消目标 {} 正在进行的认领", target);
                Ok(false)
            }
            ElectionState::Unclaimed | ElectionState::Releasing => {
                e.state = next;
                Ok(false)
            }
            ElectionState::Released => {
                e.state = ElectionState::Released;
                Ok(false)
            }
        }
    }

    /// 会话过期：所有owner节点已被服务端删除，全部所有权隐式丢失
    pub async fn handle_session_expired(&self) -> Vec<String> {
        let mut lost = Vec::new();
        for (target, entry) in self.entries().await {
            let mut e = entry.lock().await;
            e.pending_release = None;
            match std::mem::replace(&mut e.state, ElectionState::Unclaimed) {
                ElectionState::Owned(_) => lost.push(target),
                ElectionState::Claiming => e.generation += 1,
                other => e.state = other,
            }
        }

        for target in &lost {
            self.on_lost(target, LossReason::SessionExpired);
        }
        lost
    }

    fn on_lost(&self, target: &str, reason: LossReason) {
        counter!("jmx_cluster_ownership_lost_total").increment(1);
        self.owned_gauge(-1.0);
        warn!(
            "Worker {} 失去监控目标 {} 的所有权 ({:?})",
            self.alias, target, reason
        );
        self.emit(OwnershipEvent::Lost {
            target: target.to_string(),
            reason,
        });
    }

    /// 核对单个目标的owner节点仍然属于本会话，不属于时转为未认领并返回false
    pub async fn verify(&self, target: &str) -> ClusterResult<bool> {
        let owner_path = self.paths.owner_path(target)?;
        let Some(entry) = self.existing_entry(target).await else {
            return Ok(false);
        };
        let mut e = entry.lock().await;

        if let Some(pending) = e.pending_release.clone() {
            match self
                .delete_guarded(&owner_path, pending.version, pending.session_token)
                .await
            {
                Ok(()) => {
                    debug!("补删目标 {} 的owner节点", target);
                    e.pending_release = None;
                }
                Err(err) => debug!("补删目标 {} 的owner节点失败: {}", target, err),
            }
        }

        let Some(record) = e.owned().cloned() else {
            return Ok(false);
        };
        let reason = match self.client.exists(&owner_path).await? {
            Some(stat) if stat.ephemeral_owner == Some(record.session_token) => return Ok(true),
            Some(_) => LossReason::OwnerNodeReplaced,
            None => LossReason::OwnerNodeMissing,
        };
        e.state = ElectionState::Unclaimed;
        drop(e);
        self.on_lost(target, reason);
        Ok(false)
    }

    /// 重连后核对全部已持有目标，返回已丢失的目标
    pub async fn revalidate(&self) -> ClusterResult<Vec<String>> {
        let mut lost = Vec::new();
        let targets: Vec<String> = self.entries().await.into_iter().map(|(t, _)| t).collect();
        for target in targets {
            let owned_before = self.owns(&target).await;
            if !self.verify(&target).await? && owned_before {
                lost.push(target);
            }
        }
        Ok(lost)
    }

    /// 目标已被删除：丢弃本地状态
    pub async fn forget(&self, target: &str) -> bool {
        let Some(entry) = self.targets.write().await.remove(target) else {
            return false;
        };
        let mut e = entry.lock().await;
        e.generation += 1;
        let was_owned = matches!(e.state, ElectionState::Owned(_));
        e.state = ElectionState::Unclaimed;
        drop(e);

        if was_owned {
            self.owned_gauge(-1.0);
            info!("监控目标 {} 已删除，放弃所有权", target);
            self.emit(OwnershipEvent::Released {
                target: target.to_string(),
                reason: ReleaseReason::TargetRemoved,
            });
        }
        was_owned
    }

    pub async fn state(&self, target: &str) -> Option<ElectionState> {
        let entry = self.existing_entry(target).await?;
        let state = entry.lock().await.state.clone();
        Some(state)
    }

    pub async fn owns(&self, target: &str) -> bool {
        matches!(self.state(target).await, Some(ElectionState::Owned(_)))
    }

    pub async fn record(&self, target: &str) -> Option<OwnershipRecord> {
        match self.state(target).await? {
            ElectionState::Owned(record) => Some(record),
            _ => None,
        }
    }

    pub async fn owned_targets(&self) -> Vec<String> {
        let mut owned = Vec::new();
        for (target, entry) in self.entries().await {
            if entry.lock().await.owned().is_some() {
                owned.push(target);
            }
        }
        owned.sort();
        owned
    }

    /// 停止认领并并发释放全部已持有目标，返回释放的数量
    pub async fn shutdown(&self) -> usize {
        self.stopped.store(true, Ordering::SeqCst);
        let targets: Vec<String> = self.entries().await.into_iter().map(|(t, _)| t).collect();
        let results = join_all(
            targets
                .iter()
                .map(|target| self.release(target, ReleaseReason::Shutdown)),
        )
        .await;

        let mut released = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!("停止时释放目标 {} 失败: {}", target, e),
            }
        }
        info!("Worker {} 停止认领，释放了 {} 个监控目标", self.alias, released);
        released
    }
}
