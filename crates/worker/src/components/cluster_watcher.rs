use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jmx_cluster_core::{
    ClusterError, ClusterResult, Command, ConfigBlob, CoordinationClient, CoordinationClientExt,
    PathKind, PathScheme, RequestMessage, SessionEvent, SessionId, WatchEvent, WatchEventKind,
    WatchId, WatchSender,
};
use metrics::{counter, gauge};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{
    AffinityResolver, ClaimOutcome, ConfigDistributor, MembershipEvent, OwnershipElector,
    OwnershipEvent, ReleaseReason, RequestChannel, WorkerRegistrar,
};
use crate::health::HealthReporter;
use crate::polling_engine::PollingEngine;

/// 集群监听需要的组件
pub struct WatcherComponents {
    pub registrar: Arc<WorkerRegistrar>,
    pub resolver: Arc<AffinityResolver>,
    pub elector: Arc<OwnershipElector>,
    pub configs: Arc<ConfigDistributor>,
    pub requests: Arc<RequestChannel>,
}

/// 事件循环的本地状态，只由 `run` 所在的任务访问
struct WatchState {
    sink: WatchSender,
    base_watches: Vec<WatchId>,
    targets: HashMap<String, Vec<WatchId>>,
    /// 轮询引擎正在运行的目标
    running: HashSet<String>,
    /// 当前注册和订阅所基于的会话
    active_session: Option<SessionId>,
    /// 会话从可用变为中断或过期的时间
    lost_since: Option<Instant>,
}

impl WatchState {
    fn new(sink: WatchSender) -> Self {
        Self {
            sink,
            base_watches: Vec::new(),
            targets: HashMap::new(),
            running: HashSet::new(),
            active_session: None,
            lost_since: None,
        }
    }

    fn take_watch_ids(&mut self) -> Vec<WatchId> {
        let mut ids: Vec<WatchId> = self.base_watches.drain(..).collect();
        for (_, target_ids) in self.targets.drain() {
            ids.extend(target_ids);
        }
        ids
    }
}

/// 唤醒事件循环的原因
enum Wakeup {
    Session(Result<SessionEvent, RecvError>),
    Ownership(Result<OwnershipEvent, RecvError>),
    Watch(WatchEvent),
    Resync,
}

/// 集群监听
///
/// 单一事件循环处理会话事件、节点变更通知、所有权变化和定期重新同步，
/// 驱动注册、认领、配置分发和请求处理。
pub struct ClusterWatcher {
    alias: String,
    affinity: Option<String>,
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    registrar: Arc<WorkerRegistrar>,
    resolver: Arc<AffinityResolver>,
    elector: Arc<OwnershipElector>,
    configs: Arc<ConfigDistributor>,
    requests: Arc<RequestChannel>,
    engine: Arc<dyn PollingEngine>,
    health: HealthReporter,
    resync_interval: Duration,
}

impl ClusterWatcher {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        paths: PathScheme,
        components: WatcherComponents,
        engine: Arc<dyn PollingEngine>,
        health: HealthReporter,
        resync_interval: Duration,
    ) -> Self {
        Self {
            alias: components.registrar.alias().to_string(),
            affinity: components.registrar.affinity().map(str::to_string),
            client,
            paths,
            registrar: components.registrar,
            resolver: components.resolver,
            elector: components.elector,
            configs: components.configs,
            requests: components.requests,
            engine,
            health,
            resync_interval,
        }
    }

    /// 运行事件循环直到收到关闭信号。只有致命错误（例如别名重复）会返回Err。
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> ClusterResult<()> {
        info!("Worker {} 开始监听集群变化", self.alias);
        let mut session_events = self.client.session_events();
        let mut ownership_events = self.elector.subscribe();
        let (sink, mut watch_events) = mpsc::unbounded_channel();
        let mut state = WatchState::new(sink);

        let established = tokio::select! {
            result = self.establish_session(&mut state) => Some(result),
            _ = shutdown_rx.recv() => None,
        };
        match established {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("Worker {} 无法加入集群: {}", self.alias, e);
                return Err(e);
            }
            None => {
                info!("Worker {} 在加入集群前收到关闭信号", self.alias);
                self.shutdown(&mut state).await;
                return Ok(());
            }
        }

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;

        let mut fatal = None;
        loop {
            let wakeup = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker {} 收到关闭信号", self.alias);
                    break;
                }
                event = session_events.recv() => Wakeup::Session(event),
                event = ownership_events.recv() => Wakeup::Ownership(event),
                Some(event) = watch_events.recv() => Wakeup::Watch(event),
                _ = resync.tick() => Wakeup::Resync,
            };

            // 注册可能一直重试下去，关闭信号要能打断正在处理的事件
            let result = tokio::select! {
                result = self.dispatch(wakeup, &mut state) => result,
                _ = shutdown_rx.recv() => {
                    info!("Worker {} 在处理事件时收到关闭信号", self.alias);
                    break;
                }
            };

            match result {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("Worker {} 遇到致命错误，停止监听: {}", self.alias, e);
                    fatal = Some(e);
                    break;
                }
            }
        }

        self.shutdown(&mut state).await;
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 处理一次唤醒，事件通道关闭时返回false
    async fn dispatch(&self, wakeup: Wakeup, state: &mut WatchState) -> ClusterResult<bool> {
        match wakeup {
            Wakeup::Session(Ok(event)) => self.handle_session_event(event, state).await?,
            Wakeup::Session(Err(RecvError::Lagged(skipped))) => {
                warn!("跳过了 {} 个会话事件，按当前会话状态同步", skipped);
                self.sync_session(state).await?;
            }
            Wakeup::Session(Err(RecvError::Closed)) => {
                warn!("会话事件通道已关闭");
                return Ok(false);
            }
            Wakeup::Ownership(Ok(event)) => self.handle_ownership_event(event, state).await,
            Wakeup::Ownership(Err(RecvError::Lagged(skipped))) => {
                warn!("跳过了 {} 个所有权事件，重新同步轮询引擎", skipped);
                self.sync_engine(state).await;
            }
            Wakeup::Ownership(Err(RecvError::Closed)) => return Ok(false),
            Wakeup::Watch(event) => self.handle_watch_event(event, state).await?,
            Wakeup::Resync => self.resync(state).await?,
        }
        Ok(true)
    }

    async fn handle_session_event(
        &self,
        event: SessionEvent,
        state: &mut WatchState,
    ) -> ClusterResult<()> {
        debug!("Worker {} 收到会话事件 {:?}", self.alias, event);
        match event {
            SessionEvent::Disconnected => {
                self.on_disconnected(state);
                Ok(())
            }
            SessionEvent::Expired => {
                if self.client.session_state().is_connected()
                    && self.client.session_id() == state.active_session
                {
                    debug!("忽略旧会话的过期事件");
                    return Ok(());
                }
                self.on_expired(state).await;
                Ok(())
            }
            SessionEvent::Connected { session_id } => {
                if state.active_session == Some(session_id) {
                    self.recover_session(state).await;
                    Ok(())
                } else {
                    self.establish_session(state).await
                }
            }
        }
    }

    /// 按客户端当前的会话状态对齐本地状态
    async fn sync_session(&self, state: &mut WatchState) -> ClusterResult<()> {
        let connected = self.client.session_state().is_connected();
        match self.client.session_id() {
            Some(id) if connected && state.active_session == Some(id) => {
                if self.elector.is_suspended() {
                    self.recover_session(state).await;
                }
            }
            Some(_) if connected => self.establish_session(state).await?,
            Some(id) if state.active_session == Some(id) => self.on_disconnected(state),
            _ => {
                if state.active_session.is_some() {
                    self.on_expired(state).await;
                }
            }
        }
        self.check_outage(state);
        Ok(())
    }

    /// 会话中断时间超过重试预算后上报不健康
    fn check_outage(&self, state: &WatchState) {
        let Some(since) = state.lost_since else {
            return;
        };
        let budget = self.registrar.outage_budget();
        let elapsed = since.elapsed();
        if elapsed >= budget && self.health.status().is_serving() {
            counter!("jmx_cluster_outage_escalations_total").increment(1);
            self.health.set_unhealthy(format!(
                "协调服务已 {}ms 不可用，超过重试预算 {}ms",
                elapsed.as_millis(),
                budget.as_millis()
            ));
        }
    }

    /// 记录会话丢失，已上报不健康时不再降回降级
    fn mark_lost(&self, state: &mut WatchState, reason: &str) {
        if state.lost_since.is_none() {
            state.lost_since = Some(Instant::now());
        }
        if self.health.status().is_serving() {
            self.health.set_degraded(reason);
        }
    }

    fn on_disconnected(&self, state: &mut WatchState) {
        self.elector.suspend();
        gauge!("jmx_cluster_session_connected", "worker" => self.alias.clone()).set(0.0);
        self.mark_lost(state, "协调服务连接中断");
    }

    /// 会话过期：临时节点和订阅都已失效，所有权隐式丢失
    async fn on_expired(&self, state: &mut WatchState) {
        self.elector.suspend();
        let lost = self.elector.handle_session_expired().await;
        if !lost.is_empty() {
            warn!(
                "Worker {} 的会话已过期，失去 {} 个监控目标",
                self.alias,
                lost.len()
            );
        }
        self.registrar.mark_unregistered().await;
        self.forget_watches(state).await;
        state.active_session = None;
        counter!("jmx_cluster_session_expirations_total").increment(1);
        gauge!("jmx_cluster_session_connected", "worker" => self.alias.clone()).set(0.0);
        self.mark_lost(state, "会话已过期，等待建立新会话");
    }

    /// 连接恢复且会话未变：核对已持有的目标后恢复认领
    async fn recover_session(&self, state: &mut WatchState) {
        match self.elector.revalidate().await {
            Ok(lost) if !lost.is_empty() => {
                warn!("连接恢复后发现 {} 个目标已不属于本Worker", lost.len())
            }
            Ok(_) => {}
            Err(e) => warn!("核对所有权失败: {}", e),
        }
        self.elector.resume();
        gauge!("jmx_cluster_session_connected", "worker" => self.alias.clone()).set(1.0);
        state.lost_since = None;
        self.health.set_healthy();
        if state.base_watches.is_empty() {
            self.install_base_watches(state).await;
        }
        self.refresh_members().await;
        self.reconcile_all(state).await;
    }

    /// 在新会话上注册、订阅并重新认领
    async fn establish_session(&self, state: &mut WatchState) -> ClusterResult<()> {
        self.elector.suspend();
        // 旧会话的owner节点已被删除
        self.elector.handle_session_expired().await;
        self.forget_watches(state).await;

        if let Err(e) = self.registrar.register().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Worker {} 注册失败，等待下次同步: {}", self.alias, e);
            return Ok(());
        }
        state.active_session = self.client.session_id();
        info!(
            "Worker {} 在会话 {:?} 上加入集群",
            self.alias, state.active_session
        );

        if let Err(e) = self.client.ensure_path(self.paths.config_root()).await {
            warn!("创建配置根路径失败: {}", e);
        }
        self.install_base_watches(state).await;
        self.elector.resume();
        gauge!("jmx_cluster_session_connected", "worker" => self.alias.clone()).set(1.0);
        state.lost_since = None;
        self.health.set_healthy();

        self.refresh_members().await;
        self.reconcile_all(state).await;
        Ok(())
    }

    async fn install_base_watches(&self, state: &mut WatchState) {
        for root in [self.paths.heartbeat_root(), self.paths.config_root()] {
            match self.client.watch_children(root, state.sink.clone()).await {
                Ok(id) => state.base_watches.push(id),
                Err(e) => warn!("订阅 {} 失败，等待下次同步: {}", root, e),
            }
        }
    }

    async fn forget_watches(&self, state: &mut WatchState) {
        for id in state.take_watch_ids() {
            if let Err(e) = self.client.unwatch(id).await {
                debug!("取消订阅 {} 失败: {}", id, e);
            }
        }
    }

    async fn handle_watch_event(
        &self,
        event: WatchEvent,
        state: &mut WatchState,
    ) -> ClusterResult<()> {
        if state.active_session.is_none() || self.elector.is_suspended() {
            debug!("会话不可用，暂不处理变更通知 {}", event.path);
            return Ok(());
        }
        match self.paths.classify(&event.path) {
            Some(PathKind::HeartbeatRoot) => return self.on_membership_change(state).await,
            Some(PathKind::ConfigRoot) => {
                for target in self.sync_targets(state).await {
                    self.reconcile_target(&target, state).await;
                }
            }
            Some(PathKind::Owner(target)) | Some(PathKind::Affinity(target)) => {
                self.reconcile_target(&target, state).await
            }
            Some(PathKind::Config(target)) => {
                if self.elector.owns(&target).await {
                    self.apply_config_update(&target, state).await;
                } else {
                    self.reconcile_target(&target, state).await;
                }
            }
            Some(PathKind::Request(target)) => self.process_requests(&target, state).await,
            Some(PathKind::Target(_)) | Some(PathKind::Worker(_)) | None => {
                debug!("忽略变更通知 {:?}", event)
            }
        }
        Ok(())
    }

    async fn on_membership_change(&self, state: &mut WatchState) -> ClusterResult<()> {
        let changes = self.refresh_members().await;
        let self_lost = changes
            .iter()
            .any(|c| matches!(c, MembershipEvent::WorkerLost(alias) if *alias == self.alias));
        if self_lost && self.client.session_state().is_connected() {
            warn!("Worker {} 的心跳节点已被删除，重新注册", self.alias);
            self.registrar.mark_unregistered().await;
            match self.registrar.register().await {
                Ok(_) => {
                    self.refresh_members().await;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("重新注册失败: {}", e),
            }
        }
        if changes
            .iter()
            .any(|c| matches!(c, MembershipEvent::WorkerLost(_)))
        {
            self.reconcile_all(state).await;
        }
        Ok(())
    }

    async fn refresh_members(&self) -> Vec<MembershipEvent> {
        match self.registrar.refresh_members().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!("刷新集群成员失败: {}", e);
                Vec::new()
            }
        }
    }

    /// 对齐目标列表，返回新发现的目标
    async fn sync_targets(&self, state: &mut WatchState) -> Vec<String> {
        let children = match self.client.list_children(self.paths.config_root()).await {
            Ok(children) => children,
            Err(ClusterError::NodeNotFound { .. }) => Vec::new(),
            Err(e) => {
                warn!("读取监控目标列表失败: {}", e);
                return Vec::new();
            }
        };
        let current: HashSet<String> = children.into_iter().collect();

        let removed: Vec<String> = state
            .targets
            .keys()
            .filter(|target| !current.contains(*target))
            .cloned()
            .collect();
        for target in removed {
            self.on_target_removed(&target, state).await;
        }

        let mut added = Vec::new();
        for target in current {
            if state.targets.contains_key(&target) {
                continue;
            }
            match self.watch_target(&target, state).await {
                Ok(()) => added.push(target),
                Err(e) => warn!("订阅目标 {} 失败: {}", target, e),
            }
        }
        added.sort();
        if !added.is_empty() {
            info!("发现 {} 个新的监控目标: {:?}", added.len(), added);
        }
        added
    }

    async fn watch_target(&self, target: &str, state: &mut WatchState) -> ClusterResult<()> {
        let paths = [
            self.paths.owner_path(target)?,
            self.paths.affinity_path(target)?,
            self.paths.config_path(target)?,
            self.paths.request_path(target)?,
        ];
        let mut ids = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.client.watch_node(path, state.sink.clone()).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        let _ = self.client.unwatch(id).await;
                    }
                    return Err(e);
                }
            }
        }
        state.targets.insert(target.to_string(), ids);
        Ok(())
    }

    async fn on_target_removed(&self, target: &str, state: &mut WatchState) {
        info!("监控目标 {} 已被删除", target);
        if let Some(ids) = state.targets.remove(target) {
            for id in ids {
                let _ = self.client.unwatch(id).await;
            }
        }
        self.elector.forget(target).await;
        self.configs.forget(target).await;
    }

    async fn reconcile_all(&self, state: &mut WatchState) {
        self.sync_targets(state).await;
        let mut targets: Vec<String> = state.targets.keys().cloned().collect();
        targets.sort();
        for target in targets {
            self.reconcile_target(&target, state).await;
        }
    }

    /// 重新评估单个目标：核对已持有的所有权，或在无主时尝试认领
    async fn reconcile_target(&self, target: &str, state: &mut WatchState) {
        if self.elector.is_suspended() {
            return;
        }
        if let Err(e) = self.try_reconcile(target, state).await {
            if e.is_session_error() {
                debug!("会话不可用，跳过目标 {}: {}", target, e);
            } else {
                warn!("处理目标 {} 失败: {}", target, e);
            }
        }
    }

    async fn try_reconcile(&self, target: &str, state: &mut WatchState) -> ClusterResult<()> {
        if self
            .client
            .exists(&self.paths.target_path(target)?)
            .await?
            .is_none()
        {
            if state.targets.contains_key(target) {
                self.on_target_removed(target, state).await;
            }
            return Ok(());
        }

        if self.elector.owns(target).await && self.elector.verify(target).await? {
            if !self
                .resolver
                .is_eligible(self.affinity.as_deref(), target)
                .await?
            {
                info!(
                    "目标 {} 的亲和性要求已变化，Worker {} 释放所有权",
                    target, self.alias
                );
                self.elector
                    .release(target, ReleaseReason::AffinityChanged)
                    .await?;
            }
            return Ok(());
        }

        // config节点写入后目标才可认领
        if self
            .client
            .exists(&self.paths.config_path(target)?)
            .await?
            .is_none()
        {
            debug!("目标 {} 尚未写入监控配置，暂不认领", target);
            return Ok(());
        }
        if let Some(stat) = self
            .client
            .exists(&self.paths.owner_path(target)?)
            .await?
        {
            if stat.ephemeral_owner != self.client.session_id() {
                return Ok(());
            }
        }

        match self.elector.claim(target).await? {
            ClaimOutcome::Acquired(_) => {}
            outcome => debug!("目标 {} 的认领结果: {:?}", target, outcome),
        }
        Ok(())
    }

    async fn handle_ownership_event(&self, event: OwnershipEvent, state: &mut WatchState) {
        match event {
            OwnershipEvent::Acquired(record) => {
                if !self.elector.owns(&record.target).await {
                    return;
                }
                self.start_polling(&record.target, state).await;
                self.process_requests(&record.target, state).await;
            }
            OwnershipEvent::Released { target, .. } | OwnershipEvent::Lost { target, .. } => {
                self.stop_polling(&target, state).await;
            }
        }
    }

    async fn start_polling(&self, target: &str, state: &mut WatchState) {
        if state.running.contains(target) {
            return;
        }
        self.configs.forget(target).await;
        match self.configs.check_for_update(target).await {
            Ok(Some(blob)) => self.run_engine(blob, state).await,
            Ok(None) => debug!("目标 {} 暂无监控配置", target),
            Err(e) => warn!("读取目标 {} 的监控配置失败: {}", target, e),
        }
    }

    async fn stop_polling(&self, target: &str, state: &mut WatchState) {
        self.configs.forget(target).await;
        if state.running.remove(target) {
            if let Err(e) = self.engine.stop(target).await {
                error!("停止目标 {} 的轮询失败: {}", target, e);
            }
        }
    }

    async fn run_engine(&self, blob: ConfigBlob, state: &mut WatchState) {
        let target = blob.target.clone();
        let result = if state.running.contains(&target) {
            self.engine.restart(&blob).await
        } else {
            self.engine.start(&blob).await
        };
        match result {
            Ok(()) => {
                state.running.insert(target);
            }
            Err(e) => {
                counter!("jmx_cluster_engine_failures_total").increment(1);
                error!("目标 {} 的轮询引擎启动失败: {}", target, e);
            }
        }
    }

    async fn apply_config_update(&self, target: &str, state: &mut WatchState) {
        match self.configs.check_for_update(target).await {
            Ok(Some(blob)) => self.run_engine(blob, state).await,
            Ok(None) => {}
            Err(e) => warn!("读取目标 {} 的监控配置失败: {}", target, e),
        }
    }

    /// 只有所有者处理请求，失去所有权后剩余请求留给下一个所有者
    async fn process_requests(&self, target: &str, state: &mut WatchState) {
        while self.elector.owns(target).await {
            match self.requests.poll(target).await {
                Ok(Some(message)) => self.handle_request(target, message, state).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("读取目标 {} 的请求失败: {}", target, e);
                    break;
                }
            }
        }
    }

    async fn handle_request(&self, target: &str, message: RequestMessage, state: &mut WatchState) {
        info!(
            "Worker {} 处理目标 {} 的请求 {:?} (来自 {})",
            self.alias, target, message.command, message.issued_by
        );
        match message.command {
            Command::Release => self.release_on_request(target, ReleaseReason::Requested, state).await,
            Command::ReloadConfig => match self.configs.read(target).await {
                Ok(blob) => {
                    self.configs.mark_applied(target, blob.version).await;
                    self.run_engine(blob, state).await;
                }
                Err(e) => warn!("重新加载目标 {} 的配置失败: {}", target, e),
            },
            Command::Reassign { to } => {
                if to == self.alias {
                    debug!("转交对象就是本Worker，忽略");
                    return;
                }
                let Some(member) = self.registrar.member(&to).await else {
                    warn!("转交对象 {} 不是存活的Worker，忽略请求", to);
                    return;
                };
                match self
                    .resolver
                    .is_eligible(member.affinity.as_deref(), target)
                    .await
                {
                    Ok(true) => {
                        self.release_on_request(target, ReleaseReason::Reassigned, state)
                            .await
                    }
                    Ok(false) => warn!("Worker {} 不满足目标 {} 的亲和性要求，忽略转交", to, target),
                    Err(e) => warn!("检查转交对象失败: {}", e),
                }
            }
        }
    }

    async fn release_on_request(&self, target: &str, reason: ReleaseReason, state: &mut WatchState) {
        match self.elector.release(target, reason).await {
            Ok(_) => self.schedule_reconcile(target, state),
            Err(e) => warn!("释放目标 {} 失败: {}", target, e),
        }
    }

    /// 冷却期结束后重新检查该目标
    fn schedule_reconcile(&self, target: &str, state: &WatchState) {
        let Ok(path) = self.paths.owner_path(target) else {
            return;
        };
        let delay = self.elector.release_cooldown() + Duration::from_millis(50);
        let sink = state.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(WatchEvent {
                path,
                kind: WatchEventKind::NodeDataChanged,
            });
        });
    }

    /// 按选举器的状态启停轮询引擎
    async fn sync_engine(&self, state: &mut WatchState) {
        let owned: HashSet<String> = self.elector.owned_targets().await.into_iter().collect();
        let running: Vec<String> = state.running.iter().cloned().collect();
        for target in running {
            if !owned.contains(&target) {
                self.stop_polling(&target, state).await;
            }
        }
        for target in owned {
            if !state.running.contains(&target) {
                self.start_polling(&target, state).await;
            }
        }
    }

    /// 定期全量同步，弥补可能丢失或合并的变更通知
    async fn resync(&self, state: &mut WatchState) -> ClusterResult<()> {
        self.sync_session(state).await?;
        if state.active_session.is_none() || self.elector.is_suspended() {
            return Ok(());
        }
        debug!("Worker {} 定期同步集群状态", self.alias);
        if state.base_watches.is_empty() {
            self.install_base_watches(state).await;
        }
        if !self.registrar.is_registered().await {
            match self.registrar.register().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("重新注册失败: {}", e),
            }
        }
        if let Err(e) = self.elector.revalidate().await {
            warn!("核对所有权失败: {}", e);
        }
        self.on_membership_change(state).await?;
        self.reconcile_all(state).await;
        self.sync_engine(state).await;
        let targets: Vec<String> = self.elector.owned_targets().await;
        for target in targets {
            self.apply_config_update(&target, state).await;
            self.process_requests(&target, state).await;
        }
        Ok(())
    }

    async fn shutdown(&self, state: &mut WatchState) {
        info!("Worker {} 正在停止", self.alias);
        let running: Vec<String> = state.running.drain().collect();
        for target in running {
            if let Err(e) = self.engine.stop(&target).await {
                error!("停止目标 {} 的轮询失败: {}", target, e);
            }
        }
        self.elector.shutdown().await;
        self.forget_watches(state).await;
        if let Err(e) = self.registrar.deregister().await {
            warn!("注销Worker {} 失败: {}", self.alias, e);
        }
        if let Err(e) = self.client.close().await {
            warn!("关闭协调服务会话失败: {}", e);
        }
        gauge!("jmx_cluster_session_connected", "worker" => self.alias.clone()).set(0.0);
        self.health.set_unhealthy("Worker已停止");
        info!("Worker {} 已停止", self.alias);
    }
}
