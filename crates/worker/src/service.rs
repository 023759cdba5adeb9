use std::sync::Arc;
use std::time::Duration;

use jmx_cluster_core::{
    ClusterConfig, ClusterError, ClusterResult, CoordinationClient, PathScheme, RetryPolicy,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::components::cluster_watcher::WatcherComponents;
use crate::components::{
    AffinityResolver, ClusterWatcher, ConfigDistributor, OwnershipElector, RequestChannel,
    WorkerRegistrar,
};
use crate::health::HealthReporter;
use crate::polling_engine::{LoggingPollingEngine, PollingEngine};

/// Worker构建器
pub struct ClusterWorkerBuilder {
    alias: String,
    affinity: Option<String>,
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    retry: RetryPolicy,
    connect_retry: u32,
    release_cooldown: Duration,
    resync_interval: Duration,
    engine: Option<Arc<dyn PollingEngine>>,
}

impl ClusterWorkerBuilder {
    pub fn new(alias: String, client: Arc<dyn CoordinationClient>, paths: PathScheme) -> Self {
        Self {
            alias,
            affinity: None,
            client,
            paths,
            retry: RetryPolicy::default(),
            connect_retry: 3,
            release_cooldown: Duration::from_secs(10),
            resync_interval: Duration::from_secs(30),
            engine: None,
        }
    }

    /// 按集群配置创建构建器
    pub fn from_config(
        config: &ClusterConfig,
        client: Arc<dyn CoordinationClient>,
    ) -> ClusterResult<Self> {
        Ok(Self::new(config.worker.alias.clone(), client, config.zookeeper.path_scheme()?)
            .affinity(config.worker.affinity.clone())
            .retry_policy(config.retry.clone())
            .connect_retry(config.zookeeper.connect_retry)
            .release_cooldown(Duration::from_secs(config.worker.release_cooldown_seconds))
            .resync_interval(Duration::from_secs(config.worker.resync_interval_seconds)))
    }

    pub fn alias(mut self, alias: String) -> Self {
        self.alias = alias;
        self
    }

    /// 设置亲和组标签
    pub fn affinity(mut self, affinity: Option<String>) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 连续失败多少次后上报不健康
    pub fn connect_retry(mut self, connect_retry: u32) -> Self {
        self.connect_retry = connect_retry;
        self
    }

    pub fn release_cooldown(mut self, release_cooldown: Duration) -> Self {
        self.release_cooldown = release_cooldown;
        self
    }

    pub fn resync_interval(mut self, resync_interval: Duration) -> Self {
        self.resync_interval = resync_interval;
        self
    }

    /// 设置轮询引擎，默认只记录日志
    pub fn engine(mut self, engine: Arc<dyn PollingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> ClusterResult<ClusterWorker> {
        if self.resync_interval.is_zero() {
            return Err(ClusterError::config_error("重新同步间隔必须大于0"));
        }
        let health = HealthReporter::new(self.alias.clone());
        let registrar = Arc::new(WorkerRegistrar::new(
            self.alias.clone(),
            self.affinity.clone(),
            Arc::clone(&self.client),
            self.paths.clone(),
            self.retry,
            self.connect_retry,
            health.clone(),
        )?);
        let resolver = Arc::new(AffinityResolver::new(
            Arc::clone(&self.client),
            self.paths.clone(),
            Arc::clone(&registrar),
        ));
        let elector = Arc::new(OwnershipElector::new(
            self.alias.clone(),
            self.affinity.clone(),
            Arc::clone(&self.client),
            self.paths.clone(),
            Arc::clone(&resolver),
            self.release_cooldown,
        ));
        let configs = Arc::new(ConfigDistributor::new(
            Arc::clone(&self.client),
            self.paths.clone(),
        ));
        let requests = Arc::new(RequestChannel::new(
            Arc::clone(&self.client),
            self.paths.clone(),
        ));
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(LoggingPollingEngine::new(self.alias.clone())));

        let watcher = Arc::new(ClusterWatcher::new(
            Arc::clone(&self.client),
            self.paths.clone(),
            WatcherComponents {
                registrar: Arc::clone(&registrar),
                resolver: Arc::clone(&resolver),
                elector: Arc::clone(&elector),
                configs: Arc::clone(&configs),
                requests: Arc::clone(&requests),
            },
            engine,
            health.clone(),
            self.resync_interval,
        ));

        Ok(ClusterWorker {
            alias: self.alias,
            client: self.client,
            registrar,
            resolver,
            elector,
            configs,
            requests,
            watcher,
            health,
            shutdown_tx: RwLock::new(None),
            handle: Mutex::new(None),
        })
    }
}

/// 集群中的一个Worker
pub struct ClusterWorker {
    alias: String,
    client: Arc<dyn CoordinationClient>,
    registrar: Arc<WorkerRegistrar>,
    resolver: Arc<AffinityResolver>,
    elector: Arc<OwnershipElector>,
    configs: Arc<ConfigDistributor>,
    requests: Arc<RequestChannel>,
    watcher: Arc<ClusterWatcher>,
    health: HealthReporter,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<ClusterResult<()>>>>,
}

impl ClusterWorker {
    pub fn builder(
        alias: String,
        client: Arc<dyn CoordinationClient>,
        paths: PathScheme,
    ) -> ClusterWorkerBuilder {
        ClusterWorkerBuilder::new(alias, client, paths)
    }

    /// 在后台启动集群监听
    pub async fn start(&self) -> ClusterResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(ClusterError::Internal(format!(
                "Worker {} 已在运行",
                self.alias
            )));
        }

        info!("启动Worker: {}", self.alias);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let watcher = Arc::clone(&self.watcher);
        *handle = Some(tokio::spawn(watcher.run(shutdown_rx)));
        Ok(())
    }

    /// 发送停止信号并等待退出：释放全部目标、注销并关闭会话
    pub async fn stop(&self) -> ClusterResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.read().await.as_ref() {
            let _ = shutdown_tx.send(());
        }
        self.join().await
    }

    /// 等待后台任务退出，返回它的结果
    pub async fn join(&self) -> ClusterResult<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => {
                info!("Worker {} 已退出", self.alias);
                result
            }
            Err(e) => {
                error!("Worker {} 的后台任务异常退出: {}", self.alias, e);
                Err(ClusterError::Internal(e.to_string()))
            }
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    pub fn registrar(&self) -> &Arc<WorkerRegistrar> {
        &self.registrar
    }

    pub fn resolver(&self) -> &Arc<AffinityResolver> {
        &self.resolver
    }

    pub fn elector(&self) -> &Arc<OwnershipElector> {
        &self.elector
    }

    pub fn configs(&self) -> &Arc<ConfigDistributor> {
        &self.configs
    }

    pub fn requests(&self) -> &Arc<RequestChannel> {
        &self.requests
    }

    pub async fn owned_targets(&self) -> Vec<String> {
        self.elector.owned_targets().await
    }
}
