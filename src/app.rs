use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use jmx_cluster_core::{ClusterConfig, ClusterError, CoordinationClient, TargetConfig};
use jmx_cluster_infrastructure::InMemoryCoordinationService;
use jmx_cluster_worker::{ClusterAdmin, ClusterWorker, ClusterWorkerBuilder, HealthReporter};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::health::{self, HealthState};

/// 主应用程序：进程内协调服务 + 配置中的全部Worker
pub struct Application {
    config: ClusterConfig,
    service: InMemoryCoordinationService,
    admin: ClusterAdmin,
    workers: Vec<ClusterWorker>,
    metrics: Option<PrometheusHandle>,
}

impl Application {
    pub fn new(config: ClusterConfig, metrics: Option<PrometheusHandle>) -> Result<Self> {
        info!(
            "初始化应用程序，Worker: {}，嵌入Worker数: {}",
            config.worker.alias,
            config.embedded_workers.len()
        );

        let service = InMemoryCoordinationService::new();
        let paths = config.zookeeper.path_scheme()?;
        let admin_client: Arc<dyn CoordinationClient> = service.connect();
        let admin = ClusterAdmin::new(admin_client, paths, "jmx-cluster");

        let mut workers = vec![Self::build_worker(&config, &service)?];
        for embedded in &config.embedded_workers {
            let client: Arc<dyn CoordinationClient> = service.connect();
            let worker = ClusterWorkerBuilder::from_config(&config, client)?
                .alias(embedded.alias.clone())
                .affinity(embedded.affinity.clone())
                .build()
                .with_context(|| format!("创建嵌入Worker失败: {}", embedded.alias))?;
            workers.push(worker);
        }

        Ok(Self {
            config,
            service,
            admin,
            workers,
            metrics,
        })
    }

    fn build_worker(
        config: &ClusterConfig,
        service: &InMemoryCoordinationService,
    ) -> Result<ClusterWorker> {
        let client: Arc<dyn CoordinationClient> = service.connect();
        ClusterWorkerBuilder::from_config(config, client)?
            .build()
            .with_context(|| format!("创建Worker失败: {}", config.worker.alias))
    }

    pub fn workers(&self) -> &[ClusterWorker] {
        &self.workers
    }

    pub fn admin(&self) -> &ClusterAdmin {
        &self.admin
    }

    pub fn health_reporters(&self) -> Vec<HealthReporter> {
        self.workers.iter().map(|w| w.health().clone()).collect()
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.seed_targets().await?;

        for worker in &self.workers {
            worker
                .start()
                .await
                .with_context(|| format!("启动Worker失败: {}", worker.alias()))?;
        }

        let health_handle = if self.config.observability.health_enabled {
            let state = HealthState::new(self.health_reporters(), self.metrics.clone());
            let bind_address = self.config.observability.health_bind_address.clone();
            let health_rx = shutdown_rx.resubscribe();
            Some(tokio::spawn(async move {
                health::serve(&bind_address, state, health_rx).await
            }))
        } else {
            None
        };

        info!("应用已启动，共 {} 个Worker", self.workers.len());
        let _ = shutdown_rx.recv().await;

        self.stop_workers().await;

        if let Some(handle) = health_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("健康检查服务异常: {e:#}"),
                Err(e) => error!("健康检查任务异常退出: {e}"),
            }
        }

        info!("协调服务剩余节点数: {}", self.service.paths().len());
        Ok(())
    }

    /// 注册配置文件中的监控目标
    async fn seed_targets(&self) -> Result<()> {
        for target in &self.config.targets {
            self.seed_target(target).await?;
        }
        Ok(())
    }

    async fn seed_target(&self, target: &TargetConfig) -> Result<()> {
        let blob = serde_json::to_vec(&target.config)
            .with_context(|| format!("序列化监控目标配置失败: {}", target.alias))?;
        match self
            .admin
            .register_target(&target.alias, target.affinity.as_deref(), blob)
            .await
        {
            Ok(()) => Ok(()),
            Err(ClusterError::NodeExists { .. }) => {
                warn!("监控目标 {} 已存在，跳过", target.alias);
                Ok(())
            }
            Err(e) => {
                Err(anyhow::Error::new(e).context(format!("注册监控目标失败: {}", target.alias)))
            }
        }
    }

    /// 并发停止全部Worker：释放目标、注销并关闭会话
    async fn stop_workers(&self) {
        info!("停止全部Worker");
        let results = join_all(self.workers.iter().map(|worker| worker.stop())).await;
        for (worker, result) in self.workers.iter().zip(results) {
            if let Err(e) = result {
                error!("Worker {} 停止时出错: {}", worker.alias(), e);
            }
        }
    }
}
