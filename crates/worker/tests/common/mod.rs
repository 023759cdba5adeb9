#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jmx_cluster_core::{ClusterResult, ConfigBlob, NodeVersion, PathScheme, RetryPolicy};
use jmx_cluster_infrastructure::{InMemoryClient, InMemoryCoordinationService};
use jmx_cluster_worker::{ClusterAdmin, ClusterWorker, PollingEngine};
use tokio::sync::Mutex;

pub const CONFIG_ROOT: &str = "/jmxtrans/jvms";
pub const HEARTBEAT_ROOT: &str = "/jmxtrans/workers";

/// 轮询条件直到成立，最多等待5秒
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let satisfied: bool = $cond;
            if satisfied {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

pub fn paths() -> PathScheme {
    PathScheme::new(CONFIG_ROOT, HEARTBEAT_ROOT).unwrap()
}

pub fn admin(service: &InMemoryCoordinationService) -> ClusterAdmin {
    ClusterAdmin::new(service.connect(), paths(), "test-admin")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Start { target: String, version: NodeVersion },
    Restart { target: String, version: NodeVersion },
    Stop { target: String },
}

impl EngineCall {
    fn target(&self) -> &str {
        match self {
            EngineCall::Start { target, .. }
            | EngineCall::Restart { target, .. }
            | EngineCall::Stop { target } => target,
        }
    }
}

/// 记录所有调用的轮询引擎
#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
}

impl RecordingEngine {
    pub async fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_for(&self, target: &str) -> Vec<EngineCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.target() == target)
            .cloned()
            .collect()
    }

    /// 最后一次调用不是停止
    pub async fn is_polling(&self, target: &str) -> bool {
        matches!(
            self.calls_for(target).await.last(),
            Some(EngineCall::Start { .. }) | Some(EngineCall::Restart { .. })
        )
    }

    pub async fn starts(&self, target: &str) -> usize {
        self.calls_for(target)
            .await
            .iter()
            .filter(|c| matches!(c, EngineCall::Start { .. }))
            .count()
    }
}

#[async_trait]
impl PollingEngine for RecordingEngine {
    async fn start(&self, blob: &ConfigBlob) -> ClusterResult<()> {
        self.calls.lock().await.push(EngineCall::Start {
            target: blob.target.clone(),
            version: blob.version,
        });
        Ok(())
    }

    async fn restart(&self, blob: &ConfigBlob) -> ClusterResult<()> {
        self.calls.lock().await.push(EngineCall::Restart {
            target: blob.target.clone(),
            version: blob.version,
        });
        Ok(())
    }

    async fn stop(&self, target: &str) -> ClusterResult<()> {
        self.calls.lock().await.push(EngineCall::Stop {
            target: target.to_string(),
        });
        Ok(())
    }
}

pub struct TestWorker {
    pub alias: String,
    pub worker: ClusterWorker,
    pub client: Arc<InMemoryClient>,
    pub engine: Arc<RecordingEngine>,
}

impl TestWorker {
    pub async fn owns(&self, target: &str) -> bool {
        self.worker.elector().owns(target).await
    }
}

pub async fn spawn_worker(
    service: &InMemoryCoordinationService,
    alias: &str,
    affinity: Option<&str>,
) -> TestWorker {
    spawn_worker_with_cooldown(service, alias, affinity, Duration::from_millis(300)).await
}

pub async fn spawn_worker_with_cooldown(
    service: &InMemoryCoordinationService,
    alias: &str,
    affinity: Option<&str>,
    cooldown: Duration,
) -> TestWorker {
    let client = service.connect();
    let engine = Arc::new(RecordingEngine::default());
    let worker = ClusterWorker::builder(alias.to_string(), client.clone(), paths())
        .affinity(affinity.map(str::to_string))
        .retry_policy(RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
        .release_cooldown(cooldown)
        .resync_interval(Duration::from_millis(500))
        .engine(engine.clone())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let registered = eventually!(worker.registrar().is_registered().await);
    assert!(registered, "worker {alias} failed to register");

    TestWorker {
        alias: alias.to_string(),
        worker,
        client,
        engine,
    }
}

/// 目标当前的所有者别名
pub async fn owner_of(admin: &ClusterAdmin, target: &str) -> Option<String> {
    admin
        .owner_of(target)
        .await
        .ok()
        .flatten()
        .map(|owner| owner.worker_alias)
}
