use std::sync::Arc;

use metrics::gauge;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Worker健康状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// 暂时无法参与选举（例如连接中断），会自动恢复
    Degraded { reason: String },
    /// 重试预算耗尽或已停止，需要运维关注
    Unhealthy { reason: String },
}

impl HealthStatus {
    /// 健康检查端点是否返回成功
    pub fn is_serving(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy { .. })
    }

    fn as_gauge(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded { .. } => 0.5,
            HealthStatus::Unhealthy { .. } => 0.0,
        }
    }
}

/// 健康状态上报。Worker失去协调会话时只上报状态，不退出进程。
#[derive(Debug, Clone)]
pub struct HealthReporter {
    worker_alias: String,
    tx: Arc<watch::Sender<HealthStatus>>,
}

impl HealthReporter {
    pub fn new<S: Into<String>>(worker_alias: S) -> Self {
        let (tx, _) = watch::channel(HealthStatus::Degraded {
            reason: "启动中".to_string(),
        });
        Self {
            worker_alias: worker_alias.into(),
            tx: Arc::new(tx),
        }
    }

    pub fn worker_alias(&self) -> &str {
        &self.worker_alias
    }

    pub fn status(&self) -> HealthStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.tx.subscribe()
    }

    pub fn set_healthy(&self) {
        if self.update(HealthStatus::Healthy) {
            info!("Worker {} 状态恢复正常", self.worker_alias);
        }
    }

    pub fn set_degraded<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        if self.update(HealthStatus::Degraded {
            reason: reason.clone(),
        }) {
            warn!("Worker {} 状态降级: {}", self.worker_alias, reason);
        }
    }

    pub fn set_unhealthy<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        if self.update(HealthStatus::Unhealthy {
            reason: reason.clone(),
        }) {
            error!("Worker {} 状态异常: {}", self.worker_alias, reason);
        }
    }

    /// 状态有变化时返回true
    fn update(&self, status: HealthStatus) -> bool {
        gauge!("jmx_cluster_worker_health", "worker" => self.worker_alias.clone())
            .set(status.as_gauge());
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_transitions() {
        let health = HealthReporter::new("w1");
        let mut rx = health.subscribe();
        assert!(matches!(health.status(), HealthStatus::Degraded { .. }));

        health.set_healthy();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), HealthStatus::Healthy);

        health.set_unhealthy("协调服务不可用");
        assert!(!health.status().is_serving());

        health.set_degraded("连接中断");
        assert!(health.status().is_serving());
    }

    #[test]
    fn test_health_serialization() {
        let json = serde_json::to_value(HealthStatus::Degraded {
            reason: "连接中断".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["reason"], "连接中断");
    }
}
