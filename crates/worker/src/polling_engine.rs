use async_trait::async_trait;
use jmx_cluster_core::{ClusterResult, ConfigBlob};
use tracing::info;

/// JMX轮询引擎接口
///
/// 获得所有权后收到目标的监控配置，失去所有权时收到停止信号。
/// 采集结果的序列化和输出由引擎自己负责。
#[async_trait]
pub trait PollingEngine: Send + Sync {
    async fn start(&self, blob: &ConfigBlob) -> ClusterResult<()>;

    /// 配置版本更新或收到重新加载请求时，用新参数重启
    async fn restart(&self, blob: &ConfigBlob) -> ClusterResult<()>;

    async fn stop(&self, target: &str) -> ClusterResult<()>;
}

/// 只记录日志的轮询引擎
#[derive(Debug, Clone)]
pub struct LoggingPollingEngine {
    worker_alias: String,
}

impl LoggingPollingEngine {
    pub fn new<S: Into<String>>(worker_alias: S) -> Self {
        Self {
            worker_alias: worker_alias.into(),
        }
    }
}

#[async_trait]
impl PollingEngine for LoggingPollingEngine {
    async fn start(&self, blob: &ConfigBlob) -> ClusterResult<()> {
        info!(
            worker = %self.worker_alias,
            target = %blob.target,
            version = blob.version,
            "开始轮询监控目标"
        );
        Ok(())
    }

    async fn restart(&self, blob: &ConfigBlob) -> ClusterResult<()> {
        info!(
            worker = %self.worker_alias,
            target = %blob.target,
            version = blob.version,
            "监控配置已更新，重启轮询"
        );
        Ok(())
    }

    async fn stop(&self, target: &str) -> ClusterResult<()> {
        info!(worker = %self.worker_alias, target = %target, "停止轮询监控目标");
        Ok(())
    }
}
