use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    observability::ObservabilityConfig,
    worker::{EmbeddedWorkerConfig, TargetConfig, WorkerConfig},
    zookeeper::ZookeeperConfig,
};
use crate::retry::RetryPolicy;

/// 默认配置文件搜索路径
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/jmx-cluster.toml",
    "jmx-cluster.toml",
    "/etc/jmx-cluster/config.toml",
];

/// 系统配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub zookeeper: ZookeeperConfig,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub observability: ObservabilityConfig,
    pub targets: Vec<TargetConfig>,
    pub embedded_workers: Vec<EmbeddedWorkerConfig>,
}

impl ClusterConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML），未指定时依次查找默认路径
    /// 3. 环境变量覆盖（前缀 JMX_CLUSTER_），优先级最高
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("JMX_CLUSTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ClusterConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.zookeeper.validate().context("协调服务配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.retry.validate().context("重试策略配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        let mut aliases = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !aliases.insert(target.alias.as_str()) {
                return Err(anyhow::anyhow!("监控目标别名重复: {}", target.alias));
            }
        }

        let mut workers = HashSet::from([self.worker.alias.as_str()]);
        for worker in &self.embedded_workers {
            WorkerConfig {
                alias: worker.alias.clone(),
                affinity: worker.affinity.clone(),
                ..self.worker.clone()
            }
            .validate()
            .context("嵌入Worker配置验证失败")?;
            if !workers.insert(worker.alias.as_str()) {
                return Err(anyhow::anyhow!("Worker别名重复: {}", worker.alias));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[zookeeper]
connection_string = "zk1:2181,zk2:2181"
heartbeat_path = "/jmx/workers"
config_path = "/jmx/jvms"

[worker]
alias = "w1"
affinity = "prod"
release_cooldown_seconds = 5

[retry]
base_delay_ms = 100
max_delay_ms = 2000
backoff_multiplier = 2.0
jitter_factor = 0.2

[[targets]]
alias = "jvm-1"

[[targets]]
alias = "jvm-2"
affinity = "prod"
config = { host = "app2.internal", port = 9010 }

[[embedded_workers]]
alias = "w2"
"#;

    #[test]
    fn test_from_toml() {
        let config = ClusterConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.zookeeper.connection_string, "zk1:2181,zk2:2181");
        assert_eq!(config.zookeeper.connect_retry, 5);
        assert_eq!(config.worker.alias, "w1");
        assert_eq!(config.worker.affinity.as_deref(), Some("prod"));
        assert_eq!(config.worker.resync_interval_seconds, 30);
        assert_eq!(config.retry.max_delay_ms, 2000);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[1].config["port"], 9010);
        assert!(config.targets[0].config.is_object());
        assert_eq!(config.embedded_workers[0].alias, "w2");

        let paths = config.zookeeper.path_scheme().unwrap();
        assert_eq!(paths.owner_path("jvm-1").unwrap(), "/jmx/jvms/jvm-1/owner");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ClusterConfig::from_toml(SAMPLE).unwrap();
        let serialized = config.to_toml().unwrap();
        let reloaded = ClusterConfig::from_toml(&serialized).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_validation_failures() {
        let invalid_alias = SAMPLE.replace("alias = \"w1\"", "alias = \"w/1\"");
        assert!(ClusterConfig::from_toml(&invalid_alias).is_err());

        let duplicate_target = SAMPLE.replace("alias = \"jvm-2\"", "alias = \"jvm-1\"");
        assert!(ClusterConfig::from_toml(&duplicate_target).is_err());

        let duplicate_worker = SAMPLE.replace("alias = \"w2\"", "alias = \"w1\"");
        assert!(ClusterConfig::from_toml(&duplicate_worker).is_err());

        let nested_roots = SAMPLE.replace("\"/jmx/workers\"", "\"/jmx/jvms/workers\"");
        assert!(ClusterConfig::from_toml(&nested_roots).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ClusterConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.worker.alias, "w1");
        assert_eq!(config.targets.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(ClusterConfig::load(Some("/nonexistent/jmx-cluster.toml")).is_err());
    }
}
