//! 协调服务节点路径方案
//!
//! 集群中所有节点路径都由 [`PathScheme`] 计算，其他组件不自行拼接路径字符串。
//! 节点树布局：
//!
//! ```text
//! {heartbeat_root}/{worker}            临时节点，Worker元数据
//! {config_root}/{jvm}                  持久节点，监控目标存在标记
//! {config_root}/{jvm}/owner            临时节点，当前所有者
//! {config_root}/{jvm}/affinity         持久节点，要求的亲和性标签
//! {config_root}/{jvm}/config           持久节点，监控配置
//! {config_root}/{jvm}/request          持久节点，待处理的控制请求
//! ```

use crate::errors::{ClusterError, ClusterResult};

pub const PATH_SEPARATOR: char = '/';
pub const OWNER_NODE_NAME: &str = "owner";
pub const AFFINITY_NODE_NAME: &str = "affinity";
pub const CONFIG_NODE_NAME: &str = "config";
pub const REQUEST_NODE_NAME: &str = "request";

/// 路径所指向的实体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    HeartbeatRoot,
    Worker(String),
    ConfigRoot,
    Target(String),
    Owner(String),
    Affinity(String),
    Config(String),
    Request(String),
}

impl PathKind {
    /// 路径所属的监控目标别名（Worker和根路径返回None）
    pub fn target(&self) -> Option<&str> {
        match self {
            PathKind::Target(t)
            | PathKind::Owner(t)
            | PathKind::Affinity(t)
            | PathKind::Config(t)
            | PathKind::Request(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScheme {
    config_root: String,
    heartbeat_root: String,
}

impl PathScheme {
    pub fn new<C: Into<String>, H: Into<String>>(
        config_root: C,
        heartbeat_root: H,
    ) -> ClusterResult<Self> {
        let config_root = config_root.into();
        let heartbeat_root = heartbeat_root.into();
        Self::validate_root(&config_root)?;
        Self::validate_root(&heartbeat_root)?;

        if config_root == heartbeat_root
            || Self::is_under(&config_root, &heartbeat_root)
            || Self::is_under(&heartbeat_root, &config_root)
        {
            return Err(ClusterError::config_error(format!(
                "配置根路径 {config_root} 与心跳根路径 {heartbeat_root} 不能相互嵌套"
            )));
        }

        Ok(Self {
            config_root,
            heartbeat_root,
        })
    }

    pub fn config_root(&self) -> &str {
        &self.config_root
    }

    pub fn heartbeat_root(&self) -> &str {
        &self.heartbeat_root
    }

    /// 别名必须非空且不包含路径分隔符
    pub fn validate_alias(alias: &str) -> ClusterResult<()> {
        if alias.is_empty() {
            return Err(ClusterError::invalid_alias(alias, "别名不能为空"));
        }
        if alias.contains(PATH_SEPARATOR) {
            return Err(ClusterError::invalid_alias(alias, "别名不能包含路径分隔符"));
        }
        if alias == "." || alias == ".." {
            return Err(ClusterError::invalid_alias(alias, "别名不能是相对路径"));
        }
        Ok(())
    }

    pub fn worker_path(&self, worker_alias: &str) -> ClusterResult<String> {
        Self::validate_alias(worker_alias)?;
        Ok(format!("{}/{}", self.heartbeat_root, worker_alias))
    }

    pub fn target_path(&self, jvm_alias: &str) -> ClusterResult<String> {
        Self::validate_alias(jvm_alias)?;
        Ok(format!("{}/{}", self.config_root, jvm_alias))
    }

    pub fn owner_path(&self, jvm_alias: &str) -> ClusterResult<String> {
        self.target_child(jvm_alias, OWNER_NODE_NAME)
    }

    pub fn affinity_path(&self, jvm_alias: &str) -> ClusterResult<String> {
        self.target_child(jvm_alias, AFFINITY_NODE_NAME)
    }

    pub fn config_path(&self, jvm_alias: &str) -> ClusterResult<String> {
        self.target_child(jvm_alias, CONFIG_NODE_NAME)
    }

    pub fn request_path(&self, jvm_alias: &str) -> ClusterResult<String> {
        self.target_child(jvm_alias, REQUEST_NODE_NAME)
    }

    /// 亲和组视图路径。这是心跳子节点按标签过滤后的逻辑视图，不一定对应实际节点。
    pub fn affinity_group_path(&self, affinity: &str) -> ClusterResult<String> {
        Self::validate_alias(affinity)?;
        Ok(format!("{}/{}", self.heartbeat_root, affinity))
    }

    /// 把绝对路径还原为它所指向的实体，不属于本方案的路径返回None
    pub fn classify(&self, path: &str) -> Option<PathKind> {
        if path == self.heartbeat_root {
            return Some(PathKind::HeartbeatRoot);
        }
        if path == self.config_root {
            return Some(PathKind::ConfigRoot);
        }

        if let Some(rest) = Self::strip_root(path, &self.heartbeat_root) {
            return match rest.split(PATH_SEPARATOR).collect::<Vec<_>>().as_slice() {
                [worker] if !worker.is_empty() => Some(PathKind::Worker(worker.to_string())),
                _ => None,
            };
        }

        let rest = Self::strip_root(path, &self.config_root)?;
        match rest.split(PATH_SEPARATOR).collect::<Vec<_>>().as_slice() {
            [jvm] if !jvm.is_empty() => Some(PathKind::Target(jvm.to_string())),
            [jvm, child] if !jvm.is_empty() => {
                let jvm = jvm.to_string();
                match *child {
                    OWNER_NODE_NAME => Some(PathKind::Owner(jvm)),
                    AFFINITY_NODE_NAME => Some(PathKind::Affinity(jvm)),
                    CONFIG_NODE_NAME => Some(PathKind::Config(jvm)),
                    REQUEST_NODE_NAME => Some(PathKind::Request(jvm)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn target_child(&self, jvm_alias: &str, child: &str) -> ClusterResult<String> {
        Ok(format!("{}/{}", self.target_path(jvm_alias)?, child))
    }

    fn validate_root(root: &str) -> ClusterResult<()> {
        if !root.starts_with(PATH_SEPARATOR) {
            return Err(ClusterError::config_error(format!(
                "根路径必须是绝对路径: '{root}'"
            )));
        }
        if root.len() > 1 && root.ends_with(PATH_SEPARATOR) {
            return Err(ClusterError::config_error(format!(
                "根路径不能以分隔符结尾: '{root}'"
            )));
        }
        if root.len() == 1 || root.contains("//") {
            return Err(ClusterError::config_error(format!("无效的根路径: '{root}'")));
        }
        Ok(())
    }

    fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
        path.strip_prefix(root)?.strip_prefix(PATH_SEPARATOR)
    }

    fn is_under(path: &str, root: &str) -> bool {
        Self::strip_root(path, root).is_some()
    }
}

/// 父节点路径，根节点返回None
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind(PATH_SEPARATOR) {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// 节点名称（路径最后一段）
pub fn node_name(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> PathScheme {
        PathScheme::new("/jmxtrans/jvms", "/jmxtrans/workers").unwrap()
    }

    #[test]
    fn test_canonical_paths() {
        let paths = scheme();
        assert_eq!(paths.worker_path("w1").unwrap(), "/jmxtrans/workers/w1");
        assert_eq!(paths.target_path("jvm-1").unwrap(), "/jmxtrans/jvms/jvm-1");
        assert_eq!(
            paths.owner_path("jvm-1").unwrap(),
            "/jmxtrans/jvms/jvm-1/owner"
        );
        assert_eq!(
            paths.affinity_path("jvm-1").unwrap(),
            "/jmxtrans/jvms/jvm-1/affinity"
        );
        assert_eq!(
            paths.config_path("jvm-1").unwrap(),
            "/jmxtrans/jvms/jvm-1/config"
        );
        assert_eq!(
            paths.request_path("jvm-1").unwrap(),
            "/jmxtrans/jvms/jvm-1/request"
        );
        assert_eq!(
            paths.affinity_group_path("prod").unwrap(),
            "/jmxtrans/workers/prod"
        );
    }

    #[test]
    fn test_invalid_aliases() {
        let paths = scheme();
        assert!(matches!(
            paths.owner_path(""),
            Err(ClusterError::InvalidAlias { .. })
        ));
        assert!(matches!(
            paths.worker_path("a/b"),
            Err(ClusterError::InvalidAlias { .. })
        ));
        assert!(paths.config_path("..").is_err());
    }

    #[test]
    fn test_invalid_roots() {
        assert!(PathScheme::new("jvms", "/workers").is_err());
        assert!(PathScheme::new("/jvms/", "/workers").is_err());
        assert!(PathScheme::new("/", "/workers").is_err());
        assert!(PathScheme::new("/jmx", "/jmx/workers").is_err());
        assert!(PathScheme::new("/same", "/same").is_err());
        assert!(PathScheme::new("/jmx/jvms", "/jmx/jvms2").is_ok());
    }

    #[test]
    fn test_classify_round_trip() {
        let paths = scheme();
        assert_eq!(
            paths.classify("/jmxtrans/workers"),
            Some(PathKind::HeartbeatRoot)
        );
        assert_eq!(paths.classify("/jmxtrans/jvms"), Some(PathKind::ConfigRoot));
        assert_eq!(
            paths.classify(&paths.worker_path("w1").unwrap()),
            Some(PathKind::Worker("w1".into()))
        );
        assert_eq!(
            paths.classify(&paths.owner_path("jvm-1").unwrap()),
            Some(PathKind::Owner("jvm-1".into()))
        );
        assert_eq!(
            paths.classify(&paths.request_path("jvm-1").unwrap()),
            Some(PathKind::Request("jvm-1".into()))
        );
        assert_eq!(paths.classify("/jmxtrans/jvms/jvm-1/unknown"), None);
        assert_eq!(paths.classify("/jmxtrans/jvms2/jvm-1"), None);
        assert_eq!(paths.classify("/other"), None);
        assert_eq!(
            PathKind::Config("jvm-1".into()).target(),
            Some("jvm-1")
        );
        assert_eq!(PathKind::Worker("w1".into()).target(), None);
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b/c"), "c");
    }
}
