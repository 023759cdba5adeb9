use std::collections::BTreeSet;
use std::sync::Arc;

use jmx_cluster_core::{
    ClusterError, ClusterResult, CoordinationClient, CoordinationClientExt, PathScheme,
};

use super::WorkerRegistrar;

/// 亲和性规则：目标没有要求时任何Worker都可以认领，
/// 有要求时只有标签完全相同的Worker可以认领。
pub fn eligible(worker_affinity: Option<&str>, required: Option<&str>) -> bool {
    match required {
        None => true,
        Some(required) => worker_affinity == Some(required),
    }
}

/// 亲和性解析：读取目标要求的标签，并按标签过滤存活Worker
pub struct AffinityResolver {
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
    registrar: Arc<WorkerRegistrar>,
}

impl AffinityResolver {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        paths: PathScheme,
        registrar: Arc<WorkerRegistrar>,
    ) -> Self {
        Self {
            client,
            paths,
            registrar,
        }
    }

    /// affinity节点不存在或内容为空都表示没有约束
    pub async fn required_affinity(&self, target: &str) -> ClusterResult<Option<String>> {
        let path = self.paths.affinity_path(target)?;
        let Some((payload, _)) = self.client.read_optional(&path).await? else {
            return Ok(None);
        };
        let label = String::from_utf8(payload)
            .map_err(|e| ClusterError::Serialization(format!("亲和性标签不是有效的UTF-8: {e}")))?;
        let label = label.trim();
        Ok((!label.is_empty()).then(|| label.to_string()))
    }

    pub async fn is_eligible(
        &self,
        worker_affinity: Option<&str>,
        target: &str,
    ) -> ClusterResult<bool> {
        let required = self.required_affinity(target).await?;
        Ok(eligible(worker_affinity, required.as_deref()))
    }

    /// 亲和组当前的存活成员
    pub async fn members_of(&self, group: &str) -> BTreeSet<String> {
        self.registrar
            .members()
            .await
            .into_iter()
            .filter(|m| m.affinity.as_deref() == Some(group))
            .map(|m| m.alias)
            .collect()
    }

    /// 可以认领该目标的存活Worker
    pub async fn eligible_workers(&self, target: &str) -> ClusterResult<BTreeSet<String>> {
        let required = self.required_affinity(target).await?;
        Ok(self
            .registrar
            .members()
            .await
            .into_iter()
            .filter(|m| eligible(m.affinity.as_deref(), required.as_deref()))
            .map(|m| m.alias)
            .collect())
    }
}
