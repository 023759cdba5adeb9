use std::sync::Arc;

use jmx_cluster_core::{
    ClusterError, ClusterResult, Command, CoordinationClient, CoordinationClientExt, CreateMode,
    PathScheme, RequestMessage,
};
use metrics::counter;
use tracing::{debug, info, warn};

/// CAS写入连续冲突的上限
const MAX_CAS_ATTEMPTS: u32 = 32;

/// 控制请求通道
///
/// request节点保存按发送顺序排列的请求队列。发送和取出都通过带版本的写入完成，
/// 每条请求最多被取出一次。
pub struct RequestChannel {
    client: Arc<dyn CoordinationClient>,
    paths: PathScheme,
}

impl RequestChannel {
    pub fn new(client: Arc<dyn CoordinationClient>, paths: PathScheme) -> Self {
        Self { client, paths }
    }

    /// 发送请求。相同的可重复命令已在队列中时不再追加，返回None。
    pub async fn send(
        &self,
        target: &str,
        command: Command,
        issued_by: &str,
    ) -> ClusterResult<Option<RequestMessage>> {
        let path = self.paths.request_path(target)?;
        let message = RequestMessage::new(command, issued_by);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((payload, stat)) = self.client.read_optional(&path).await? else {
                let queue = RequestMessage::encode_queue(std::slice::from_ref(&message))?;
                match self
                    .client
                    .create_node(&path, queue, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => return Ok(Some(self.sent(target, message))),
                    Err(ClusterError::NodeExists { .. }) => continue,
                    Err(ClusterError::NodeNotFound { .. }) => {
                        return Err(ClusterError::TargetNotFound {
                            alias: target.to_string(),
                        })
                    }
                    Err(e) => return Err(e),
                }
            };

            let mut queue = self.decode_or_reset(target, &payload);
            if message.command.is_idempotent()
                && queue.iter().any(|pending| pending.command == message.command)
            {
                debug!("目标 {} 已有相同的待处理请求 {:?}", target, message.command);
                return Ok(None);
            }
            queue.push(message.clone());

            match self
                .client
                .write_node(&path, RequestMessage::encode_queue(&queue)?, Some(stat.version))
                .await
            {
                Ok(_) => return Ok(Some(self.sent(target, message))),
                Err(ClusterError::VersionConflict { .. }) | Err(ClusterError::NodeNotFound { .. }) => {
                    counter!("jmx_cluster_request_conflicts_total").increment(1);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::CoordinationUnavailable(format!(
            "目标 {target} 的请求队列写入冲突次数过多"
        )))
    }

    fn sent(&self, target: &str, message: RequestMessage) -> RequestMessage {
        counter!("jmx_cluster_requests_sent_total").increment(1);
        info!(
            "向目标 {} 发送请求 {:?} (来自 {})",
            target, message.command, message.issued_by
        );
        message
    }

    /// 取出队首请求，队列为空或request节点不存在时返回None
    pub async fn poll(&self, target: &str) -> ClusterResult<Option<RequestMessage>> {
        let path = self.paths.request_path(target)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((payload, stat)) = self.client.read_optional(&path).await? else {
                return Ok(None);
            };
            let mut queue = self.decode_or_reset(target, &payload);
            let head = if queue.is_empty() {
                if payload.is_empty() || RequestMessage::decode_queue(&payload).is_ok() {
                    return Ok(None);
                }
                // 无法解析的内容直接清空
                None
            } else {
                Some(queue.remove(0))
            };

            match self
                .client
                .write_node(&path, RequestMessage::encode_queue(&queue)?, Some(stat.version))
                .await
            {
                Ok(_) => {
                    if let Some(message) = &head {
                        counter!("jmx_cluster_requests_consumed_total").increment(1);
                        debug!("取出目标 {} 的请求 {:?}", target, message.command);
                    }
                    return Ok(head);
                }
                Err(ClusterError::VersionConflict { .. }) => continue,
                Err(ClusterError::NodeNotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::CoordinationUnavailable(format!(
            "目标 {target} 的请求队列读取冲突次数过多"
        )))
    }

    /// 待处理的请求（不取出）
    pub async fn pending(&self, target: &str) -> ClusterResult<Vec<RequestMessage>> {
        let path = self.paths.request_path(target)?;
        match self.client.read_optional(&path).await? {
            Some((payload, _)) => Ok(self.decode_or_reset(target, &payload)),
            None => Ok(Vec::new()),
        }
    }

    fn decode_or_reset(&self, target: &str, payload: &[u8]) -> Vec<RequestMessage> {
        RequestMessage::decode_queue(payload).unwrap_or_else(|e| {
            warn!("目标 {} 的请求队列无法解析，丢弃: {}", target, e);
            Vec::new()
        })
    }
}
