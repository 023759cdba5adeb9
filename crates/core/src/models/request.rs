use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ClusterResult;

/// 发送给监控目标当前所有者的控制命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// 释放所有权
    Release,
    /// 重新加载监控配置
    ReloadConfig,
    /// 建议把所有权转交给指定Worker
    Reassign { to: String },
}

impl Command {
    /// 可重复投递的命令：重复执行不会改变结果
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Command::ReloadConfig)
    }
}

/// 控制请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: Uuid,
    pub command: Command,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
}

impl RequestMessage {
    pub fn new<S: Into<String>>(command: Command, issued_by: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            issued_by: issued_by.into(),
            issued_at: Utc::now(),
        }
    }

    /// request节点内容是按发送顺序排列的请求队列
    pub fn encode_queue(queue: &[RequestMessage]) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(queue)?)
    }

    pub fn decode_queue(payload: &[u8]) -> ClusterResult<Vec<RequestMessage>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(payload)?)
    }
}
