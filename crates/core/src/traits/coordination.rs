use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::errors::{ClusterError, ClusterResult};
use crate::paths::PATH_SEPARATOR;

/// 协调服务会话ID
pub type SessionId = u64;
/// 节点数据版本，每次写入加1
pub type NodeVersion = i32;
/// 订阅ID，用于取消订阅
pub type WatchId = u64;

/// 节点创建模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    /// 创建者会话结束时自动删除
    Ephemeral,
}

/// 节点元信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStat {
    pub version: NodeVersion,
    /// 临时节点所属的会话
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
    /// 创建节点的事务号，同一路径上重新创建的节点事务号不同
    pub created_txn: u64,
    pub modified_txn: u64,
}

impl NodeStat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner.is_some()
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// 连接中断，会话可能仍然有效
    Disconnected,
    /// 会话已过期，所有临时节点都已被删除
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// 会话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { session_id: SessionId },
    Disconnected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// 变更通知。只说明路径发生了变化，调用方必须重新读取节点获取最新状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

pub type WatchSender = mpsc::UnboundedSender<WatchEvent>;
pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// 协调服务客户端抽象接口
///
/// 约定：
/// - 临时节点在创建者会话过期时自动删除
/// - 带版本的写入和删除提供比较并交换语义
/// - 订阅是持久的，至少投递一次，可能延迟或合并；会话过期后订阅失效
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// 当前会话ID，未连接时返回None
    fn session_id(&self) -> Option<SessionId>;

    fn session_state(&self) -> SessionState;

    /// 订阅会话事件
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// 创建节点，父节点必须存在；路径已存在时返回 `NodeExists`
    async fn create_node(
        &self,
        path: &str,
        payload: Vec<u8>,
        mode: CreateMode,
    ) -> ClusterResult<NodeStat>;

    /// 删除节点，`expected_version` 为None时无条件删除
    async fn delete_node(&self, path: &str, expected_version: Option<NodeVersion>)
        -> ClusterResult<()>;

    async fn read_node(&self, path: &str) -> ClusterResult<(Vec<u8>, NodeStat)>;

    /// 写入节点数据，`expected_version` 为None时无条件写入
    async fn write_node(
        &self,
        path: &str,
        payload: Vec<u8>,
        expected_version: Option<NodeVersion>,
    ) -> ClusterResult<NodeStat>;

    async fn exists(&self, path: &str) -> ClusterResult<Option<NodeStat>>;

    /// 子节点名称列表（按名称排序）
    async fn list_children(&self, path: &str) -> ClusterResult<Vec<String>>;

    /// 订阅节点本身的创建、删除和数据变更，节点不存在时也可以订阅
    async fn watch_node(&self, path: &str, sink: WatchSender) -> ClusterResult<WatchId>;

    /// 订阅直接子节点的增删
    async fn watch_children(&self, path: &str, sink: WatchSender) -> ClusterResult<WatchId>;

    async fn unwatch(&self, id: WatchId) -> ClusterResult<()>;

    /// 主动关闭会话，临时节点立即删除
    async fn close(&self) -> ClusterResult<()>;
}

/// 基于基础操作的辅助方法
#[async_trait]
pub trait CoordinationClientExt: CoordinationClient {
    /// 逐级创建持久节点，已存在的节点保持不变
    async fn ensure_path(&self, path: &str) -> ClusterResult<()> {
        let mut current = String::new();
        for segment in path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()) {
            current.push(PATH_SEPARATOR);
            current.push_str(segment);
            match self
                .create_node(&current, Vec::new(), CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(ClusterError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 读取节点，不存在时返回None
    async fn read_optional(&self, path: &str) -> ClusterResult<Option<(Vec<u8>, NodeStat)>> {
        match self.read_node(path).await {
            Ok(node) => Ok(Some(node)),
            Err(ClusterError::NodeNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: CoordinationClient + ?Sized> CoordinationClientExt for T {}
