use async_trait::async_trait;
use jmx_cluster_core::paths::{node_name, parent_path, PATH_SEPARATOR};
use jmx_cluster_core::{
    ClusterError, ClusterResult, CoordinationClient, CreateMode, NodeStat, NodeVersion,
    SessionEvent, SessionId, SessionState, WatchEvent, WatchEventKind, WatchId, WatchSender,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 内存协调服务实现
///
/// 在进程内模拟层级协调服务：持久/临时节点、带版本的条件写入和删除、
/// 会话生命周期以及持久订阅。适用于嵌入式部署和多Worker集成测试。
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordinationService {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    tree: Mutex<Tree>,
    next_session_id: AtomicU64,
    next_client_id: AtomicU64,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// 全局事务号，每次修改加1
    txn: u64,
    watches: HashMap<WatchId, Watcher>,
    next_watch_id: WatchId,
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: NodeVersion,
    ephemeral_owner: Option<SessionId>,
    created_txn: u64,
    modified_txn: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchScope {
    Node,
    Children,
}

#[derive(Debug)]
struct Watcher {
    path: String,
    scope: WatchScope,
    client_id: u64,
    sink: WatchSender,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
                ephemeral_owner: None,
                created_txn: 0,
                modified_txn: 0,
            },
        );
        Self {
            nodes,
            txn: 0,
            watches: HashMap::new(),
            next_watch_id: 1,
        }
    }
}

impl Tree {
    fn stat(&self, path: &str, node: &Node) -> NodeStat {
        NodeStat {
            version: node.version,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.children(path).len(),
            created_txn: node.created_txn,
            modified_txn: node.modified_txn,
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}{PATH_SEPARATOR}")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains(PATH_SEPARATOR))
            .map(|(key, _)| node_name(key).to_string())
            .collect()
    }

    fn create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        ephemeral_owner: Option<SessionId>,
    ) -> ClusterResult<NodeStat> {
        validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(ClusterError::node_exists(path));
        }
        let parent = parent_path(path).ok_or_else(|| ClusterError::node_exists(path))?;
        match self.nodes.get(parent) {
            None => return Err(ClusterError::node_not_found(parent)),
            Some(p) if p.ephemeral_owner.is_some() => {
                return Err(ClusterError::Internal(format!(
                    "临时节点 {parent} 不能拥有子节点"
                )))
            }
            Some(_) => {}
        }

        self.txn += 1;
        let node = Node {
            data,
            version: 0,
            ephemeral_owner,
            created_txn: self.txn,
            modified_txn: self.txn,
        };
        let stat = self.stat(path, &node);
        self.nodes.insert(path.to_string(), node);

        self.notify(path, WatchScope::Node, WatchEventKind::NodeCreated);
        self.notify(parent, WatchScope::Children, WatchEventKind::NodeChildrenChanged);
        Ok(stat)
    }

    fn delete(&mut self, path: &str, expected_version: Option<NodeVersion>) -> ClusterResult<()> {
        validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| ClusterError::node_not_found(path))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(ClusterError::version_conflict(path, expected));
            }
        }
        if !self.children(path).is_empty() {
            return Err(ClusterError::NodeNotEmpty {
                path: path.to_string(),
            });
        }

        self.txn += 1;
        self.nodes.remove(path);
        self.notify(path, WatchScope::Node, WatchEventKind::NodeDeleted);
        if let Some(parent) = parent_path(path) {
            self.notify(parent, WatchScope::Children, WatchEventKind::NodeChildrenChanged);
        }
        Ok(())
    }

    fn write(
        &mut self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<NodeVersion>,
    ) -> ClusterResult<NodeStat> {
        validate_path(path)?;
        let txn = self.txn + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClusterError::node_not_found(path))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(ClusterError::version_conflict(path, expected));
            }
        }
        // 校验通过后才推进事务号
        self.txn = txn;
        node.data = data;
        node.version += 1;
        node.modified_txn = txn;
        let node = node.clone();

        self.notify(path, WatchScope::Node, WatchEventKind::NodeDataChanged);
        Ok(self.stat(path, &node))
    }

    /// 删除会话创建的全部临时节点
    fn remove_ephemerals(&mut self, session_id: SessionId) -> usize {
        let paths: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in &paths {
            if let Err(e) = self.delete(path, None) {
                warn!("删除会话 {} 的临时节点 {} 失败: {}", session_id, path, e);
            }
        }
        paths.len()
    }

    fn add_watch(&mut self, path: &str, scope: WatchScope, client_id: u64, sink: WatchSender) -> WatchId {
        let id = self.next_watch_id;
        self.next_watch_id += 1;
        self.watches.insert(
            id,
            Watcher {
                path: path.to_string(),
                scope,
                client_id,
                sink,
            },
        );
        id
    }

    fn drop_client_watches(&mut self, client_id: u64) -> usize {
        let before = self.watches.len();
        self.watches.retain(|_, w| w.client_id != client_id);
        before - self.watches.len()
    }

    fn notify(&mut self, path: &str, scope: WatchScope, kind: WatchEventKind) {
        let mut closed = Vec::new();
        for (id, watcher) in &self.watches {
            if watcher.scope != scope || watcher.path != path {
                continue;
            }
            let event = WatchEvent {
                path: path.to_string(),
                kind,
            };
            if watcher.sink.send(event).is_err() {
                closed.push(*id);
            }
        }
        // 接收端已丢弃的订阅视为取消
        for id in closed {
            self.watches.remove(&id);
        }
    }
}

fn validate_path(path: &str) -> ClusterResult<()> {
    let valid = path.starts_with(PATH_SEPARATOR)
        && (path == "/" || !path.ends_with(PATH_SEPARATOR))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(ClusterError::Internal(format!("无效的节点路径: '{path}'")))
    }
}

impl Shared {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl InMemoryCoordinationService {
    pub fn new() -> Self {
        info!("创建内存协调服务");
        Self::default()
    }

    /// 建立新会话，返回对应的客户端
    pub fn connect(&self) -> Arc<InMemoryClient> {
        let session_id = self.shared.new_session_id();
        let client_id = self.shared.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, _) = broadcast::channel(64);
        debug!("客户端 {} 建立会话 {}", client_id, session_id);

        Arc::new(InMemoryClient {
            client_id,
            shared: Arc::clone(&self.shared),
            state: Mutex::new(ClientState {
                session_id: Some(session_id),
                status: SessionState::Connected,
            }),
            events,
        })
    }

    /// 所有节点路径（按字典序）
    pub fn paths(&self) -> Vec<String> {
        self.shared.tree().nodes.keys().cloned().collect()
    }

    /// 当前有效的订阅数量
    pub fn watch_count(&self) -> usize {
        self.shared.tree().watches.len()
    }
}

#[derive(Debug)]
struct ClientState {
    session_id: Option<SessionId>,
    status: SessionState,
}

/// 内存协调服务的客户端，同一时刻持有一个会话
#[derive(Debug)]
pub struct InMemoryClient {
    client_id: u64,
    shared: Arc<Shared>,
    state: Mutex<ClientState>,
    events: broadcast::Sender<SessionEvent>,
}

impl InMemoryClient {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前会话可用时返回会话ID
    fn active_session(&self) -> ClusterResult<SessionId> {
        let state = self.state();
        match (state.status, state.session_id) {
            (SessionState::Connected, Some(id)) => Ok(id),
            (SessionState::Disconnected, _) => Err(ClusterError::SessionDisconnected),
            (SessionState::Expired, _) => Err(ClusterError::SessionExpired),
            _ => Err(ClusterError::CoordinationUnavailable(
                "会话已关闭".to_string(),
            )),
        }
    }

    fn publish(&self, event: SessionEvent) {
        // 没有订阅者时发送失败，可以忽略
        let _ = self.events.send(event);
    }

    /// 模拟连接中断：会话和临时节点保留，操作返回 `SessionDisconnected`
    pub fn disconnect(&self) {
        let mut state = self.state();
        if state.status != SessionState::Connected {
            return;
        }
        state.status = SessionState::Disconnected;
        drop(state);
        info!("客户端 {} 连接中断", self.client_id);
        self.publish(SessionEvent::Disconnected);
    }

    /// 重新连接。连接中断后恢复原会话，会话过期或关闭后建立新会话。
    pub fn reconnect(&self) -> SessionId {
        let mut state = self.state();
        let session_id = match (state.status, state.session_id) {
            (SessionState::Connected, Some(id)) => return id,
            (SessionState::Disconnected, Some(id)) => id,
            _ => self.shared.new_session_id(),
        };
        state.session_id = Some(session_id);
        state.status = SessionState::Connected;
        drop(state);

        info!("客户端 {} 已连接，会话 {}", self.client_id, session_id);
        self.publish(SessionEvent::Connected { session_id });
        session_id
    }

    /// 模拟会话过期：删除该会话的全部临时节点并取消所有订阅
    pub fn expire(&self) {
        let mut state = self.state();
        if !matches!(
            state.status,
            SessionState::Connected | SessionState::Disconnected
        ) {
            return;
        }
        let Some(session_id) = state.session_id.take() else {
            return;
        };
        state.status = SessionState::Expired;
        drop(state);

        let (removed, dropped) = {
            let mut tree = self.shared.tree();
            let removed = tree.remove_ephemerals(session_id);
            (removed, tree.drop_client_watches(self.client_id))
        };
        warn!(
            "会话 {} 已过期，删除 {} 个临时节点，取消 {} 个订阅",
            session_id, removed, dropped
        );
        self.publish(SessionEvent::Expired);
    }

    fn register_watch(&self, path: &str, scope: WatchScope, sink: WatchSender) -> ClusterResult<WatchId> {
        self.active_session()?;
        validate_path(path)?;
        Ok(self
            .shared
            .tree()
            .add_watch(path, scope, self.client_id, sink))
    }
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    fn session_id(&self) -> Option<SessionId> {
        let state = self.state();
        match state.status {
            SessionState::Connected | SessionState::Disconnected => state.session_id,
            _ => None,
        }
    }

    fn session_state(&self) -> SessionState {
        self.state().status
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn create_node(
        &self,
        path: &str,
        payload: Vec<u8>,
        mode: CreateMode,
    ) -> ClusterResult<NodeStat> {
        let session_id = self.active_session()?;
        let owner = match mode {
            CreateMode::Ephemeral => Some(session_id),
            CreateMode::Persistent => None,
        };
        let stat = self.shared.tree().create(path, payload, owner)?;
        debug!("创建节点 {} ({:?})", path, mode);
        Ok(stat)
    }

    async fn delete_node(
        &self,
        path: &str,
        expected_version: Option<NodeVersion>,
    ) -> ClusterResult<()> {
        self.active_session()?;
        self.shared.tree().delete(path, expected_version)?;
        debug!("删除节点 {}", path);
        Ok(())
    }

    async fn read_node(&self, path: &str) -> ClusterResult<(Vec<u8>, NodeStat)> {
        self.active_session()?;
        validate_path(path)?;
        let tree = self.shared.tree();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| ClusterError::node_not_found(path))?;
        Ok((node.data.clone(), tree.stat(path, node)))
    }

    async fn write_node(
        &self,
        path: &str,
        payload: Vec<u8>,
        expected_version: Option<NodeVersion>,
    ) -> ClusterResult<NodeStat> {
        self.active_session()?;
        self.shared.tree().write(path, payload, expected_version)
    }

    async fn exists(&self, path: &str) -> ClusterResult<Option<NodeStat>> {
        self.active_session()?;
        validate_path(path)?;
        let tree = self.shared.tree();
        Ok(tree.nodes.get(path).map(|node| tree.stat(path, node)))
    }

    async fn list_children(&self, path: &str) -> ClusterResult<Vec<String>> {
        self.active_session()?;
        validate_path(path)?;
        let tree = self.shared.tree();
        if !tree.nodes.contains_key(path) {
            return Err(ClusterError::node_not_found(path));
        }
        Ok(tree.children(path))
    }

    async fn watch_node(&self, path: &str, sink: WatchSender) -> ClusterResult<WatchId> {
        self.register_watch(path, WatchScope::Node, sink)
    }

    async fn watch_children(&self, path: &str, sink: WatchSender) -> ClusterResult<WatchId> {
        self.register_watch(path, WatchScope::Children, sink)
    }

    async fn unwatch(&self, id: WatchId) -> ClusterResult<()> {
        self.shared.tree().watches.remove(&id);
        Ok(())
    }

    async fn close(&self) -> ClusterResult<()> {
        let session_id = {
            let mut state = self.state();
            let session_id = state.session_id.take();
            state.status = SessionState::Closed;
            session_id
        };
        let mut tree = self.shared.tree();
        tree.drop_client_watches(self.client_id);
        if let Some(session_id) = session_id {
            let removed = tree.remove_ephemerals(session_id);
            info!("会话 {} 已关闭，删除 {} 个临时节点", session_id, removed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jmx_cluster_core::CoordinationClientExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_create_read_write_delete() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();

        client.ensure_path("/jmx/jvms").await.unwrap();
        let stat = client
            .create_node("/jmx/jvms/jvm-1", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(stat.version, 0);
        assert!(!stat.is_ephemeral());

        let stat = client
            .write_node("/jmx/jvms/jvm-1", b"v1".to_vec(), Some(0))
            .await
            .unwrap();
        assert_eq!(stat.version, 1);

        let (data, stat) = client.read_node("/jmx/jvms/jvm-1").await.unwrap();
        assert_eq!(data, b"v1");
        assert_eq!(stat.version, 1);

        assert_eq!(
            client.list_children("/jmx/jvms").await.unwrap(),
            vec!["jvm-1".to_string()]
        );

        client.delete_node("/jmx/jvms/jvm-1", Some(1)).await.unwrap();
        assert!(client.exists("/jmx/jvms/jvm-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_conflicts() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();

        assert!(matches!(
            client
                .create_node("/missing/child", vec![], CreateMode::Persistent)
                .await,
            Err(ClusterError::NodeNotFound { .. })
        ));

        client
            .create_node("/a", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        assert!(matches!(
            client.create_node("/a", vec![], CreateMode::Persistent).await,
            Err(ClusterError::NodeExists { .. })
        ));

        client
            .create_node("/a/e", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        assert!(client
            .create_node("/a/e/child", vec![], CreateMode::Persistent)
            .await
            .is_err());

        assert!(matches!(
            client.delete_node("/a", None).await,
            Err(ClusterError::NodeNotEmpty { .. })
        ));
        assert!(client.create_node("a/b", vec![], CreateMode::Persistent).await.is_err());
    }

    #[tokio::test]
    async fn test_version_conflicts() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        client
            .create_node("/n", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        client.write_node("/n", b"y".to_vec(), None).await.unwrap();

        assert!(matches!(
            client.write_node("/n", b"z".to_vec(), Some(0)).await,
            Err(ClusterError::VersionConflict { expected: 0, .. })
        ));
        assert!(matches!(
            client.delete_node("/n", Some(0)).await,
            Err(ClusterError::VersionConflict { .. })
        ));
        client.delete_node("/n", Some(1)).await.unwrap();
        assert!(matches!(
            client.delete_node("/n", None).await,
            Err(ClusterError::NodeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_consume_txn() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let created = client
            .create_node("/n", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        assert!(client.write_node("/n", b"y".to_vec(), Some(7)).await.is_err());
        assert!(client.write_node("/missing", b"y".to_vec(), None).await.is_err());

        let written = client.write_node("/n", b"y".to_vec(), Some(0)).await.unwrap();
        assert_eq!(written.modified_txn, created.created_txn + 1);
        let next = client
            .create_node("/m", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(next.created_txn, written.modified_txn + 1);
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_removed_on_expiry() {
        let service = InMemoryCoordinationService::new();
        let owner = service.connect();
        let observer = service.connect();
        owner.ensure_path("/workers").await.unwrap();

        let stat = owner
            .create_node("/workers/w1", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(stat.ephemeral_owner, owner.session_id());

        let (tx, mut rx) = mpsc::unbounded_channel();
        observer.watch_children("/workers", tx).await.unwrap();
        let mut events = owner.session_events();

        owner.expire();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert!(observer.exists("/workers/w1").await.unwrap().is_none());
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent {
                path: "/workers".to_string(),
                kind: WatchEventKind::NodeChildrenChanged,
            }
        );

        // 过期后的操作失败，重连后获得新会话
        assert!(matches!(
            owner.exists("/workers").await,
            Err(ClusterError::SessionExpired)
        ));
        let old_session = stat.ephemeral_owner.unwrap();
        let new_session = owner.reconnect();
        assert_ne!(old_session, new_session);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Connected {
                session_id: new_session
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_keeps_session() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let session = client.session_id().unwrap();
        client
            .create_node("/e", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();

        client.disconnect();
        assert_eq!(client.session_state(), SessionState::Disconnected);
        assert!(matches!(
            client.read_node("/e").await,
            Err(ClusterError::SessionDisconnected)
        ));

        assert_eq!(client.reconnect(), session);
        assert!(client.exists("/e").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_node_watch_and_unwatch() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = client.watch_node("/n", tx).await.unwrap();
        client
            .create_node("/n", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        client.write_node("/n", b"1".to_vec(), None).await.unwrap();
        client.delete_node("/n", None).await.unwrap();

        let kinds: Vec<_> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|e| e.unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                WatchEventKind::NodeCreated,
                WatchEventKind::NodeDataChanged,
                WatchEventKind::NodeDeleted
            ]
        );

        client.unwatch(id).await.unwrap();
        assert_eq!(service.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels_watch() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        let (tx, rx) = mpsc::unbounded_channel();
        client.watch_node("/n", tx).await.unwrap();
        drop(rx);

        client
            .create_node("/n", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(service.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals() {
        let service = InMemoryCoordinationService::new();
        let client = service.connect();
        client
            .create_node("/e", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        client.close().await.unwrap();

        assert_eq!(client.session_state(), SessionState::Closed);
        assert_eq!(service.paths(), vec!["/".to_string()]);
    }
}
