use std::sync::Arc;

use futures::future::join_all;
use jmx_cluster_core::{
    ClusterError, CoordinationClient, CoordinationClientExt, CreateMode, WatchEvent,
    WatchEventKind,
};
use jmx_cluster_infrastructure::{InMemoryClient, InMemoryCoordinationService};
use tokio::sync::mpsc;

const OWNER: &str = "/jmx/jvms/jvm-1/owner";

#[tokio::test]
async fn test_only_one_ephemeral_create_wins() {
    let service = InMemoryCoordinationService::new();
    service.connect().ensure_path("/jmx/jvms/jvm-1").await.unwrap();

    let clients: Vec<Arc<InMemoryClient>> = (0..8).map(|_| service.connect()).collect();
    let results = join_all(clients.iter().map(|client| {
        let payload = client.session_id().unwrap().to_string().into_bytes();
        client.create_node(OWNER, payload, CreateMode::Ephemeral)
    }))
    .await;

    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_ok())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| matches!(r, Err(ClusterError::NodeExists { .. }))));

    let winner = &clients[winners[0]];
    let (_, stat) = winner.read_node(OWNER).await.unwrap();
    assert_eq!(stat.ephemeral_owner, winner.session_id());
}

#[tokio::test]
async fn test_expiry_notifies_other_sessions() {
    let service = InMemoryCoordinationService::new();
    let owner = service.connect();
    let observer = service.connect();
    owner.ensure_path("/jmx/jvms/jvm-1").await.unwrap();
    owner
        .create_node(OWNER, Vec::new(), CreateMode::Ephemeral)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    observer.watch_node(OWNER, tx.clone()).await.unwrap();
    observer
        .watch_children("/jmx/jvms/jvm-1", tx)
        .await
        .unwrap();

    owner.expire();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&WatchEvent {
        path: OWNER.to_string(),
        kind: WatchEventKind::NodeDeleted,
    }));
    assert!(events.contains(&WatchEvent {
        path: "/jmx/jvms/jvm-1".to_string(),
        kind: WatchEventKind::NodeChildrenChanged,
    }));
    assert!(observer.exists(OWNER).await.unwrap().is_none());

    // 过期的客户端在重新连接前不能操作
    assert!(matches!(
        owner.exists(OWNER).await,
        Err(ClusterError::SessionExpired)
    ));
    let new_session = owner.reconnect();
    assert_eq!(owner.session_id(), Some(new_session));
    owner
        .create_node(OWNER, Vec::new(), CreateMode::Ephemeral)
        .await
        .unwrap();
}
