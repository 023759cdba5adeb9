#[macro_use]
mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use common::{admin, owner_of, spawn_worker, spawn_worker_with_cooldown, EngineCall};
use jmx_cluster_core::{CoordinationClient, WatchEventKind};
use jmx_cluster_infrastructure::InMemoryCoordinationService;
use jmx_cluster_worker::HealthStatus;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_single_owner_among_concurrent_workers() {
    let service = InMemoryCoordinationService::new();
    let admin = admin(&service);
    let targets: Vec<String> = (1..=10).map(|i| format!("jvm-{i}")).collect();
    for target in &targets {
        admin
            .register_target(target, None, br#"{"port":9999}"#.to_vec())
            .await
            .unwrap();
    }

    let mut workers = Vec::new();
    for i in 1..=5 {
        workers.push(spawn_worker(&service, &format!("w{i}"), None).await);
    }

    let all_owned = eventually!({
        let mut owned = 0;
        for target in &targets {
            if owner_of(&admin, target).await.is_some() {
                owned += 1;
            }
        }
        owned == targets.len()
    });
    assert!(all_owned);

    // 每个目标的本地所有权与owner节点一致，且只有一个Worker认为自己持有
    let mut local: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for worker in &workers {
        for target in worker.worker.owned_targets().await {
            local.entry(target).or_default().push(worker.alias.clone());
        }
    }
    for target in &targets {
        let owner = owner_of(&admin, target).await.unwrap();
        assert_eq!(local.get(target), Some(&vec![owner.clone()]), "target {target}");
    }

    let polling = eventually!({
        let mut ok = true;
        for worker in &workers {
            for target in worker.worker.owned_targets().await {
                ok &= worker.engine.is_polling(&target).await;
            }
        }
        ok
    });
    assert!(polling);
}

#[tokio::test]
async fn test_expired_owner_target_is_reclaimed() {
    let service = InMemoryCoordinationService::new();
    let admin = admin(&service);
    let w1 = spawn_worker(&service, "w1", None).await;
    let w2 = spawn_worker(&service, "w2", None).await;
    admin
        .register_target("jvm-1", None, br#"{"host":"db1"}"#.to_vec())
        .await
        .unwrap();

    assert!(eventually!(owner_of(&admin, "jvm-1").await.is_some()));
    let first = owner_of(&admin, "jvm-1").await.unwrap();
    let (owner, other) = if first == "w1" { (&w1, &w2) } else { (&w2, &w1) };
    assert!(eventually!(owner.engine.is_polling("jvm-1").await));

    owner.client.expire();
    assert!(eventually!(
        owner_of(&admin, "jvm-1").await.as_deref() == Some(other.alias.as_str())
    ));
    assert!(eventually!(other.engine.is_polling("jvm-1").await));
    assert!(eventually!(!owner.owns("jvm-1").await));
    assert!(eventually!(!owner.engine.is_polling("jvm-1").await));
    assert_ne!(owner.worker.health().status(), HealthStatus::Healthy);

    // 过期的Worker以新会话重新加入，但不抢回目标
    owner.client.reconnect();
    assert!(eventually!(
        owner.worker.health().status() == HealthStatus::Healthy
    ));
    assert!(eventually!(admin
        .live_workers()
        .await
        .unwrap()
        .iter()
        .any(|w| w.alias == owner.alias)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        owner_of(&admin, "jvm-1").await.as_deref(),
        Some(other.alias.as_str())
    );
    assert!(!owner.owns("jvm-1").await);
}

#[tokio::test]
async fn test_affinity_restricts_ownership() {
    let service = InMemoryCoordinationService::new();
    let admin = admin(&service);
    admin
        .register_target("jvm-2", Some("prod"), br#"{"host":"db2"}"#.to_vec())
        .await
        .unwrap();

    // 记录每次创建owner节点时的所有者
    let observer = service.connect();
    let (tx, mut rx) = mpsc::unbounded_channel();
    observer
        .watch_node("/jmxtrans/jvms/jvm-2/owner", tx)
        .await
        .unwrap();

    let w1 = spawn_worker(&service, "w1", Some("dev")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(owner_of(&admin, "jvm-2").await, None);
    assert!(!w1.owns("jvm-2").await);

    let w2 = spawn_worker(&service, "w2", Some("prod")).await;
    assert!(eventually!(owner_of(&admin, "jvm-2").await.as_deref() == Some("w2")));
    assert!(eventually!(w2.engine.is_polling("jvm-2").await));

    let mut creations = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind == WatchEventKind::NodeCreated {
            creations += 1;
        }
    }
    assert_eq!(creations, 1);
    assert!(w1.engine.calls().await.is_empty());
}

#[tokio::test]
async fn test_affinity_change_moves_target() {
    let service = InMemoryCoordinationService::new();
    let admin = admin(&service);
    admin
        .register_target("jvm-1", None, b"{}".to_vec())
        .await
        .unwrap();
    let w1 = spawn_worker(&service, "w1", None).await;
    assert!(eventually!(w1.owns("jvm-1").await));
    let w2 = spawn_worker(&service, "w2", Some("prod")).await;

    admin.set_affinity("jvm-1", Some("prod")).await.unwrap();
    assert!(eventually!(owner_of(&admin, "jvm-1").await.as_deref() == Some("w2")));
    assert!(eventually!(!w1.engine.is_polling("jvm-1").await));
    assert!(eventually!(w2.engine.is_polling("jvm-1").await));
}

#[tokio::test]
async fn test_graceful_shutdown_hands_over() {
    let service = InMemoryCoordinationService::new();
    let admin = admin(&service);
    admin
        .register_target("jvm-1", None, b"{}".to_vec())
        .await
        .unwrap();
    let w1 = spawn_worker(&service, "w1", None).await;
    assert!(eventually!(w1.owns("jvm-1").await));
    let w2 = spawn_worker(&service, "w2", None).await;

    w1.worker.stop().await.unwrap();
    assert_eq!(
        w1.engine.calls_for("jvm-1").await.last(),
        Some(&EngineCall::Stop {
            target: "jvm-1".to_string()
        })
    );
    assert!(!w1.worker.health().status().is_serving());

    assert!(eventually!(owner_of(&admin, "jvm-1").await.as_deref() == Some("w2")));
    let live: BTreeSet<String> = admin
        .live_workers()
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.alias)
        .collect();
    assert_eq!(live, BTreeSet::from(["w2".to_string()]));
    assert!(eventually!(w2.engine.is_polling("jvm-1").await));
}

#[tokio::test]
async fn test_disconnect_keeps_ownership() {
    let service = InMemoryCoordinationService::new();
    let admin = admin(&service);
    admin
        .register_target("jvm-1", None, b"{}".to_vec())
        .await
        .unwrap();
    let w1 = spawn_worker_with_cooldown(&service, "w1", None, Duration::ZERO).await;
    assert!(eventually!(w1.engine.is_polling("jvm-1").await));

    w1.client.disconnect();
    assert!(eventually!(matches!(
        w1.worker.health().status(),
        HealthStatus::Degraded { .. }
    )));
    assert!(w1.worker.elector().is_suspended());

    w1.client.reconnect();
    assert!(eventually!(
        w1.worker.health().status() == HealthStatus::Healthy
    ));
    assert!(w1.owns("jvm-1").await);
    assert_eq!(
        w1.engine.calls_for("jvm-1").await,
        vec![EngineCall::Start {
            target: "jvm-1".to_string(),
            version: 0
        }]
    );
}

#[tokio::test]
async fn test_prolonged_session_loss_reports_unhealthy() {
    let service = InMemoryCoordinationService::new();
    let w1 = spawn_worker(&service, "w1", None).await;
    assert!(eventually!(
        w1.worker.health().status() == HealthStatus::Healthy
    ));

    w1.client.expire();
    assert!(eventually!(matches!(
        w1.worker.health().status(),
        HealthStatus::Unhealthy { .. }
    )));
    // 会话仍未恢复，后续同步不会把状态降回降级
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!w1.worker.health().status().is_serving());

    w1.client.reconnect();
    assert!(eventually!(
        w1.worker.health().status() == HealthStatus::Healthy
    ));
    assert!(w1.worker.registrar().is_registered().await);
}

#[tokio::test]
async fn test_stop_interrupts_registration_retries() {
    let service = InMemoryCoordinationService::new();
    let w1 = spawn_worker(&service, "w1", None).await;

    // 新会话刚建立就断开，注册会一直重试
    w1.client.expire();
    w1.client.reconnect();
    w1.client.disconnect();

    let stopped = tokio::time::timeout(Duration::from_secs(3), w1.worker.stop()).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert!(!w1.worker.health().status().is_serving());
}

#[tokio::test]
async fn test_duplicate_worker_alias_fails() {
    let service = InMemoryCoordinationService::new();
    let _w1 = spawn_worker(&service, "w1", None).await;

    let client = service.connect();
    let duplicate = jmx_cluster_worker::ClusterWorker::builder(
        "w1".to_string(),
        client,
        common::paths(),
    )
    .build()
    .unwrap();
    duplicate.start().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), duplicate.join())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(jmx_cluster_core::ClusterError::DuplicateWorker { .. })
    ));
    assert!(!duplicate.health().status().is_serving());
}
