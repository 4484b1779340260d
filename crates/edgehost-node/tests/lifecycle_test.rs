// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for worker create, update, delete and flush.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{TestNode, process_alive, wait_for};
use edgehost_agent_sdk::{NodeInfo, NotifyEventRequest, WorkerEvent, WorkerRecord};
use edgehost_node::error::Error;
use edgehost_node::ports::{PortAllocator, control_key};
use edgehost_node::store::{NodeStore, WorkerStore};
use edgehost_node::supervisor::WorkerStatus;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn worker(name: &str, node_name: &str) -> WorkerRecord {
    WorkerRecord {
        name: name.to_string(),
        node_name: node_name.to_string(),
        ..Default::default()
    }
}

async fn register(node: &TestNode, name: &str, endpoint: &str) {
    node.store
        .register_node(&NodeInfo {
            uid: format!("{}-uid", name),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

async fn notify_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/agent/notify"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"code": 200, "msg": "ok", "data": null})),
        )
        .mount(server)
        .await;
}

async fn received_events(server: &MockServer, expected: usize) -> Vec<NotifyEventRequest> {
    for _ in 0..100 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= expected {
            return requests
                .iter()
                .map(|r| serde_json::from_slice(&r.body).unwrap())
                .collect();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Vec::new()
}

// ============================================================================
// Local workers
// ============================================================================

#[tokio::test]
async fn test_create_local_worker_end_to_end() {
    let node = TestNode::master();

    let created = node
        .lifecycle
        .create(worker("hello", ""), None)
        .await
        .unwrap();

    assert_eq!(created.node_name, "master");
    assert_eq!(created.entry, "entry.js");
    assert!(!created.uid.is_empty());
    assert!(!created.version.is_empty());
    assert_ne!(created.control_port, 0);

    let config = tokio::fs::read_to_string(node.artifacts.config_path(&created.uid))
        .await
        .unwrap();
    assert!(config.contains(&created.uid));
    assert!(config.contains("compatibilityDate = \"2025-05-08\""));

    let entry = tokio::fs::read_to_string(node.artifacts.code_dir(&created.uid).join("entry.js"))
        .await
        .unwrap();
    assert!(entry.contains("is online!"));

    assert!(node.wait_running(&created.uid).await);
    assert_eq!(node.lifecycle.status(&created.uid), WorkerStatus::Running);
    assert_eq!(
        node.ledger.current(&created.uid).as_deref(),
        Some(created.version.as_str())
    );

    let stored = node.store.get_worker(&created.uid).await.unwrap().unwrap();
    assert_eq!(stored, created);

    node.shutdown().await;
}

#[tokio::test]
async fn test_create_name_collision_falls_back() {
    let node = TestNode::master();

    let first = node.lifecycle.create(worker("api", ""), None).await.unwrap();
    let second = node.lifecycle.create(worker("api", ""), None).await.unwrap();

    assert_eq!(first.name, "api");
    assert_eq!(second.name, format!("worker-{}", &second.uid[..8]));

    node.shutdown().await;
}

#[tokio::test]
async fn test_delete_local_worker_cleans_up() {
    let node = TestNode::master();
    let created = node.lifecycle.create(worker("gone", ""), None).await.unwrap();
    assert!(node.wait_running(&created.uid).await);
    let pid = node.supervisor.pid(&created.uid).unwrap();

    node.lifecycle.delete(&created.uid).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || !process_alive(pid)).await);
    assert_eq!(node.lifecycle.status(&created.uid), WorkerStatus::NotRunning);
    assert!(node.store.get_worker(&created.uid).await.unwrap().is_none());
    assert!(!node.artifacts.worker_dir(&created.uid).exists());
    assert!(node.ports.get_port(&created.uid).await.is_none());
    assert!(node.ports.get_port(&control_key(&created.uid)).await.is_none());
    assert!(node.ledger.is_retired(&created.uid, &created.version));
}

#[tokio::test]
async fn test_delete_unknown_worker() {
    let node = TestNode::master();
    let result = node.lifecycle.delete("missing").await;
    assert!(matches!(result, Err(Error::WorkerNotFound(_))));
}

#[tokio::test]
async fn test_update_replaces_definition_and_keeps_uid() {
    let node = TestNode::master();
    let created = node.lifecycle.create(worker("svc", ""), None).await.unwrap();
    assert!(node.wait_running(&created.uid).await);

    let patch = WorkerRecord {
        code: Some("export default { fetch() { return new Response('v2') } }".to_string()),
        ..Default::default()
    };
    let updated = node
        .lifecycle
        .update(&created.uid, patch, None)
        .await
        .unwrap();

    assert_eq!(updated.uid, created.uid);
    assert_eq!(updated.name, "svc");
    assert_ne!(updated.version, created.version);
    assert!(node.wait_running(&updated.uid).await);

    let entry = tokio::fs::read_to_string(node.artifacts.code_dir(&updated.uid).join("entry.js"))
        .await
        .unwrap();
    assert!(entry.contains("v2"));
    assert!(node.ledger.is_retired(&created.uid, &created.version));

    node.shutdown().await;
}

#[tokio::test]
async fn test_failed_update_restores_previous_definition() {
    let node = TestNode::master();
    let created = node.lifecycle.create(worker("keep", ""), None).await.unwrap();
    assert!(node.wait_running(&created.uid).await);

    // An entry escaping the code directory fails the create phase.
    let patch = WorkerRecord {
        entry: "../../escape.js".to_string(),
        ..Default::default()
    };
    let result = node.lifecycle.update(&created.uid, patch, None).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));

    let stored = node.store.get_worker(&created.uid).await.unwrap().unwrap();
    assert_eq!(stored.version, created.version);
    assert_eq!(stored.entry, "entry.js");
    assert!(node.wait_running(&created.uid).await);

    node.shutdown().await;
}

#[tokio::test]
async fn test_flush_restarts_local_worker() {
    let node = TestNode::master();
    let created = node.lifecycle.create(worker("fl", ""), None).await.unwrap();
    assert!(node.wait_running(&created.uid).await);
    let before = node.supervisor.pid(&created.uid).unwrap();

    node.lifecycle.flush(&created.uid).await.unwrap();

    assert!(node.wait_running(&created.uid).await);
    let after = node.supervisor.pid(&created.uid).unwrap();
    assert_ne!(before, after);
    assert_eq!(
        node.store.get_worker(&created.uid).await.unwrap().unwrap().version,
        created.version
    );

    node.shutdown().await;
}

#[tokio::test]
async fn test_init_local_starts_assigned_workers() {
    let node = TestNode::master();
    for name in ["one", "two"] {
        node.store
            .upsert_worker(&WorkerRecord {
                uid: format!("uid-{}", name),
                name: name.to_string(),
                node_name: "master".to_string(),
                version: "v1".to_string(),
                entry: "entry.js".to_string(),
                code: Some("export default {}".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    node.lifecycle.init_local().await.unwrap();

    assert!(node.wait_running("uid-one").await);
    assert!(node.wait_running("uid-two").await);

    node.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_jobs_follow_worker_installation() {
    let node = TestNode::master();
    let declared = WorkerRecord {
        template: serde_json::json!({
            "schedulers": [
                {"name": "nightly", "cron": "0 0 3 * * *"},
                {"name": "broken", "cron": "not a cron"}
            ]
        })
        .to_string(),
        ..worker("cron", "")
    };

    let created = node.lifecycle.create(declared, None).await.unwrap();
    assert_eq!(node.scheduler.jobs(&created.uid), vec!["nightly".to_string()]);

    let patch = WorkerRecord {
        template: r#"{"schedulers":[{"name":"hourly","cron":"0 * * * *"}]}"#.to_string(),
        ..Default::default()
    };
    node.lifecycle.update(&created.uid, patch, None).await.unwrap();
    assert_eq!(node.scheduler.jobs(&created.uid), vec!["hourly".to_string()]);

    node.lifecycle.delete(&created.uid).await.unwrap();
    assert!(node.scheduler.jobs(&created.uid).is_empty());
}

// ============================================================================
// Remote workers
// ============================================================================

#[tokio::test]
async fn test_create_remote_worker_notifies_owner_once() {
    let agent = MockServer::start().await;
    notify_ok(&agent).await;

    let node = TestNode::master();
    register(&node, "edge-1", &agent.uri()).await;

    let created = node
        .lifecycle
        .create(worker("far", "edge-1"), None)
        .await
        .unwrap();

    // Nothing runs on the master for a remote worker.
    assert!(node.supervisor.supervised().is_empty());
    assert!(!node.artifacts.worker_dir(&created.uid).exists());
    assert!(node.store.get_worker(&created.uid).await.unwrap().is_some());

    let events = received_events(&agent, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agent.received_requests().await.unwrap().len(), 1);

    assert_eq!(events[0].event_name, WorkerEvent::AddWorker.as_str());
    let carried = events[0].worker().unwrap();
    assert_eq!(carried.uid, created.uid);
    assert_eq!(carried.version, created.version);
}

#[tokio::test]
async fn test_delete_remote_worker_notifies_owner() {
    let agent = MockServer::start().await;
    notify_ok(&agent).await;

    let node = TestNode::master();
    register(&node, "edge-1", &agent.uri()).await;
    let created = node.lifecycle.create(worker("far", "edge-1"), None).await.unwrap();
    received_events(&agent, 1).await;

    node.lifecycle.delete(&created.uid).await.unwrap();

    let events = received_events(&agent, 2).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_name, WorkerEvent::DeleteWorker.as_str());
    assert!(node.store.get_worker(&created.uid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_flush_remote_worker_notifies_owner_once() {
    let agent = MockServer::start().await;
    notify_ok(&agent).await;

    let node = TestNode::master();
    register(&node, "edge-1", &agent.uri()).await;
    let created = node.lifecycle.create(worker("far", "edge-1"), None).await.unwrap();
    received_events(&agent, 1).await;

    node.lifecycle.flush(&created.uid).await.unwrap();

    let events = received_events(&agent, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agent.received_requests().await.unwrap().len(), 2);
    assert_eq!(events[1].event_name, WorkerEvent::FlushWorker.as_str());
    let carried = events[1].worker().unwrap();
    assert_eq!(carried.uid, created.uid);
    assert_eq!(carried.version, created.version);
    assert!(node.supervisor.supervised().is_empty());
}

#[tokio::test]
async fn test_unregistered_owner_skips_notify() {
    let node = TestNode::master();
    let created = node
        .lifecycle
        .create(worker("orphan", "edge-9"), None)
        .await
        .unwrap();
    assert!(node.store.get_worker(&created.uid).await.unwrap().is_some());
}

#[tokio::test]
async fn test_agent_rejects_definition_writes() {
    let node = TestNode::agent("edge-1", "http://127.0.0.1:9");
    let result = node.lifecycle.create(worker("x", ""), None).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}
