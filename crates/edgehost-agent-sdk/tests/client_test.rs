// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentClient tests against a mock node.

use edgehost_agent_sdk::auth::{self, HEADER_NODE_NAME, HEADER_NODE_SECRET};
use edgehost_agent_sdk::types::paths;
use edgehost_agent_sdk::{
    AgentClient, ClientConfig, NotifyEventRequest, SdkError, WorkerEvent, WorkerRecord,
    WorkerUidVersion,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> AgentClient {
    AgentClient::new(ClientConfig::new("edge-1", "cluster-secret")).unwrap()
}

fn token() -> String {
    auth::node_token("edge-1", "cluster-secret")
}

// ============================================================================
// Authentication headers
// ============================================================================

#[tokio::test]
async fn test_every_call_carries_node_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::SYNC))
        .and(header(HEADER_NODE_NAME, "edge-1"))
        .and(header(HEADER_NODE_SECRET, token().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "msg": "ok",
            "data": {"worker_uid_versions": [{"uid": "a", "version": "2"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let workers = client().sync_workers(&server.uri()).await.unwrap();
    assert_eq!(workers, vec![WorkerUidVersion::new("a", "2")]);
}

#[tokio::test]
async fn test_unauthorized_maps_to_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::SYNC))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"code": 401, "msg": "bad token"})),
        )
        .mount(&server)
        .await;

    let err = client().sync_workers(&server.uri()).await.unwrap_err();
    match err {
        SdkError::Unauthorized(msg) => assert_eq!(msg, "bad token"),
        other => panic!("expected Unauthorized, got {:?}", other),
    }
}

// ============================================================================
// Notify
// ============================================================================

#[tokio::test]
async fn test_notify_posts_event() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::NOTIFY))
        .and(body_partial_json(json!({"event_name": "sync-workers"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 200, "msg": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    client()
        .notify(&server.uri(), &NotifyEventRequest::new(WorkerEvent::SyncWorkers))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_notify_rejects_invalid_event_locally() {
    let server = MockServer::start().await;

    let err = client()
        .notify(&server.uri(), &NotifyEventRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::InvalidInput(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_server_error_carries_status_and_plain_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::NOTIFY))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = client()
        .notify(&server.uri(), &NotifyEventRequest::new(WorkerEvent::SyncWorkers))
        .await
        .unwrap_err();

    match err {
        SdkError::Server { status, message } => {
            assert_eq!(status, 502);
            assert_eq!(message, "bad gateway");
        }
        other => panic!("expected Server, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_node_is_connection_error() {
    // Port 9 (discard) on localhost is closed in test environments.
    let err = client()
        .notify(
            "http://127.0.0.1:9",
            &NotifyEventRequest::new(WorkerEvent::SyncWorkers),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::Connection(_)));
}

// ============================================================================
// Worker and node lookups
// ============================================================================

#[tokio::test]
async fn test_get_worker_returns_first_record() {
    let server = MockServer::start().await;
    let worker = WorkerRecord {
        uid: "w1".to_string(),
        name: "hello".to_string(),
        node_name: "edge-1".to_string(),
        version: "7".to_string(),
        ..Default::default()
    };

    Mock::given(method("POST"))
        .and(path(paths::GET_WORKER))
        .and(body_partial_json(json!({"uid": "w1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200, "msg": "ok", "data": [worker]
        })))
        .mount(&server)
        .await;

    let fetched = client().get_worker(&server.uri(), "w1").await.unwrap();
    assert_eq!(fetched, worker);
}

#[tokio::test]
async fn test_get_worker_empty_list_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::GET_WORKER))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 200, "msg": "ok", "data": []})),
        )
        .mount(&server)
        .await;

    let err = client().get_worker(&server.uri(), "w1").await.unwrap_err();
    assert!(matches!(err, SdkError::NotFound(_)));
}

#[tokio::test]
async fn test_node_info_not_found_is_none() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(paths::NODE_INFO))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"code": 404, "msg": "not found"})),
        )
        .mount(&server)
        .await;

    assert!(client().node_info(&server.uri()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_add_node_sends_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::ADD_NODE))
        .and(body_partial_json(json!({"endpoint": "http://10.0.0.2:8888"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "msg": "ok",
            "data": {
                "uid": "n1",
                "name": "edge-1",
                "endpoint": "http://10.0.0.2:8888",
                "created_at": "2025-01-01T00:00:00Z"
            }
        })))
        .mount(&server)
        .await;

    let node = client()
        .add_node(&server.uri(), "http://10.0.0.2:8888")
        .await
        .unwrap();
    assert_eq!(node.name, "edge-1");
    assert_eq!(node.uid, "n1");
}

#[tokio::test]
async fn test_fill_worker_config_returns_template() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(paths::FILL_WORKER_CONFIG))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200, "msg": "ok", "data": {"new_template": "{\"pgsql\":[]}"}
        })))
        .mount(&server)
        .await;

    let template = client()
        .fill_worker_config(&server.uri(), "w1")
        .await
        .unwrap();
    assert_eq!(template, "{\"pgsql\":[]}");
}
