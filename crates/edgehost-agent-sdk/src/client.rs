// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AgentClient for node-to-node calls.

use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::auth::{self, HEADER_NODE_NAME, HEADER_NODE_SECRET};
use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::types::{
    Envelope, FillWorkerConfigRequest, FillWorkerConfigResponse, GetWorkerRequest, NodeInfo,
    NotifyEventRequest, PushLogsRequest, RegisterNodeRequest, SyncWorkersResponse,
    WorkerLogRecord, WorkerRecord, WorkerUidVersion, paths,
};

/// Authenticated HTTP client for the `/agent/*` surface of another node.
///
/// The client is cheap to clone and holds no per-target state: every call takes the
/// base URL of the node it talks to, so one client serves the master (pushing to
/// many agents) as well as an agent (pulling from its master).
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    config: ClientConfig,
    token: String,
}

impl AgentClient {
    /// Create a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {}", e)))?;

        let token = auth::node_token(&config.node_name, &config.cluster_secret);

        Ok(Self {
            http,
            config,
            token,
        })
    }

    /// Create a client from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Name of the node this client speaks for.
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(HEADER_NODE_NAME, &self.config.node_name)
            .header(HEADER_NODE_SECRET, &self.token)
    }

    fn transport_error(&self, err: reqwest::Error) -> SdkError {
        if err.is_timeout() {
            SdkError::Timeout(self.config.request_timeout.as_millis() as u64)
        } else {
            SdkError::Connection(err.to_string())
        }
    }

    async fn post<B, T>(&self, endpoint: &str, path: &str, body: &B) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.authed(self.http.post(Self::url(endpoint, path))).json(body);
        self.send(request).await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, path: &str) -> Result<Option<T>> {
        let request = self.authed(self.http.get(Self::url(endpoint, path)));
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            let envelope: Envelope<T> = Envelope::from_slice(&body).map_err(|e| {
                SdkError::UnexpectedResponse(format!("invalid response envelope: {}", e))
            })?;
            return Ok(envelope.data);
        }

        // Error bodies are usually an envelope, but proxies in between may answer
        // with plain text.
        let message = Envelope::<serde_json::Value>::from_slice(&body)
            .map(|e| e.msg)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SdkError::Unauthorized(message),
            StatusCode::NOT_FOUND => SdkError::NotFound(message),
            _ => SdkError::Server {
                status: status.as_u16(),
                message,
            },
        })
    }

    // =========================================================================
    // Push path
    // =========================================================================

    /// Deliver a worker event to the node at `endpoint`.
    #[instrument(skip(self, event), fields(event = %event.event_name))]
    pub async fn notify(&self, endpoint: &str, event: &NotifyEventRequest) -> Result<()> {
        event.validate()?;
        debug!(endpoint, "Sending notify event");
        let _: Option<serde_json::Value> = self.post(endpoint, paths::NOTIFY, event).await?;
        Ok(())
    }

    // =========================================================================
    // Pull path
    // =========================================================================

    /// Fetch the `{uid, version}` set the master assigns to this node.
    #[instrument(skip(self))]
    pub async fn sync_workers(&self, master: &str) -> Result<Vec<WorkerUidVersion>> {
        let data: Option<SyncWorkersResponse> = self
            .post(master, paths::SYNC, &serde_json::json!({}))
            .await?;
        Ok(data.unwrap_or_default().worker_uid_versions)
    }

    /// Fetch the full record of one worker from the master.
    #[instrument(skip(self))]
    pub async fn get_worker(&self, master: &str, uid: &str) -> Result<WorkerRecord> {
        let data: Option<Vec<WorkerRecord>> = self
            .post(
                master,
                paths::GET_WORKER,
                &GetWorkerRequest {
                    uid: uid.to_string(),
                },
            )
            .await?;

        data.and_then(|workers| workers.into_iter().next())
            .ok_or_else(|| SdkError::NotFound(format!("worker {}", uid)))
    }

    /// Fetch the binding declaration of a worker with resource secrets injected.
    #[instrument(skip(self))]
    pub async fn fill_worker_config(&self, master: &str, uid: &str) -> Result<String> {
        let data: Option<FillWorkerConfigResponse> = self
            .post(
                master,
                paths::FILL_WORKER_CONFIG,
                &FillWorkerConfigRequest {
                    uid: uid.to_string(),
                },
            )
            .await?;

        data.map(|d| d.new_template).ok_or_else(|| {
            SdkError::UnexpectedResponse("fill-worker-config returned no data".to_string())
        })
    }

    // =========================================================================
    // Node registry
    // =========================================================================

    /// Register this node with the master.
    #[instrument(skip(self))]
    pub async fn add_node(&self, master: &str, advertised_endpoint: &str) -> Result<NodeInfo> {
        let data: Option<NodeInfo> = self
            .post(
                master,
                paths::ADD_NODE,
                &RegisterNodeRequest {
                    endpoint: advertised_endpoint.to_string(),
                },
            )
            .await?;

        data.ok_or_else(|| SdkError::UnexpectedResponse("add returned no node".to_string()))
    }

    /// Fetch this node's registration, `None` if the master does not know it.
    #[instrument(skip(self))]
    pub async fn node_info(&self, master: &str) -> Result<Option<NodeInfo>> {
        match self.get(master, paths::NODE_INFO).await {
            Ok(data) => Ok(data),
            Err(SdkError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Logs
    // =========================================================================

    /// Forward a batch of log lines to the master.
    pub async fn push_logs(&self, master: &str, logs: &[WorkerLogRecord]) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .post(
                master,
                paths::LOGS,
                &PushLogsRequest {
                    logs: logs.to_vec(),
                },
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("node_name", &self.config.node_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        assert_eq!(
            AgentClient::url("http://master:8888/", paths::SYNC),
            "http://master:8888/agent/sync"
        );
        assert_eq!(
            AgentClient::url("http://master:8888", paths::NOTIFY),
            "http://master:8888/agent/notify"
        );
    }

    #[test]
    fn test_client_precomputes_token() {
        let client = AgentClient::new(ClientConfig::new("edge-1", "secret")).unwrap();
        assert_eq!(client.token, auth::node_token("edge-1", "secret"));
        assert_eq!(client.node_name(), "edge-1");
    }
}
