// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the agent client.

use std::time::Duration;

use crate::error::{Result, SdkError};

/// Configuration for the [`AgentClient`](crate::AgentClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name of the calling node, sent with every request.
    pub node_name: String,
    /// Shared cluster secret used to derive the node token.
    pub cluster_secret: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with default timeouts.
    pub fn new(node_name: impl Into<String>, cluster_secret: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            cluster_secret: cluster_secret.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EDGEHOST_NODE_NAME`: Node name (default: "default")
    /// - `EDGEHOST_CLUSTER_SECRET`: Shared cluster secret (required)
    /// - `EDGEHOST_CONNECT_TIMEOUT_MS`: Connection timeout in milliseconds (default: 5000)
    /// - `EDGEHOST_REQUEST_TIMEOUT_MS`: Request timeout in milliseconds (default: 30000)
    pub fn from_env() -> Result<Self> {
        let node_name =
            std::env::var("EDGEHOST_NODE_NAME").unwrap_or_else(|_| "default".to_string());

        let cluster_secret = std::env::var("EDGEHOST_CLUSTER_SECRET")
            .map_err(|_| SdkError::Config("EDGEHOST_CLUSTER_SECRET is not set".to_string()))?;

        let connect_timeout_ms: u64 = std::env::var("EDGEHOST_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid EDGEHOST_CONNECT_TIMEOUT_MS: {}", e)))?;

        let request_timeout_ms: u64 = std::env::var("EDGEHOST_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid EDGEHOST_REQUEST_TIMEOUT_MS: {}", e)))?;

        Ok(Self {
            node_name,
            cluster_secret,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
        })
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
