// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgehost-node.

use thiserror::Error;

/// Node errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A call to another node failed.
    #[error("Peer error: {0}")]
    Sdk(#[from] edgehost_agent_sdk::SdkError),

    /// A worker archive could not be read.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Rendering the sandbox configuration failed.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Worker was not found.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Node was not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A node with this name is already registered.
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// A worker with this name already exists.
    #[error("Worker name already in use: {0}")]
    WorkerNameTaken(String),

    /// No port is left in the configured range.
    #[error("Port range exhausted")]
    PortsExhausted,

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Some workers of a reconciliation batch failed.
    #[error("Reconciliation finished with {failed} failed worker(s)")]
    PartialFailure {
        /// Number of workers that could not be reconciled.
        failed: usize,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using node Error.
pub type Result<T> = std::result::Result<T, Error>;
