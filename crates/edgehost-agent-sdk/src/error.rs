// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgehost-agent-sdk.

use thiserror::Error;

/// Result type using SdkError.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Errors that can occur when talking to another node.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote node could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Request timed out.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Remote node rejected the request.
    #[error("server error [{status}]: {message}")]
    Server {
        /// HTTP status returned by the remote node.
        status: u16,
        /// Message from the response envelope, or the raw body.
        message: String,
    },

    /// The remote node rejected our node token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Requested object does not exist on the remote node.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected response from the remote node.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for SdkError {
    fn from(err: base64::DecodeError) -> Self {
        SdkError::Serialization(err.to_string())
    }
}
