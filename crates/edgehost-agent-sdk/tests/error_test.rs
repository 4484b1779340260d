// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error type tests for edgehost-agent-sdk.

use edgehost_agent_sdk::SdkError;

#[test]
fn test_timeout_error_display() {
    let err = SdkError::Timeout(5000);
    assert!(err.to_string().contains("timed out"));
    assert!(err.to_string().contains("5000"));
}

#[test]
fn test_server_error_display() {
    let err = SdkError::Server {
        status: 500,
        message: "Internal error".to_string(),
    };
    let display = err.to_string();
    assert!(display.contains("server error"));
    assert!(display.contains("500"));
    assert!(display.contains("Internal error"));
}

#[test]
fn test_not_found_error_display() {
    let err = SdkError::NotFound("worker w1".to_string());
    assert!(err.to_string().contains("not found"));
    assert!(err.to_string().contains("w1"));
}

#[test]
fn test_from_serde_json_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: SdkError = json_err.into();
    assert!(matches!(err, SdkError::Serialization(_)));
}

#[test]
fn test_error_is_debug() {
    let err = SdkError::Unauthorized("bad token".to_string());
    let debug = format!("{:?}", err);
    assert!(debug.contains("Unauthorized"));
}
