// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binding declaration carried in `WorkerRecord::template`.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The bindings a worker declares, one list per extension type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerDeclaration {
    /// Project name.
    pub name: String,
    /// Declaration version.
    pub version: String,
    /// Runtime extensions, looked up by name.
    pub extensions: Vec<ExtensionBinding>,
    /// AI proxy bindings.
    pub ai: Vec<AiBinding>,
    /// PostgreSQL bindings.
    pub pgsql: Vec<SqlBinding>,
    /// MySQL bindings.
    pub mysql: Vec<SqlBinding>,
    /// Object storage bindings.
    pub oss: Vec<OssBinding>,
    /// Key-value store bindings.
    pub kv: Vec<KvBinding>,
    /// Static asset bindings.
    pub assets: Vec<AssetsBinding>,
    /// Background task bindings.
    pub task: Vec<TaskBinding>,
    /// Names of peer workers reachable as service bindings.
    pub services: Vec<String>,
    /// Runtime compatibility flags.
    pub compatibility_flags: Vec<String>,
    /// Cron triggers for the worker's `scheduled` handler.
    pub schedulers: Vec<SchedulerEntry>,
    /// Plain-text vars exposed as one JSON binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<serde_json::Value>,
}

impl WorkerDeclaration {
    /// Declaration used when none, or an unreadable one, is available.
    pub fn fallback() -> Self {
        Self {
            name: "default".to_string(),
            version: "0.0.1".to_string(),
            ..Default::default()
        }
    }

    /// Parse a declaration, falling back to [`WorkerDeclaration::fallback`] when the
    /// text is empty or malformed.
    pub fn parse_or_default(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::fallback();
        }
        match serde_json::from_str(text) {
            Ok(declaration) => declaration,
            Err(e) => {
                warn!(error = %e, "Unreadable binding declaration, using default");
                Self::fallback()
            }
        }
    }
}

/// Binding name, defaulting to the extension type.
pub fn binding_name<'a>(binding: &'a str, kind: &'a str) -> &'a str {
    if binding.is_empty() { kind } else { binding }
}

/// One cron trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerEntry {
    /// Label used in logs.
    pub name: String,
    /// Cron expression, five or six fields.
    pub cron: String,
}

/// A generic runtime extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionBinding {
    /// Extension type name.
    pub name: String,
    /// Binding name.
    pub binding: String,
}

/// AI proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiBinding {
    /// Model name.
    pub model: String,
    /// Provider API key.
    pub api_key: String,
    /// Provider base URL.
    pub base_url: String,
    /// Binding name.
    pub binding: String,
}

/// Relational database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlBinding {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub database: String,
    /// Binding name.
    pub binding: String,
    /// Managed resource backing this binding, if any.
    pub resource_id: String,
    /// Migration directory.
    pub migrate: String,
}

/// Object storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OssBinding {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Access key id.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
    /// Binding name.
    pub binding: String,
    /// Bucket name.
    pub bucket: String,
    /// Whether to use TLS.
    pub use_ssl: bool,
    /// Region.
    pub region: String,
    /// Managed resource backing this binding, if any.
    pub resource_id: String,
    /// Session token.
    pub session_token: String,
}

/// Key-value store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvBinding {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Binding name.
    pub binding: String,
    /// Managed resource backing this binding, if any.
    pub resource_id: String,
    /// Store provider.
    pub provider: String,
}

/// Static assets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsBinding {
    /// Binding name.
    pub binding: String,
    /// Directory served.
    pub directory: String,
}

/// Background task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskBinding {
    /// Binding name.
    pub binding: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_malformed_fall_back() {
        assert_eq!(WorkerDeclaration::parse_or_default(""), WorkerDeclaration::fallback());
        assert_eq!(
            WorkerDeclaration::parse_or_default("{not json"),
            WorkerDeclaration::fallback()
        );
    }

    #[test]
    fn test_partial_declaration_fills_defaults() {
        let declaration = WorkerDeclaration::parse_or_default(
            r#"{"pgsql":[{"resource_id":"db1"}],"services":["billing"]}"#,
        );
        assert_eq!(declaration.pgsql.len(), 1);
        assert_eq!(declaration.pgsql[0].resource_id, "db1");
        assert_eq!(declaration.pgsql[0].port, 0);
        assert_eq!(declaration.services, vec!["billing"]);
        assert!(declaration.vars.is_none());
    }

    #[test]
    fn test_binding_name_defaults_to_kind() {
        assert_eq!(binding_name("", "kv"), "kv");
        assert_eq!(binding_name("CACHE", "kv"), "CACHE");
    }
}
