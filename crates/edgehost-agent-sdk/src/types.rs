// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types shared by every node of the cluster.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

/// Paths of the node-to-node endpoints.
pub mod paths {
    /// Push a worker event to the owning node.
    pub const NOTIFY: &str = "/agent/notify";
    /// Pull the `{uid, version}` set owned by the caller.
    pub const SYNC: &str = "/agent/sync";
    /// Register the calling node.
    pub const ADD_NODE: &str = "/agent/add";
    /// Fetch the calling node's registration.
    pub const NODE_INFO: &str = "/agent/nodeinfo";
    /// Fetch one worker record.
    pub const GET_WORKER: &str = "/agent/get-worker";
    /// Fetch a binding declaration with secrets injected.
    pub const FILL_WORKER_CONFIG: &str = "/agent/fill-worker-config";
    /// Forward worker log lines to the master.
    pub const LOGS: &str = "/agent/logs";
}

/// Payload key under which a serialized [`WorkerRecord`] travels in a notify event.
pub const KEY_WORKER_PROTO: &str = "worker_proto";

/// Maximum length of a notify event name.
pub const MAX_EVENT_NAME_LEN: usize = 64;

/// Desired state of one worker, as persisted by the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Immutable identity.
    pub uid: String,
    /// Fleet-unique display name.
    pub name: String,
    /// Node that runs this worker.
    pub node_name: String,
    /// Opaque change marker, compared for equality only.
    pub version: String,
    /// Entry module file name.
    #[serde(default)]
    pub entry: String,
    /// Inline source of the entry module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Packaged archive holding the worker's code, exclusive with `code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_version_id: Option<String>,
    /// Serialized binding declaration (JSON).
    #[serde(default)]
    pub template: String,
    /// Port of the worker's control socket.
    #[serde(default)]
    pub control_port: u16,
    /// Tunnel identifier.
    #[serde(default)]
    pub tunnel_id: String,
}

impl WorkerRecord {
    /// `{uid, version}` pair used by diff reconciliation.
    pub fn uid_version(&self) -> WorkerUidVersion {
        WorkerUidVersion {
            uid: self.uid.clone(),
            version: self.version.clone(),
        }
    }

    /// Whether `node_name` is the node that runs this worker.
    pub fn is_owned_by(&self, node_name: &str) -> bool {
        self.node_name == node_name
    }
}

/// `{uid, version}` pair exchanged during pull reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerUidVersion {
    /// Worker UID.
    pub uid: String,
    /// Worker version.
    pub version: String,
}

impl WorkerUidVersion {
    /// Create a pair.
    pub fn new(uid: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            version: version.into(),
        }
    }
}

/// A registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node UID, assigned at registration.
    pub uid: String,
    /// Unique node name.
    pub name: String,
    /// Base URL peers use to reach the node.
    pub endpoint: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Output stream a log line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl LogStream {
    /// Stream name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(SdkError::InvalidInput(format!("unknown log stream: {}", other))),
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLogRecord {
    /// Per-line identifier.
    pub uid: String,
    /// Worker the line belongs to.
    pub worker_uid: String,
    /// The line, without its terminator.
    pub output: String,
    /// Stream the line was read from.
    pub stream: LogStream,
    /// When the line was read.
    pub time: DateTime<Utc>,
}

/// Known push events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Run a pull reconciliation.
    SyncWorkers,
    /// Create the carried worker locally.
    AddWorker,
    /// Delete the carried worker locally.
    DeleteWorker,
    /// Redeploy the carried worker locally.
    FlushWorker,
}

impl WorkerEvent {
    /// Every known event.
    pub const ALL: [WorkerEvent; 4] = [
        WorkerEvent::SyncWorkers,
        WorkerEvent::AddWorker,
        WorkerEvent::DeleteWorker,
        WorkerEvent::FlushWorker,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerEvent::SyncWorkers => "sync-workers",
            WorkerEvent::AddWorker => "add-worker",
            WorkerEvent::DeleteWorker => "delete-worker",
            WorkerEvent::FlushWorker => "flush-worker",
        }
    }
}

impl std::fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /agent/notify`.
///
/// Payload values are raw bytes, carried as base64 strings in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEventRequest {
    /// Event name, one of [`WorkerEvent::as_str`].
    pub event_name: String,
    /// Event payload.
    #[serde(default, with = "base64_map")]
    pub extra: BTreeMap<String, Vec<u8>>,
}

impl NotifyEventRequest {
    /// Create an event without payload.
    pub fn new(event: WorkerEvent) -> Self {
        Self {
            event_name: event.as_str().to_string(),
            extra: BTreeMap::new(),
        }
    }

    /// Create an event carrying a worker record.
    pub fn with_worker(event: WorkerEvent, worker: &WorkerRecord) -> Result<Self> {
        let mut request = Self::new(event);
        request
            .extra
            .insert(KEY_WORKER_PROTO.to_string(), serde_json::to_vec(worker)?);
        Ok(request)
    }

    /// Check the event name is present and bounded.
    pub fn validate(&self) -> Result<()> {
        if self.event_name.is_empty() {
            return Err(SdkError::InvalidInput("event_name is required".to_string()));
        }
        if self.event_name.len() > MAX_EVENT_NAME_LEN {
            return Err(SdkError::InvalidInput(format!(
                "event_name longer than {} characters",
                MAX_EVENT_NAME_LEN
            )));
        }
        Ok(())
    }

    /// Decode the carried worker record.
    pub fn worker(&self) -> Result<WorkerRecord> {
        let bytes = self.extra.get(KEY_WORKER_PROTO).ok_or_else(|| {
            SdkError::InvalidInput(format!("event payload has no {}", KEY_WORKER_PROTO))
        })?;
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Response envelope used by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Status code mirrored from HTTP.
    pub code: u16,
    /// Short human readable message.
    pub msg: String,
    /// Response payload.
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Successful envelope.
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    /// Error envelope without payload.
    pub fn error(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse an envelope from a response body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Response data of `POST /agent/sync`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWorkersResponse {
    /// Workers owned by the calling node.
    pub worker_uid_versions: Vec<WorkerUidVersion>,
}

/// Body of `POST /agent/add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    /// Base URL the master should use to reach the caller.
    pub endpoint: String,
}

/// Body of `POST /agent/get-worker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetWorkerRequest {
    /// Worker UID.
    pub uid: String,
}

/// Body of `POST /agent/fill-worker-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillWorkerConfigRequest {
    /// Worker UID.
    pub uid: String,
}

/// Response data of `POST /agent/fill-worker-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillWorkerConfigResponse {
    /// Binding declaration with secrets injected.
    pub new_template: String,
}

/// Body of `POST /agent/logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushLogsRequest {
    /// Lines to persist.
    pub logs: Vec<WorkerLogRecord>,
}

mod base64_map {
    use std::collections::BTreeMap;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, String> = map
            .iter()
            .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded: Option<BTreeMap<String, String>> = Option::deserialize(deserializer)?;
        encoded
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
