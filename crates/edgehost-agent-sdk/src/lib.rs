// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! edgehost Agent SDK
//!
//! Client and wire types for the node-to-node RPC surface of an edgehost cluster.
//!
//! Every node (master or agent) exposes the same `/agent/*` endpoints. The master
//! uses them to push worker events to the node that owns a worker; agents use them
//! to pull the authoritative worker set, register themselves and forward logs.
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST | `/agent/notify` | push an event (`add-worker`, `delete-worker`, `flush-worker`, `sync-workers`) |
//! | POST | `/agent/sync` | list `{uid, version}` pairs owned by the calling node |
//! | POST | `/agent/add` | register the calling node |
//! | GET | `/agent/nodeinfo` | fetch the calling node's registration |
//! | POST | `/agent/get-worker` | fetch one worker record |
//! | POST | `/agent/fill-worker-config` | fetch a binding declaration with secrets injected |
//! | POST | `/agent/logs` | forward a batch of worker log lines |
//!
//! Every request carries the caller's node name and a token derived from the
//! node name and the shared cluster secret (see [`auth`]).
//!
//! # Example
//!
//! ```no_run
//! use edgehost_agent_sdk::{AgentClient, ClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AgentClient::new(ClientConfig::new("edge-1", "cluster-secret"))?;
//!
//! let owned = client.sync_workers("http://master:8888").await?;
//! for worker in owned {
//!     println!("{} @ {}", worker.uid, worker.version);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod client;
mod config;
mod error;
pub mod types;

pub use client::AgentClient;
pub use config::ClientConfig;
pub use error::{Result, SdkError};
pub use types::{
    Envelope, FillWorkerConfigRequest, FillWorkerConfigResponse, GetWorkerRequest, LogStream,
    NodeInfo, NotifyEventRequest, PushLogsRequest, RegisterNodeRequest, SyncWorkersResponse,
    WorkerEvent, WorkerLogRecord, WorkerRecord, WorkerUidVersion,
};
