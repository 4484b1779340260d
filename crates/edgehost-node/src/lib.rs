// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! edgehost-node - Multi-tenant Serverless Worker Host
//!
//! This crate runs user-supplied JavaScript workers inside a sandbox runtime
//! (one `workerd` process per worker). It generates each worker's sandbox
//! configuration, supervises the processes, collects their output and keeps a
//! fleet of nodes in agreement about which worker runs where.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Master node                                  │
//! │  ┌────────────┐  ┌────────────┐  ┌─────────────┐  ┌────────────────┐  │
//! │  │  /api/*    │  │  /agent/*  │  │  Template   │  │   PostgreSQL   │  │
//! │  │  admin     │  │  registry  │  │  enricher   │  │ workers, nodes │  │
//! │  └─────┬──────┘  └─────┬──────┘  └─────────────┘  │ resources, logs│  │
//! │        │ notify        │ sync / get-worker /      └────────────────┘  │
//! │        │ (push)        │ fill-worker-config / logs (pull)              │
//! └────────┼───────────────┼──────────────────────────────────────────────┘
//!          ▼               │
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           Agent node                                  │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────────┐  ┌─────────────┐   │
//! │  │ Registrar  │  │ Reconciler  │  │   Config     │  │ LogBatcher  │   │
//! │  │ (register, │─►│ (diff, push │─►│  Generator   │  │ (1000 queue,│   │
//! │  │  sync tick)│  │  events)    │  │              │  │  100 / 2s)  │   │
//! │  └────────────┘  └──────┬──────┘  └──────┬───────┘  └──────▲──────┘   │
//! │                         ▼                ▼                 │          │
//! │                 ┌─────────────────────────────────┐        │          │
//! │                 │        ProcessSupervisor        │────────┘          │
//! │                 │ workerd serve <uid>/workerd.capnp│ stdout/stderr    │
//! │                 └─────────────────────────────────┘                   │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The master also runs workers of its own; it is an agent that happens to
//! hold the authoritative worker set.
//!
//! # HTTP surface
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /agent/notify` | Push event: add, delete, flush or sync workers |
//! | `POST /agent/sync` | `{uid, version}` of the caller's workers (master) |
//! | `POST /agent/add` | Register the calling node (master) |
//! | `GET /agent/nodeinfo` | Registration of the calling node (master) |
//! | `POST /agent/get-worker` | Full worker record (master) |
//! | `POST /agent/fill-worker-config` | Enriched binding declaration (master) |
//! | `POST /agent/logs` | Forwarded worker output (master) |
//! | `POST /agent/sync-now` | Run one pull reconciliation (agents) |
//! | `/api/workers...` | Worker create, update, delete, flush and status |
//! | `GET /health` | Liveness, no auth |
//!
//! # Worker Process State Machine
//!
//! ```text
//!            start
//!   (none) ────────► STARTING ──spawned──► RUNNING
//!                       ▲                     │ exit
//!                       └──── restart delay ──┘
//!
//!   stop (any state) ──► STOPPING ──► STOPPED (slot removed)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `EDGEHOST_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `EDGEHOST_CLUSTER_SECRET` | Yes | - | Secret node tokens derive from |
//! | `EDGEHOST_NODE_NAME` | No | `default` | Name of this node |
//! | `EDGEHOST_API_PORT` | No | `8888` | HTTP listen port |
//! | `EDGEHOST_ADVERTISE_ENDPOINT` | No | `http://127.0.0.1:<port>` | URL peers reach this node at |
//! | `EDGEHOST_MASTER_ENDPOINT` | No | - | Master URL; unset makes this node the master |
//! | `EDGEHOST_WORKER_DIR` | No | `.data/workerd` | Root of the worker layout |
//! | `EDGEHOST_RUNTIME_BIN` | No | `workerd` | Sandbox runtime binary |
//! | `EDGEHOST_RUNTIME_ARGS` | No | - | Extra runtime arguments |
//! | `EDGEHOST_WORKER_HOST` | No | `localhost` | Host worker sockets bind to |
//! | `EDGEHOST_PORT_RANGE` | No | `20000-30000` | Worker port pool |
//! | `EDGEHOST_RESTART_DELAY_MS` | No | `3000` | Respawn delay |
//! | `EDGEHOST_SYNC_INTERVAL_SECS` | No | `30` | Agent register/sync period |
//! | `EDGEHOST_AUTO_SYNC` | No | `true` | Pull reconciliation on each tick |
//!
//! # Modules
//!
//! - [`config`]: Node configuration from environment variables
//! - [`store`]: Worker, node, resource and log persistence
//! - [`supervisor`]: One restarted runtime process per worker
//! - [`scheduler`]: Cron triggers posted to worker control sockets
//! - [`log_batcher`]: Bounded batching of worker output
//! - [`config_gen`]: Sandbox configuration generation
//! - [`lifecycle`]: Worker create, update, delete and flush
//! - [`reconcile`]: Push events and pull reconciliation
//! - [`server`]: HTTP surface
//! - [`runtime`]: Embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Database migrations for edgehost-node.
///
/// ```ignore
/// use edgehost_node::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Node configuration loaded from environment variables.
pub mod config;

/// Error types for node operations.
pub mod error;

/// Worker, node, resource and log persistence.
pub mod store;

/// Worker port allocation.
pub mod ports;

/// On-disk layout of worker code, configuration and shims.
pub mod artifacts;

/// Batching of worker output into the log sink.
pub mod log_batcher;

/// Supervision of one sandbox runtime process per worker.
pub mod supervisor;

/// Cron triggers for worker `scheduled` handlers.
pub mod scheduler;

/// Sandbox configuration generation from binding declarations.
pub mod config_gen;

/// Worker create, update, delete and flush.
pub mod lifecycle;

/// Push event dispatch and pull reconciliation against the master.
pub mod reconcile;

/// Transport-independent request handlers.
pub mod handlers;

/// HTTP server.
pub mod server;

/// Background registration and sync loop of agents.
pub mod registrar;

/// Embeddable runtime for edgehost-node.
pub mod runtime;

pub use config::Config;
pub use error::Error;
