// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Push event dispatch.
//!
//! Events arriving on `/agent/notify` are routed through a static name to
//! handler table. Worker-carrying events are checked against the
//! [`VersionLedger`](super::VersionLedger) first; a version this node has
//! already moved past is ignored.

use std::sync::Arc;

use edgehost_agent_sdk::{NotifyEventRequest, WorkerEvent};
use futures::future::BoxFuture;
use tracing::{debug, info};

use super::Reconciler;
use crate::error::{Error, Result};
use crate::lifecycle::WorkerLifecycle;

/// What event handlers act on.
#[derive(Clone)]
pub struct EventContext {
    /// Lifecycle of this node's workers.
    pub lifecycle: Arc<WorkerLifecycle>,
    /// Pull reconciler; `None` on the master.
    pub reconciler: Option<Arc<Reconciler>>,
}

type EventHandler = for<'a> fn(&'a EventContext, &'a NotifyEventRequest) -> BoxFuture<'a, Result<()>>;

static HANDLERS: &[(WorkerEvent, EventHandler)] = &[
    (WorkerEvent::AddWorker, on_add_worker as EventHandler),
    (WorkerEvent::DeleteWorker, on_delete_worker as EventHandler),
    (WorkerEvent::FlushWorker, on_flush_worker as EventHandler),
    (WorkerEvent::SyncWorkers, on_sync_workers as EventHandler),
];

/// Validate and handle one event.
pub async fn dispatch(ctx: &EventContext, request: &NotifyEventRequest) -> Result<()> {
    request.validate()?;

    let handler = HANDLERS
        .iter()
        .find(|(event, _)| event.as_str() == request.event_name)
        .map(|(_, handler)| handler)
        .ok_or_else(|| Error::InvalidRequest(format!("unknown event: {}", request.event_name)))?;

    debug!(event = %request.event_name, "Dispatching notify event");
    handler(ctx, request).await
}

fn on_add_worker<'a>(ctx: &'a EventContext, request: &'a NotifyEventRequest) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let worker = request.worker()?;
        if ctx.lifecycle.ledger().is_retired(&worker.uid, &worker.version) {
            info!(worker_uid = %worker.uid, version = %worker.version, "Ignoring add-worker for a superseded version");
            return Ok(());
        }
        ctx.lifecycle.apply_resync(worker).await
    })
}

fn on_delete_worker<'a>(ctx: &'a EventContext, request: &'a NotifyEventRequest) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let worker = request.worker()?;
        if ctx.lifecycle.ledger().is_stale_delete(&worker.uid, &worker.version) {
            info!(worker_uid = %worker.uid, version = %worker.version, "Ignoring delete-worker for a superseded version");
            return Ok(());
        }
        ctx.lifecycle.remove_local(&worker.uid).await
    })
}

fn on_flush_worker<'a>(ctx: &'a EventContext, request: &'a NotifyEventRequest) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let worker = request.worker()?;
        let ledger = ctx.lifecycle.ledger();
        if ledger.is_retired(&worker.uid, &worker.version) {
            info!(worker_uid = %worker.uid, version = %worker.version, "Ignoring flush-worker for a superseded version");
            return Ok(());
        }
        if ledger.current(&worker.uid).as_deref() == Some(worker.version.as_str()) {
            ctx.lifecycle.flush_local(&worker.uid).await
        } else {
            ctx.lifecycle.apply_resync(worker).await
        }
    })
}

fn on_sync_workers<'a>(ctx: &'a EventContext, _request: &'a NotifyEventRequest) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let reconciler = ctx
            .reconciler
            .as_ref()
            .ok_or_else(|| Error::InvalidRequest("sync-workers is only handled by agents".to_string()))?;
        reconciler.sync_once().await.map(|_| ())
    })
}
