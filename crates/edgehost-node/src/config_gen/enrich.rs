// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filling binding declarations with managed resource credentials.
//!
//! Only the master knows resource credentials and worker secrets. Agents ask it
//! for the enriched declaration through `/agent/fill-worker-config`; the master
//! itself enriches in-process.

use std::sync::Arc;

use async_trait::async_trait;
use edgehost_agent_sdk::{AgentClient, WorkerRecord};
use serde_json::Value;
use tracing::{debug, warn};

use super::declaration::WorkerDeclaration;
use crate::error::Result;
use crate::store::{ResourceCredentials, ResourceStore};

/// Provider name stamped onto managed key-value bindings.
pub const DEFAULT_KV_PROVIDER: &str = "redis";

/// Where the enriched declaration of a worker comes from.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// The worker's declaration with resource credentials filled in.
    async fn fill_worker_config(&self, worker: &WorkerRecord) -> Result<String>;
}

/// Asks the master.
pub struct RemoteTemplateSource {
    client: AgentClient,
    master: String,
}

impl RemoteTemplateSource {
    /// Source calling `master` with `client`.
    pub fn new(client: AgentClient, master: impl Into<String>) -> Self {
        Self {
            client,
            master: master.into(),
        }
    }
}

#[async_trait]
impl TemplateSource for RemoteTemplateSource {
    async fn fill_worker_config(&self, worker: &WorkerRecord) -> Result<String> {
        Ok(self
            .client
            .fill_worker_config(&self.master, &worker.uid)
            .await?)
    }
}

/// Enriches declarations from the resource store.
pub struct TemplateEnricher {
    resources: Arc<dyn ResourceStore>,
    kv_provider: String,
}

impl TemplateEnricher {
    /// Enricher backed by `resources`.
    pub fn new(resources: Arc<dyn ResourceStore>) -> Self {
        Self {
            resources,
            kv_provider: DEFAULT_KV_PROVIDER.to_string(),
        }
    }

    /// Override the key-value provider name.
    pub fn with_kv_provider(mut self, provider: impl Into<String>) -> Self {
        self.kv_provider = provider.into();
        self
    }

    /// Return `worker.template` with managed resource credentials and worker
    /// secrets merged in.
    ///
    /// A binding naming an unknown resource keeps its own values and has its
    /// `resource_id` cleared. An unreadable declaration is returned untouched.
    pub async fn enrich(&self, worker: &WorkerRecord) -> Result<String> {
        let mut declaration: WorkerDeclaration = match serde_json::from_str(&worker.template) {
            Ok(declaration) => declaration,
            Err(e) => {
                warn!(worker_uid = %worker.uid, error = %e, "Declaration not enrichable, returning as stored");
                return Ok(worker.template.clone());
            }
        };

        for (kind, bindings) in [("pgsql", &mut declaration.pgsql), ("mysql", &mut declaration.mysql)] {
            for sql in bindings.iter_mut() {
                if sql.resource_id.is_empty() {
                    continue;
                }
                match self.resources.get_resource(kind, &sql.resource_id).await? {
                    Some(creds) => {
                        overlay(&creds, "database", &mut sql.database);
                        overlay(&creds, "user", &mut sql.user);
                        overlay(&creds, "password", &mut sql.password);
                    }
                    None => clear_resource(&worker.uid, kind, &mut sql.resource_id),
                }
            }
        }

        for kv in declaration.kv.iter_mut() {
            if kv.resource_id.is_empty() {
                continue;
            }
            match self.resources.get_resource("kv", &kv.resource_id).await? {
                Some(_) => kv.provider = self.kv_provider.clone(),
                None => clear_resource(&worker.uid, "kv", &mut kv.resource_id),
            }
        }

        for oss in declaration.oss.iter_mut() {
            if oss.resource_id.is_empty() {
                continue;
            }
            match self.resources.get_resource("oss", &oss.resource_id).await? {
                Some(creds) => {
                    overlay(&creds, "bucket", &mut oss.bucket);
                    overlay(&creds, "region", &mut oss.region);
                    overlay(&creds, "access_key_id", &mut oss.access_key_id);
                    overlay(&creds, "access_key_secret", &mut oss.access_key_secret);
                }
                None => clear_resource(&worker.uid, "oss", &mut oss.resource_id),
            }
        }

        let secrets = self.resources.worker_secrets(&worker.uid).await?;
        if !secrets.is_empty() {
            let mut vars = match declaration.vars.take() {
                Some(Value::Object(map)) => map,
                Some(_) => {
                    warn!(worker_uid = %worker.uid, "Declared vars are not an object, replacing with secrets");
                    serde_json::Map::new()
                }
                None => serde_json::Map::new(),
            };
            for (key, value) in secrets {
                vars.insert(key, Value::String(value));
            }
            declaration.vars = Some(Value::Object(vars));
        }

        debug!(worker_uid = %worker.uid, "Enriched binding declaration");
        Ok(serde_json::to_string(&declaration)?)
    }
}

#[async_trait]
impl TemplateSource for TemplateEnricher {
    async fn fill_worker_config(&self, worker: &WorkerRecord) -> Result<String> {
        self.enrich(worker).await
    }
}

fn overlay(creds: &ResourceCredentials, key: &str, target: &mut String) {
    if let Some(Value::String(value)) = creds.get(key) {
        *target = value.clone();
    }
}

fn clear_resource(worker_uid: &str, kind: &str, resource_id: &mut String) {
    warn!(
        worker_uid = %worker_uid,
        kind = %kind,
        resource_id = %resource_id,
        "Resource not found, clearing resource_id"
    );
    resource_id.clear();
}
