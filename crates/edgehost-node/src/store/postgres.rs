// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgehost_agent_sdk::{NodeInfo, WorkerLogRecord, WorkerRecord};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::{LogSink, NodeStore, ResourceCredentials, ResourceStore, WorkerStore};
use crate::error::{Error, Result};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    uid: String,
    name: String,
    node_name: String,
    version: String,
    entry: String,
    code: Option<String>,
    active_version_id: Option<String>,
    template: String,
    control_port: i32,
    tunnel_id: String,
}

impl From<WorkerRow> for WorkerRecord {
    fn from(row: WorkerRow) -> Self {
        WorkerRecord {
            uid: row.uid,
            name: row.name,
            node_name: row.node_name,
            version: row.version,
            entry: row.entry,
            code: row.code,
            active_version_id: row.active_version_id,
            template: row.template,
            control_port: u16::try_from(row.control_port).unwrap_or_default(),
            tunnel_id: row.tunnel_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    uid: String,
    name: String,
    endpoint: String,
    created_at: DateTime<Utc>,
}

impl From<NodeRow> for NodeInfo {
    fn from(row: NodeRow) -> Self {
        NodeInfo {
            uid: row.uid,
            name: row.name,
            endpoint: row.endpoint,
            created_at: row.created_at,
        }
    }
}

const WORKER_COLUMNS: &str = "uid, name, node_name, version, entry, code, active_version_id, \
                              template, control_port, tunnel_id";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

// ============================================================================
// Workers
// ============================================================================

#[async_trait]
impl WorkerStore for PgStore {
    async fn get_worker(&self, uid: &str) -> Result<Option<WorkerRecord>> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {} FROM workers WHERE uid = $1",
            WORKER_COLUMNS
        ))
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_worker_by_name(&self, name: &str) -> Result<Option<WorkerRecord>> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {} FROM workers WHERE name = $1",
            WORKER_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_workers_by_node(&self, node_name: &str) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {} FROM workers WHERE node_name = $1 ORDER BY uid",
            WORKER_COLUMNS
        ))
        .bind(node_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO workers (uid, name, node_name, version, entry, code, active_version_id,
                                 template, control_port, tunnel_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (uid) DO UPDATE
            SET name = EXCLUDED.name,
                node_name = EXCLUDED.node_name,
                version = EXCLUDED.version,
                entry = EXCLUDED.entry,
                code = EXCLUDED.code,
                active_version_id = EXCLUDED.active_version_id,
                template = EXCLUDED.template,
                control_port = EXCLUDED.control_port,
                tunnel_id = EXCLUDED.tunnel_id,
                updated_at = NOW()
            "#,
        )
        .bind(&worker.uid)
        .bind(&worker.name)
        .bind(&worker.node_name)
        .bind(&worker.version)
        .bind(&worker.entry)
        .bind(&worker.code)
        .bind(&worker.active_version_id)
        .bind(&worker.template)
        .bind(i32::from(worker.control_port))
        .bind(&worker.tunnel_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::WorkerNameTaken(worker.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_worker(&self, uid: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_archive(
        &self,
        version_id: &str,
        worker_uid: &str,
        archive: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_versions (id, worker_uid, archive, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE
            SET archive = EXCLUDED.archive
            "#,
        )
        .bind(version_id)
        .bind(worker_uid)
        .bind(archive)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_archive(&self, version_id: &str) -> Result<Option<Vec<u8>>> {
        let archive: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT archive FROM worker_versions WHERE id = $1")
                .bind(version_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(archive)
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[async_trait]
impl NodeStore for PgStore {
    async fn register_node(&self, node: &NodeInfo) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO nodes (uid, name, endpoint, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&node.uid)
        .bind(&node.name)
        .bind(&node.endpoint)
        .bind(node.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::NodeExists(node.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        let row = sqlx::query_as::<_, NodeRow>(
            "SELECT uid, name, endpoint, created_at FROM nodes WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT uid, name, endpoint, created_at FROM nodes ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// Resources
// ============================================================================

#[async_trait]
impl ResourceStore for PgStore {
    async fn get_resource(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceCredentials>> {
        let credentials: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT credentials FROM resources WHERE kind = $1 AND resource_id = $2",
        )
        .bind(kind)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(credentials.and_then(|value| match value {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }))
    }

    async fn worker_secrets(&self, worker_uid: &str) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM worker_secrets WHERE worker_uid = $1")
                .bind(worker_uid)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().collect())
    }
}

// ============================================================================
// Logs
// ============================================================================

#[async_trait]
impl LogSink for PgStore {
    async fn insert_logs(&self, logs: &[WorkerLogRecord]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO worker_logs (uid, worker_uid, output, stream, time) ");
        builder.push_values(logs, |mut row, log| {
            row.push_bind(&log.uid)
                .push_bind(&log.worker_uid)
                .push_bind(&log.output)
                .push_bind(log.stream.as_str())
                .push_bind(log.time);
        });
        builder.build().execute(&self.pool).await?;

        Ok(())
    }
}
