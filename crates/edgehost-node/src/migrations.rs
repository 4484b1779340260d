// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for edgehost-node.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use edgehost_node::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all node migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run PostgreSQL migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
