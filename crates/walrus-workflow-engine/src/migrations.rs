// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for walrus-workflow-engine.
//!
//! Both schemas are embedded at compile time. Embedding applications can run
//! them programmatically before building the engine.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use walrus_workflow_engine::migrations;
//!
//! let pool = SqlitePool::connect("sqlite::memory:").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with the engine schema embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

/// SQLite migrator with the engine schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations.
///
/// Applied versions are recorded in `_sqlx_migrations` and skipped on rerun.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations.
///
/// Applied versions are recorded in `_sqlx_migrations` and skipped on rerun.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
