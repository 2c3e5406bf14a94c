// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for walrus-workflow-engine.
//!
//! The engine owns workflow definitions, the execution hierarchy, subjects
//! and issued token digests. Structured values (status, attributes,
//! variables, trigger) are stored as JSON text so both backends share one
//! row shape.

pub mod postgres;
mod rows;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walrus_workflow::model::{
    Attributes, Subject, Workflow, WorkflowExecution, WorkflowStageExecution,
    WorkflowStepExecution,
};

use crate::error::Result;

/// Issued access token, stored by digest only.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRecord {
    /// Token ID.
    pub id: String,
    /// Subject the token acts as.
    pub subject_id: i64,
    /// Token kind, e.g. `deployment`.
    pub kind: String,
    /// Token name, unique per issue.
    pub name: String,
    /// Hex encoded SHA-256 of the token value.
    pub value_hash: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub create_time: DateTime<Utc>,
}

/// Storage operations used by the engine.
///
/// Loaded executions carry their stages and steps sorted by `order`.
/// `update_*` methods persist the mutable fields of one record and fail with
/// `NotFound` when the row is gone. Step status and step attributes are
/// written separately: the syncer owns the former, approval votes the latter.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create a subject, or return the existing one with the same name.
    async fn create_subject(&self, name: &str) -> Result<Subject>;

    /// Get a subject by ID.
    async fn get_subject(&self, id: i64) -> Result<Option<Subject>>;

    /// Insert a workflow with its stages and steps. IDs are assigned here.
    async fn create_workflow(&self, workflow: &Workflow) -> Result<Workflow>;

    /// Get a workflow with its stages and steps.
    async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>>;

    /// Insert an execution hierarchy and advance the workflow version.
    ///
    /// Runs in one transaction. The workflow row must still carry
    /// `expected_version`, otherwise nothing is written and `Conflict` is
    /// returned.
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: i64,
    ) -> Result<WorkflowExecution>;

    /// Get an execution with its stage and step executions.
    async fn get_execution(&self, id: i64) -> Result<Option<WorkflowExecution>>;

    /// Get a stage execution with its step executions.
    async fn get_stage_execution(&self, id: i64) -> Result<Option<WorkflowStageExecution>>;

    /// Get a step execution.
    async fn get_step_execution(&self, id: i64) -> Result<Option<WorkflowStepExecution>>;

    /// Persist the mutable fields of an execution.
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Persist the mutable fields of a stage execution.
    async fn update_stage_execution(&self, stage: &WorkflowStageExecution) -> Result<()>;

    /// Persist status, timing, attempt counter and record of a step execution.
    async fn update_step_status(&self, step: &WorkflowStepExecution) -> Result<()>;

    /// Persist the attributes of a step execution, nothing else.
    async fn update_step_attributes(&self, id: i64, attributes: &Attributes) -> Result<()>;

    /// Record the runner object that drives the execution.
    async fn set_runner_object(&self, execution_id: i64, name: &str) -> Result<()>;

    /// Persist an execution and every loaded descendant in one transaction,
    /// including the execution's runner object and step attributes.
    async fn reset_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Store an issued token.
    async fn insert_token(&self, token: &TokenRecord) -> Result<()>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool>;
}
