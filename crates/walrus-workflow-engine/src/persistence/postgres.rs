// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool};
use walrus_workflow::model::{
    Attributes, Subject, Workflow, WorkflowExecution, WorkflowStageExecution,
    WorkflowStepExecution,
};

use crate::error::{Error, Result};
use crate::migrations;

use super::rows::{
    ExecutionRow, StageExecutionRow, StageRow, StepExecutionRow, StepRow, SubjectRow, WorkflowRow,
    assemble_stage_executions, assemble_stages, optional_json, to_json,
};
use super::{Persistence, TokenRecord};

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn update_execution_row<'e, E: PgExecutor<'e>>(
    executor: E,
    execution: &WorkflowExecution,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_executions
        SET status = $1, execute_time = $2, duration = $3, times = $4
        WHERE id = $5
        "#,
    )
    .bind(to_json(&execution.status)?)
    .bind(execution.execute_time)
    .bind(execution.duration)
    .bind(execution.times)
    .bind(execution.id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

async fn update_stage_row<'e, E: PgExecutor<'e>>(
    executor: E,
    stage: &WorkflowStageExecution,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_stage_executions
        SET status = $1, execute_time = $2, duration = $3
        WHERE id = $4
        "#,
    )
    .bind(to_json(&stage.status)?)
    .bind(stage.execute_time)
    .bind(stage.duration)
    .bind(stage.id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

async fn update_step_row<'e, E: PgExecutor<'e>>(
    executor: E,
    step: &WorkflowStepExecution,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_step_executions
        SET status = $1, execute_time = $2, duration = $3, times = $4, record = $5
        WHERE id = $6
        "#,
    )
    .bind(to_json(&step.status)?)
    .bind(step.execute_time)
    .bind(step.duration)
    .bind(step.times)
    .bind(&step.record)
    .bind(step.id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

async fn update_step_attributes_row<'e, E: PgExecutor<'e>>(
    executor: E,
    id: i64,
    attributes: &Attributes,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_step_executions SET attributes = $1 WHERE id = $2",
    )
    .bind(to_json(attributes)?)
    .bind(id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

async fn set_runner_object_row<'e, E: PgExecutor<'e>>(
    executor: E,
    execution_id: i64,
    name: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_executions SET runner_object = $1 WHERE id = $2",
    )
    .bind(name)
    .bind(execution_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

fn expect_row(affected: u64, what: &str, id: i64) -> Result<()> {
    if affected == 0 {
        return Err(Error::NotFound(format!("{what} {id}")));
    }
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_subject(&self, name: &str) -> Result<Subject> {
        sqlx::query(
            r#"
            INSERT INTO subjects (name) VALUES ($1)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, SubjectRow>("SELECT id, name FROM subjects WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn get_subject(&self, id: i64) -> Result<Option<Subject>> {
        let row = sqlx::query_as::<_, SubjectRow>("SELECT id, name FROM subjects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Subject::from))
    }

    async fn create_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let mut created = workflow.clone();
        let mut tx = self.pool.begin().await?;

        created.id = sqlx::query_scalar(
            r#"
            INSERT INTO workflows
                (name, description, project_id, environment_id, workflow_type,
                 parallelism, timeout, version, variables)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.project_id)
        .bind(workflow.environment_id)
        .bind(workflow.workflow_type.as_str())
        .bind(workflow.parallelism)
        .bind(workflow.timeout)
        .bind(workflow.version)
        .bind(to_json(&workflow.variables)?)
        .fetch_one(&mut *tx)
        .await?;

        for stage in &mut created.stages {
            stage.workflow_id = created.id;
            stage.project_id = created.project_id;
            stage.id = sqlx::query_scalar(
                r#"
                INSERT INTO workflow_stages
                    (workflow_id, project_id, name, stage_order, dependencies)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id
                "#,
            )
            .bind(stage.workflow_id)
            .bind(stage.project_id)
            .bind(&stage.name)
            .bind(stage.order)
            .bind(to_json(&stage.dependencies)?)
            .fetch_one(&mut *tx)
            .await?;

            for step in &mut stage.steps {
                step.workflow_id = created.id;
                step.workflow_stage_id = stage.id;
                step.project_id = created.project_id;
                step.id = sqlx::query_scalar(
                    r#"
                    INSERT INTO workflow_steps
                        (workflow_id, workflow_stage_id, project_id, name, step_type,
                         attributes, retry_strategy, timeout, step_order, dependencies)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    RETURNING id
                    "#,
                )
                .bind(step.workflow_id)
                .bind(step.workflow_stage_id)
                .bind(step.project_id)
                .bind(&step.name)
                .bind(&step.step_type)
                .bind(to_json(&step.attributes)?)
                .bind(optional_json(&step.retry_strategy)?)
                .bind(step.timeout)
                .bind(step.order)
                .bind(to_json(&step.dependencies)?)
                .fetch_one(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>> {
        let Some(row) = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, description, project_id, environment_id, workflow_type,
                   parallelism, timeout, version, variables
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let stages = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, workflow_id, project_id, name, stage_order, dependencies
            FROM workflow_stages
            WHERE workflow_id = $1
            ORDER BY stage_order, id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let steps = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, workflow_id, workflow_stage_id, project_id, name, step_type,
                   attributes, retry_strategy, timeout, step_order, dependencies
            FROM workflow_steps
            WHERE workflow_id = $1
            ORDER BY step_order, id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(row.into_model(assemble_stages(stages, steps)?)?))
    }

    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: i64,
    ) -> Result<WorkflowExecution> {
        let mut created = execution.clone();
        let mut tx = self.pool.begin().await?;

        let guard = sqlx::query(
            r#"
            UPDATE workflows
            SET version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(execution.workflow_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if guard.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "workflow {} is no longer at version {}",
                execution.workflow_id, expected_version
            )));
        }

        created.id = sqlx::query_scalar(
            r#"
            INSERT INTO workflow_executions
                (name, description, project_id, workflow_id, subject_id, version, times,
                 parallelism, timeout, trigger, status, execute_time, duration, create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(&created.name)
        .bind(&created.description)
        .bind(created.project_id)
        .bind(created.workflow_id)
        .bind(created.subject_id)
        .bind(created.version)
        .bind(created.times)
        .bind(created.parallelism)
        .bind(created.timeout)
        .bind(to_json(&created.trigger)?)
        .bind(to_json(&created.status)?)
        .bind(created.execute_time)
        .bind(created.duration)
        .bind(created.create_time)
        .fetch_one(&mut *tx)
        .await?;

        for stage in &mut created.stages {
            stage.workflow_execution_id = created.id;
            stage.id = sqlx::query_scalar(
                r#"
                INSERT INTO workflow_stage_executions
                    (name, project_id, workflow_id, workflow_stage_id, workflow_execution_id,
                     stage_order, status, execute_time, duration, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                "#,
            )
            .bind(&stage.name)
            .bind(stage.project_id)
            .bind(stage.workflow_id)
            .bind(stage.workflow_stage_id)
            .bind(stage.workflow_execution_id)
            .bind(stage.order)
            .bind(to_json(&stage.status)?)
            .bind(stage.execute_time)
            .bind(stage.duration)
            .bind(stage.create_time)
            .fetch_one(&mut *tx)
            .await?;

            for step in &mut stage.steps {
                step.workflow_execution_id = created.id;
                step.workflow_stage_execution_id = stage.id;
                step.id = sqlx::query_scalar(
                    r#"
                    INSERT INTO workflow_step_executions
                        (name, step_type, step_order, project_id, workflow_id, workflow_step_id,
                         workflow_execution_id, workflow_stage_execution_id, attributes, record,
                         times, timeout, retry_strategy, status, execute_time, duration,
                         create_time)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                    RETURNING id
                    "#,
                )
                .bind(&step.name)
                .bind(&step.step_type)
                .bind(step.order)
                .bind(step.project_id)
                .bind(step.workflow_id)
                .bind(step.workflow_step_id)
                .bind(step.workflow_execution_id)
                .bind(step.workflow_stage_execution_id)
                .bind(to_json(&step.attributes)?)
                .bind(&step.record)
                .bind(step.times)
                .bind(step.timeout)
                .bind(optional_json(&step.retry_strategy)?)
                .bind(to_json(&step.status)?)
                .bind(step.execute_time)
                .bind(step.duration)
                .bind(step.create_time)
                .fetch_one(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_execution(&self, id: i64) -> Result<Option<WorkflowExecution>> {
        let Some(row) = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, name, description, project_id, workflow_id, subject_id, version, times,
                   parallelism, timeout, trigger, status, execute_time, duration,
                   runner_object, create_time
            FROM workflow_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let stages = sqlx::query_as::<_, StageExecutionRow>(
            r#"
            SELECT id, name, project_id, workflow_id, workflow_stage_id, workflow_execution_id,
                   stage_order, status, execute_time, duration, create_time
            FROM workflow_stage_executions
            WHERE workflow_execution_id = $1
            ORDER BY stage_order, id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let steps = sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT id, name, step_type, step_order, project_id, workflow_id, workflow_step_id,
                   workflow_execution_id, workflow_stage_execution_id, attributes, record,
                   times, timeout, retry_strategy, status, execute_time, duration, create_time
            FROM workflow_step_executions
            WHERE workflow_execution_id = $1
            ORDER BY step_order, id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(
            row.into_model(assemble_stage_executions(stages, steps)?)?,
        ))
    }

    async fn get_stage_execution(&self, id: i64) -> Result<Option<WorkflowStageExecution>> {
        let Some(row) = sqlx::query_as::<_, StageExecutionRow>(
            r#"
            SELECT id, name, project_id, workflow_id, workflow_stage_id, workflow_execution_id,
                   stage_order, status, execute_time, duration, create_time
            FROM workflow_stage_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let steps = sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT id, name, step_type, step_order, project_id, workflow_id, workflow_step_id,
                   workflow_execution_id, workflow_stage_execution_id, attributes, record,
                   times, timeout, retry_strategy, status, execute_time, duration, create_time
            FROM workflow_step_executions
            WHERE workflow_stage_execution_id = $1
            ORDER BY step_order, id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StepExecutionRow::into_model)
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(row.into_model(steps)?))
    }

    async fn get_step_execution(&self, id: i64) -> Result<Option<WorkflowStepExecution>> {
        sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT id, name, step_type, step_order, project_id, workflow_id, workflow_step_id,
                   workflow_execution_id, workflow_stage_execution_id, attributes, record,
                   times, timeout, retry_strategy, status, execute_time, duration, create_time
            FROM workflow_step_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(StepExecutionRow::into_model)
        .transpose()
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let affected = update_execution_row(&self.pool, execution).await?;
        expect_row(affected, "workflow execution", execution.id)
    }

    async fn update_stage_execution(&self, stage: &WorkflowStageExecution) -> Result<()> {
        let affected = update_stage_row(&self.pool, stage).await?;
        expect_row(affected, "workflow stage execution", stage.id)
    }

    async fn update_step_status(&self, step: &WorkflowStepExecution) -> Result<()> {
        let affected = update_step_row(&self.pool, step).await?;
        expect_row(affected, "workflow step execution", step.id)
    }

    async fn update_step_attributes(&self, id: i64, attributes: &Attributes) -> Result<()> {
        let affected = update_step_attributes_row(&self.pool, id, attributes).await?;
        expect_row(affected, "workflow step execution", id)
    }

    async fn set_runner_object(&self, execution_id: i64, name: &str) -> Result<()> {
        let affected = set_runner_object_row(&self.pool, execution_id, Some(name)).await?;
        expect_row(affected, "workflow execution", execution_id)
    }

    async fn reset_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let affected = update_execution_row(&mut *tx, execution).await?;
        expect_row(affected, "workflow execution", execution.id)?;
        set_runner_object_row(&mut *tx, execution.id, execution.runner_object.as_deref()).await?;

        for stage in &execution.stages {
            let affected = update_stage_row(&mut *tx, stage).await?;
            expect_row(affected, "workflow stage execution", stage.id)?;

            for step in &stage.steps {
                let affected = update_step_row(&mut *tx, step).await?;
                expect_row(affected, "workflow step execution", step.id)?;
                update_step_attributes_row(&mut *tx, step.id, &step.attributes).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (id, subject_id, kind, name, value_hash, expires_at, create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&token.id)
        .bind(token.subject_id)
        .bind(&token.kind)
        .bind(&token.name)
        .bind(&token.value_hash)
        .bind(token.expires_at)
        .bind(token.create_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
