// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row shapes shared by the SQL backends and their conversion to the model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use walrus_workflow::model::{
    Subject, Workflow, WorkflowExecution, WorkflowStage, WorkflowStageExecution, WorkflowStep,
    WorkflowStepExecution, WorkflowType,
};

use crate::error::{Error, Result};

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

fn from_json_opt<T: DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>> {
    match raw {
        Some(raw) if !raw.is_empty() && raw != "null" => Ok(Some(from_json(raw)?)),
        _ => Ok(None),
    }
}

pub(crate) fn optional_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(to_json).transpose()
}

fn workflow_type(raw: &str) -> Result<WorkflowType> {
    match raw {
        "default" | "" => Ok(WorkflowType::Default),
        other => Err(Error::InvalidRequest(format!(
            "unknown workflow type: {other}"
        ))),
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubjectRow {
    pub id: i64,
    pub name: String,
}

impl From<SubjectRow> for Subject {
    fn from(row: SubjectRow) -> Self {
        Subject::new(row.id, row.name)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkflowRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub project_id: i64,
    pub environment_id: Option<i64>,
    pub workflow_type: String,
    pub parallelism: i32,
    pub timeout: i32,
    pub version: i64,
    pub variables: String,
}

impl WorkflowRow {
    pub fn into_model(self, stages: Vec<WorkflowStage>) -> Result<Workflow> {
        Ok(Workflow {
            id: self.id,
            name: self.name,
            description: self.description,
            project_id: self.project_id,
            environment_id: self.environment_id,
            workflow_type: workflow_type(&self.workflow_type)?,
            parallelism: self.parallelism,
            timeout: self.timeout,
            version: self.version,
            variables: from_json(&self.variables)?,
            stages,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StageRow {
    pub id: i64,
    pub workflow_id: i64,
    pub project_id: i64,
    pub name: String,
    pub stage_order: i32,
    pub dependencies: String,
}

impl StageRow {
    fn into_model(self, steps: Vec<WorkflowStep>) -> Result<WorkflowStage> {
        Ok(WorkflowStage {
            id: self.id,
            workflow_id: self.workflow_id,
            project_id: self.project_id,
            name: self.name,
            order: self.stage_order,
            dependencies: from_json(&self.dependencies)?,
            steps,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StepRow {
    pub id: i64,
    pub workflow_id: i64,
    pub workflow_stage_id: i64,
    pub project_id: i64,
    pub name: String,
    pub step_type: String,
    pub attributes: String,
    pub retry_strategy: Option<String>,
    pub timeout: i32,
    pub step_order: i32,
    pub dependencies: String,
}

impl StepRow {
    fn into_model(self) -> Result<WorkflowStep> {
        Ok(WorkflowStep {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_stage_id: self.workflow_stage_id,
            project_id: self.project_id,
            name: self.name,
            step_type: self.step_type,
            attributes: from_json(&self.attributes)?,
            retry_strategy: from_json_opt(self.retry_strategy.as_deref())?,
            timeout: self.timeout,
            order: self.step_order,
            dependencies: from_json(&self.dependencies)?,
        })
    }
}

/// Group step rows under their stage rows. Both inputs are sorted by order.
pub(crate) fn assemble_stages(stages: Vec<StageRow>, steps: Vec<StepRow>) -> Result<Vec<WorkflowStage>> {
    let mut steps: Vec<Option<StepRow>> = steps.into_iter().map(Some).collect();
    stages
        .into_iter()
        .map(|stage| {
            let owned = steps
                .iter_mut()
                .filter(|s| matches!(s, Some(row) if row.workflow_stage_id == stage.id))
                .filter_map(Option::take)
                .map(StepRow::into_model)
                .collect::<Result<Vec<_>>>()?;
            stage.into_model(owned)
        })
        .collect()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ExecutionRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub project_id: i64,
    pub workflow_id: i64,
    pub subject_id: i64,
    pub version: i64,
    pub times: i32,
    pub parallelism: i32,
    pub timeout: i32,
    pub trigger: String,
    pub status: String,
    pub execute_time: Option<DateTime<Utc>>,
    pub duration: i64,
    pub runner_object: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl ExecutionRow {
    pub fn into_model(self, stages: Vec<WorkflowStageExecution>) -> Result<WorkflowExecution> {
        Ok(WorkflowExecution {
            id: self.id,
            name: self.name,
            description: self.description,
            project_id: self.project_id,
            workflow_id: self.workflow_id,
            subject_id: self.subject_id,
            version: self.version,
            times: self.times,
            parallelism: self.parallelism,
            timeout: self.timeout,
            trigger: from_json(&self.trigger)?,
            status: from_json(&self.status)?,
            execute_time: self.execute_time,
            duration: self.duration,
            runner_object: self.runner_object,
            create_time: self.create_time,
            stages,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StageExecutionRow {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub workflow_id: i64,
    pub workflow_stage_id: i64,
    pub workflow_execution_id: i64,
    pub stage_order: i32,
    pub status: String,
    pub execute_time: Option<DateTime<Utc>>,
    pub duration: i64,
    pub create_time: DateTime<Utc>,
}

impl StageExecutionRow {
    pub fn into_model(self, steps: Vec<WorkflowStepExecution>) -> Result<WorkflowStageExecution> {
        Ok(WorkflowStageExecution {
            id: self.id,
            name: self.name,
            project_id: self.project_id,
            workflow_id: self.workflow_id,
            workflow_stage_id: self.workflow_stage_id,
            workflow_execution_id: self.workflow_execution_id,
            order: self.stage_order,
            status: from_json(&self.status)?,
            execute_time: self.execute_time,
            duration: self.duration,
            create_time: self.create_time,
            steps,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StepExecutionRow {
    pub id: i64,
    pub name: String,
    pub step_type: String,
    pub step_order: i32,
    pub project_id: i64,
    pub workflow_id: i64,
    pub workflow_step_id: i64,
    pub workflow_execution_id: i64,
    pub workflow_stage_execution_id: i64,
    pub attributes: String,
    pub record: String,
    pub times: i32,
    pub timeout: i32,
    pub retry_strategy: Option<String>,
    pub status: String,
    pub execute_time: Option<DateTime<Utc>>,
    pub duration: i64,
    pub create_time: DateTime<Utc>,
}

impl StepExecutionRow {
    pub fn into_model(self) -> Result<WorkflowStepExecution> {
        Ok(WorkflowStepExecution {
            id: self.id,
            name: self.name,
            step_type: self.step_type,
            order: self.step_order,
            project_id: self.project_id,
            workflow_id: self.workflow_id,
            workflow_step_id: self.workflow_step_id,
            workflow_execution_id: self.workflow_execution_id,
            workflow_stage_execution_id: self.workflow_stage_execution_id,
            attributes: from_json(&self.attributes)?,
            record: self.record,
            times: self.times,
            timeout: self.timeout,
            retry_strategy: from_json_opt(self.retry_strategy.as_deref())?,
            status: from_json(&self.status)?,
            execute_time: self.execute_time,
            duration: self.duration,
            create_time: self.create_time,
        })
    }
}

/// Group step execution rows under their stage execution rows.
pub(crate) fn assemble_stage_executions(
    stages: Vec<StageExecutionRow>,
    steps: Vec<StepExecutionRow>,
) -> Result<Vec<WorkflowStageExecution>> {
    let mut steps: Vec<Option<StepExecutionRow>> = steps.into_iter().map(Some).collect();
    stages
        .into_iter()
        .map(|stage| {
            let owned = steps
                .iter_mut()
                .filter(|s| matches!(s, Some(row) if row.workflow_stage_execution_id == stage.id))
                .filter_map(Option::take)
                .map(StepExecutionRow::into_model)
                .collect::<Result<Vec<_>>>()?;
            stage.into_model(owned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_row(id: i64, order: i32) -> StageRow {
        StageRow {
            id,
            workflow_id: 1,
            project_id: 1,
            name: format!("stage {id}"),
            stage_order: order,
            dependencies: "[]".to_string(),
        }
    }

    fn step_row(id: i64, stage_id: i64) -> StepRow {
        StepRow {
            id,
            workflow_id: 1,
            workflow_stage_id: stage_id,
            project_id: 1,
            name: format!("step {id}"),
            step_type: "service".to_string(),
            attributes: r#"{"name":"web"}"#.to_string(),
            retry_strategy: None,
            timeout: 0,
            step_order: 0,
            dependencies: "[]".to_string(),
        }
    }

    #[test]
    fn test_assemble_groups_steps_by_stage() {
        let stages = assemble_stages(
            vec![stage_row(1, 0), stage_row(2, 1)],
            vec![step_row(10, 2), step_row(11, 1), step_row(12, 2)],
        )
        .expect("assemble");

        assert_eq!(stages[0].steps.iter().map(|s| s.id).collect::<Vec<_>>(), vec![11]);
        assert_eq!(
            stages[1].steps.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![10, 12]
        );
        assert_eq!(stages[1].steps[0].attributes["name"], "web");
    }

    #[test]
    fn test_null_retry_strategy_reads_as_none() {
        let mut row = step_row(1, 1);
        row.retry_strategy = Some("null".to_string());
        assert!(row.into_model().expect("convert").retry_strategy.is_none());
    }

    #[test]
    fn test_unknown_workflow_type_is_rejected() {
        assert!(workflow_type("cron").is_err());
        assert_eq!(workflow_type("default").expect("parse"), WorkflowType::Default);
    }
}
