// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions and their execution records.
//!
//! The definition side (`Workflow` → `WorkflowStage` → `WorkflowStep`) is
//! authored by users. Each run materialises an execution hierarchy
//! (`WorkflowExecution` → `WorkflowStageExecution` → `WorkflowStepExecution`)
//! whose status fields are driven by the runner. Child collections are
//! loaded edges and are kept sorted by `order`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::definition::RetryStrategy;
use crate::status::Status;

/// Free-form, type-specific step configuration.
pub type Attributes = Map<String, Value>;

/// The authenticated principal that triggers or approves executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject ID
    pub id: i64,
    /// Display name, recorded in triggers and rejection messages
    pub name: String,
}

impl Subject {
    /// Create a subject.
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// How a workflow is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Started manually through the API.
    #[default]
    Default,
}

impl WorkflowType {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Default => "default",
        }
    }
}

/// A declared workflow variable usable as `${workflow.var.<name>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVariable {
    /// Variable key
    pub name: String,
    /// Default value
    pub value: String,
    /// Whether run options may override the value
    #[serde(default)]
    pub overwrite: bool,
    /// Optional description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Workflow ID
    pub id: i64,
    /// Workflow name, also the prefix of runner object names
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Owning project
    pub project_id: i64,
    /// Optional environment scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<i64>,
    /// Workflow type
    #[serde(default, rename = "type")]
    pub workflow_type: WorkflowType,
    /// Maximum parallel nodes, zero for unlimited
    #[serde(default)]
    pub parallelism: i32,
    /// Timeout in seconds, zero for unlimited
    #[serde(default)]
    pub timeout: i32,
    /// Optimistic concurrency token, advanced once per successful run
    pub version: i64,
    /// Declared variables
    #[serde(default)]
    pub variables: Vec<WorkflowVariable>,
    /// Stages, ascending by `order`
    #[serde(default)]
    pub stages: Vec<WorkflowStage>,
}

/// A stage groups steps that run together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStage {
    /// Stage ID
    pub id: i64,
    /// Owning workflow
    pub workflow_id: i64,
    /// Owning project
    pub project_id: i64,
    /// Stage name
    pub name: String,
    /// Position within the workflow
    pub order: i32,
    /// Stage IDs this stage must follow (persisted, not used for ordering)
    #[serde(default)]
    pub dependencies: Vec<i64>,
    /// Steps, ascending by `order`
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// A single unit of work inside a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Step ID
    pub id: i64,
    /// Owning workflow
    pub workflow_id: i64,
    /// Owning stage
    pub workflow_stage_id: i64,
    /// Owning project
    pub project_id: i64,
    /// Step name
    pub name: String,
    /// Step type key, e.g. `service` or `approval`
    #[serde(rename = "type")]
    pub step_type: String,
    /// Type-specific configuration
    #[serde(default)]
    pub attributes: Attributes,
    /// Optional retry policy for the main node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    /// Timeout in seconds, zero for unlimited
    #[serde(default)]
    pub timeout: i32,
    /// Position within the stage
    pub order: i32,
    /// Step IDs this step must follow (persisted, not used for ordering)
    #[serde(default)]
    pub dependencies: Vec<i64>,
}

/// What triggered an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrigger {
    /// Trigger kind, currently always `manual`
    #[serde(rename = "type")]
    pub trigger_type: String,
    /// Name of the triggering subject
    pub user: String,
}

impl ExecutionTrigger {
    /// Trigger for a manual run by `subject`.
    pub fn manual(subject: &Subject) -> Self {
        Self {
            trigger_type: "manual".to_string(),
            user: subject.name.clone(),
        }
    }
}

/// One run attempt of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    /// Execution ID
    pub id: i64,
    /// Copied from the workflow name
    pub name: String,
    /// Free-form description given at run time
    #[serde(default)]
    pub description: String,
    /// Owning project
    pub project_id: i64,
    /// Executed workflow
    pub workflow_id: i64,
    /// Subject that triggered the run
    pub subject_id: i64,
    /// Workflow version snapshot at submission time
    pub version: i64,
    /// Attempt counter, incremented on every rerun
    pub times: i32,
    /// Copied from the workflow at submission time
    pub parallelism: i32,
    /// Copied from the workflow at submission time
    pub timeout: i32,
    /// Trigger information
    pub trigger: ExecutionTrigger,
    /// Structured status
    pub status: Status,
    /// When the runner started the execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds
    #[serde(default)]
    pub duration: i64,
    /// Name of the runner object driving the current attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_object: Option<String>,
    /// Creation time
    pub create_time: DateTime<Utc>,
    /// Stage executions, ascending by `order`
    #[serde(default)]
    pub stages: Vec<WorkflowStageExecution>,
}

/// One stage of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStageExecution {
    /// Stage execution ID
    pub id: i64,
    /// Copied from the stage name
    pub name: String,
    /// Owning project
    pub project_id: i64,
    /// Executed workflow
    pub workflow_id: i64,
    /// Executed stage
    pub workflow_stage_id: i64,
    /// Owning execution
    pub workflow_execution_id: i64,
    /// Copied from the stage order
    pub order: i32,
    /// Structured status
    pub status: Status,
    /// When the stage started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<DateTime<Utc>>,
    /// Duration in seconds
    #[serde(default)]
    pub duration: i64,
    /// Creation time
    pub create_time: DateTime<Utc>,
    /// Step executions, ascending by `order`
    #[serde(default)]
    pub steps: Vec<WorkflowStepExecution>,
}

/// One step of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepExecution {
    /// Step execution ID
    pub id: i64,
    /// Copied from the step name
    pub name: String,
    /// Copied from the step type
    #[serde(rename = "type")]
    pub step_type: String,
    /// Copied from the step order
    pub order: i32,
    /// Owning project
    pub project_id: i64,
    /// Executed workflow
    pub workflow_id: i64,
    /// Executed step
    pub workflow_step_id: i64,
    /// Owning execution
    pub workflow_execution_id: i64,
    /// Owning stage execution
    pub workflow_stage_execution_id: i64,
    /// Attributes after variable substitution, mutated by approvals
    #[serde(default)]
    pub attributes: Attributes,
    /// Captured logs of the main node
    #[serde(default)]
    pub record: String,
    /// Attempt counter
    pub times: i32,
    /// Timeout in seconds, zero for unlimited
    #[serde(default)]
    pub timeout: i32,
    /// Retry policy for the main node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    /// Structured status
    pub status: Status,
    /// When the main node started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<DateTime<Utc>>,
    /// Duration in seconds
    #[serde(default)]
    pub duration: i64,
    /// Creation time
    pub create_time: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Find a loaded stage execution by ID.
    pub fn stage(&self, id: i64) -> Option<&WorkflowStageExecution> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Find a loaded step execution by ID across all stages.
    pub fn step(&self, id: i64) -> Option<&WorkflowStepExecution> {
        self.stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .find(|s| s.id == id)
    }
}
