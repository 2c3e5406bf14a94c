// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and rerun entrypoints.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use walrus_workflow::model::{
    ExecutionTrigger, Subject, Workflow, WorkflowExecution, WorkflowStageExecution,
    WorkflowStepExecution,
};
use walrus_workflow::status::Status;
use walrus_workflow::variables::{merge_variables, substitute};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::events::{ChangeBus, Topic};
use crate::persistence::Persistence;

/// Options of a manual run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Values for workflow variables declared with `overwrite`
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Execution description
    #[serde(default)]
    pub description: String,
}

/// Materialise the execution hierarchy of `workflow`.
///
/// IDs are left at zero for persistence to assign. Step attributes have
/// workflow variables substituted.
pub fn build_execution(
    workflow: &Workflow,
    options: &RunOptions,
    subject: &Subject,
) -> Result<WorkflowExecution> {
    let variables = merge_variables(&options.variables, &workflow.variables)?;
    let now = Utc::now();

    let mut stages = Vec::with_capacity(workflow.stages.len());
    for stage in &workflow.stages {
        let mut steps = Vec::with_capacity(stage.steps.len());
        for step in &stage.steps {
            steps.push(WorkflowStepExecution {
                id: 0,
                name: step.name.clone(),
                step_type: step.step_type.clone(),
                order: step.order,
                project_id: step.project_id,
                workflow_id: workflow.id,
                workflow_step_id: step.id,
                workflow_execution_id: 0,
                workflow_stage_execution_id: 0,
                attributes: substitute(&step.attributes, &variables)?,
                record: String::new(),
                times: 1,
                timeout: step.timeout,
                retry_strategy: step.retry_strategy.clone(),
                status: Status::pending(),
                execute_time: None,
                duration: 0,
                create_time: now,
            });
        }
        steps.sort_by_key(|s| s.order);

        stages.push(WorkflowStageExecution {
            id: 0,
            name: stage.name.clone(),
            project_id: stage.project_id,
            workflow_id: workflow.id,
            workflow_stage_id: stage.id,
            workflow_execution_id: 0,
            order: stage.order,
            status: Status::pending(),
            execute_time: None,
            duration: 0,
            create_time: now,
            steps,
        });
    }
    stages.sort_by_key(|s| s.order);

    Ok(WorkflowExecution {
        id: 0,
        name: workflow.name.clone(),
        description: options.description.clone(),
        project_id: workflow.project_id,
        workflow_id: workflow.id,
        subject_id: subject.id,
        version: workflow.version + 1,
        times: 1,
        parallelism: workflow.parallelism,
        timeout: workflow.timeout,
        trigger: ExecutionTrigger::manual(subject),
        status: Status::pending(),
        execute_time: None,
        duration: 0,
        runner_object: None,
        create_time: now,
        stages,
    })
}

/// Runs workflows and reruns their executions.
pub struct WorkflowService {
    persistence: Arc<dyn Persistence>,
    client: Arc<dyn Client>,
    bus: ChangeBus,
}

impl WorkflowService {
    /// Create a service.
    pub fn new(persistence: Arc<dyn Persistence>, client: Arc<dyn Client>, bus: ChangeBus) -> Self {
        Self {
            persistence,
            client,
            bus,
        }
    }

    /// Create an execution of `workflow` and submit it.
    ///
    /// `workflow.version` is the version the caller read. A concurrent run
    /// that advanced it first makes this call fail with `Conflict` without
    /// writing anything. A submission failure does not fail the call; it is
    /// recorded in the returned execution's status.
    #[instrument(skip(self, workflow, options, subject), fields(workflow_id = workflow.id))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        options: &RunOptions,
        subject: &Subject,
    ) -> Result<WorkflowExecution> {
        let execution = build_execution(workflow, options, subject)?;
        let created = self
            .persistence
            .create_execution(&execution, workflow.version)
            .await?;

        if let Err(e) = self.client.submit(&created, subject).await {
            warn!(execution_id = created.id, error = %e, "Run submitted with failure");
        }
        self.bus.publish_update(Topic::Workflow, workflow.id);

        let stored = self
            .persistence
            .get_execution(created.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow execution {}", created.id)))?;

        info!(execution_id = stored.id, version = stored.version, "Workflow run started");
        Ok(stored)
    }

    /// Run `workflow_id` at its current version.
    pub async fn run_latest(
        &self,
        workflow_id: i64,
        options: &RunOptions,
        subject: &Subject,
    ) -> Result<WorkflowExecution> {
        let workflow = self
            .persistence
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow {workflow_id}")))?;
        self.run(&workflow, options, subject).await
    }

    /// Rerun a finished execution.
    #[instrument(skip(self, subject))]
    pub async fn rerun(&self, execution_id: i64, subject: &Subject) -> Result<()> {
        let execution = self
            .persistence
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow execution {execution_id}")))?;

        if !execution.status.is_finished() {
            return Err(Error::InvalidRequest(format!(
                "workflow execution {execution_id} is still {}",
                execution.status.summary.summary_status
            )));
        }

        self.client.resubmit(&execution, subject).await?;
        self.bus.publish_update(Topic::Workflow, execution.workflow_id);

        info!(execution_id, "Workflow execution rerun");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use walrus_workflow::status::ExecutionState;

    use crate::runner::RunnerCall;
    use crate::test_support::{fixture, sample_workflow};

    #[test]
    fn test_build_execution_substitutes_variables() {
        let mut workflow = sample_workflow();
        workflow.id = 3;
        workflow.version = 4;
        let subject = Subject::new(1, "alice");
        let options = RunOptions {
            variables: HashMap::from([("release".to_string(), "web-canary".to_string())]),
            description: "canary".to_string(),
        };

        let execution = build_execution(&workflow, &options, &subject).expect("build");

        assert_eq!(execution.version, 5);
        assert_eq!(execution.times, 1);
        assert_eq!(execution.description, "canary");
        assert_eq!(execution.trigger.user, "alice");
        assert_eq!(execution.status.state(), ExecutionState::Pending);
        let service = &execution.stages[0].steps[0];
        assert_eq!(service.attributes["name"], "web-canary");
        assert_eq!(service.workflow_id, 3);
    }

    #[test]
    fn test_build_execution_rejects_fixed_variable() {
        let workflow = sample_workflow();
        let options = RunOptions {
            variables: HashMap::from([("region".to_string(), "eu".to_string())]),
            ..Default::default()
        };
        let err = build_execution(&workflow, &options, &Subject::new(1, "alice"))
            .expect_err("region is not overwritable");
        assert!(matches!(err, Error::Workflow(_)));
    }

    #[tokio::test]
    async fn test_run_twice_from_same_version_conflicts() {
        let fx = fixture().await;
        let workflow = fx.workflow().await;

        let execution = fx
            .service
            .run(&workflow, &RunOptions::default(), &fx.subject)
            .await
            .expect("run");
        assert_eq!(execution.version, workflow.version + 1);

        let err = fx
            .service
            .run(&workflow, &RunOptions::default(), &fx.subject)
            .await
            .expect_err("stale version");
        assert!(err.is_conflict());

        assert_eq!(fx.workflow().await.version, workflow.version + 1);
        let creates = fx
            .runner
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, RunnerCall::Create { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_run_records_submission_failure() {
        let fx = fixture().await;
        fx.runner.fail_next_create("quota exceeded").await;

        let execution = fx
            .service
            .run_latest(fx.execution.workflow_id, &RunOptions::default(), &fx.subject)
            .await
            .expect("run returns the failed execution");

        assert_eq!(execution.status.state(), ExecutionState::Failed);
        assert!(
            execution
                .status
                .summary
                .summary_status_message
                .contains("quota exceeded")
        );
    }

    #[tokio::test]
    async fn test_rerun_refused_while_running() {
        let fx = fixture().await;
        let err = fx
            .service
            .rerun(fx.execution.id, &fx.subject)
            .await
            .expect_err("pending execution");
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(fx.runner.calls().await.is_empty());
    }
}
