// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner status to execution status.
//!
//! Two sources move execution records forward: the runner object observed by
//! the reconciler, and the `{id, status}` callbacks the generated workflow
//! sends from its enter and exit nodes. Both go through [`StatusSyncer`] and
//! follow the same rule: a record that reached a terminal condition is never
//! touched again until it is reset for a rerun.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walrus_workflow::approval::ApprovalSpec;
use walrus_workflow::definition::{NodePhase, NodeStatus, Workflow as RunnerWorkflow, WorkflowPhase};
use walrus_workflow::model::{WorkflowExecution, WorkflowStageExecution, WorkflowStepExecution};
use walrus_workflow::naming::{STEP_EXECUTION_ID_LABEL, WORKFLOW_EXECUTION_ID_LABEL};
use walrus_workflow::status::{ConditionType, ExecutionState, Status, aggregate};
use walrus_workflow::step::STEP_TYPE_APPROVAL;

use crate::error::{Error, Result};
use crate::events::{ChangeBus, Topic};
use crate::persistence::Persistence;
use crate::runner::{LogOptions, WorkflowRunner};

/// Entity addressed by a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportTarget {
    /// `.../executions/{id}`
    Execution,
    /// `.../stage-executions/{id}`
    StageExecution,
    /// `.../step-executions/{id}`
    StepExecution,
}

/// Body of a status report callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Entity ID as sent by the runner
    pub id: String,
    /// Reported state, e.g. `Running` or `Succeeded`
    pub status: String,
}

impl StatusReport {
    /// Parse the ID and state.
    pub fn parse(&self) -> Result<(i64, ExecutionState)> {
        let id = self
            .id
            .trim()
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid id: {}", self.id)))?;
        let state = self.status.parse().map_err(Error::InvalidRequest)?;
        Ok((id, state))
    }
}

/// Outcome of [`StatusSyncer::sync_execution`].
#[derive(Debug)]
pub enum ExecutionSync {
    /// The object drives the execution. Carries the execution as stored
    /// afterwards.
    Synced(Box<WorkflowExecution>),
    /// The execution is driven by another object, or has not recorded its
    /// object yet.
    NotOwner,
    /// Unlabelled object, or the execution is gone.
    Skipped,
}

/// Execution ID carried in a runner object's labels.
pub fn execution_id(object: &RunnerWorkflow) -> Option<i64> {
    object
        .metadata
        .labels
        .get(WORKFLOW_EXECUTION_ID_LABEL)?
        .parse()
        .ok()
}

/// State a node phase moves a record to. `None` leaves the record alone.
fn node_state(phase: NodePhase) -> Option<ExecutionState> {
    match phase {
        NodePhase::Running => Some(ExecutionState::Running),
        NodePhase::Succeeded => Some(ExecutionState::Succeeded),
        NodePhase::Failed => Some(ExecutionState::Failed),
        NodePhase::Error => Some(ExecutionState::Error),
        NodePhase::Pending | NodePhase::Skipped | NodePhase::Omitted | NodePhase::Unknown => None,
    }
}

/// Move `status` to `state`. Returns false when nothing changed.
fn transition(status: &mut Status, state: ExecutionState, message: &str) -> bool {
    if status.is_finished() {
        return false;
    }
    match state {
        ExecutionState::Pending => false,
        ExecutionState::Running
            if status.is_unknown(ConditionType::Running)
                || status.is_unknown(ConditionType::Canceled) =>
        {
            false
        }
        state => {
            status.apply(state, message);
            true
        }
    }
}

fn elapsed(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> i64 {
    match start {
        Some(start) => (end.unwrap_or_else(Utc::now) - start).num_seconds().max(0),
        None => 0,
    }
}

/// Applies observed runner state to execution records.
pub struct StatusSyncer {
    persistence: Arc<dyn Persistence>,
    runner: Arc<dyn WorkflowRunner>,
    bus: ChangeBus,
    namespace: String,
}

impl StatusSyncer {
    /// Create a syncer.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runner: Arc<dyn WorkflowRunner>,
        bus: ChangeBus,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            persistence,
            runner,
            bus,
            namespace: namespace.into(),
        }
    }

    /// Sync the execution record from the runner object's phase.
    ///
    /// Only the object recorded on the execution moves it. Objects of earlier
    /// attempts, and new objects not recorded yet, leave it alone.
    #[instrument(skip(self, object), fields(name = %object.metadata.name))]
    pub async fn sync_execution(&self, object: &RunnerWorkflow) -> Result<ExecutionSync> {
        let Some(id) = execution_id(object) else {
            debug!("Runner object has no execution label, skipping");
            return Ok(ExecutionSync::Skipped);
        };
        let Some(mut execution) = self.persistence.get_execution(id).await? else {
            debug!(execution_id = id, "Execution no longer exists, skipping");
            return Ok(ExecutionSync::Skipped);
        };
        if execution.runner_object.as_deref() != Some(object.metadata.name.as_str()) {
            debug!(
                execution_id = id,
                owner = ?execution.runner_object,
                "Runner object does not drive the execution"
            );
            return Ok(ExecutionSync::NotOwner);
        }
        let Some(observed) = object.status.as_ref() else {
            return Ok(ExecutionSync::Synced(Box::new(execution)));
        };
        if execution.status.is_finished() {
            return Ok(ExecutionSync::Synced(Box::new(execution)));
        }

        let message = observed.message.as_deref().unwrap_or_default();
        match observed.phase() {
            WorkflowPhase::Running => {
                if !transition(&mut execution.status, ExecutionState::Running, "") {
                    return Ok(ExecutionSync::Synced(Box::new(execution)));
                }
                execution.execute_time = observed.started_at.or(execution.execute_time);
            }
            WorkflowPhase::Succeeded => {
                execution.status.apply(ExecutionState::Succeeded, "");
                execution.duration = elapsed(
                    observed.started_at.or(execution.execute_time),
                    observed.finished_at,
                );
            }
            phase @ (WorkflowPhase::Failed | WorkflowPhase::Error) => {
                let state = if execution.status.is_unknown(ConditionType::Canceled) {
                    ExecutionState::Canceled
                } else if phase == WorkflowPhase::Error {
                    ExecutionState::Error
                } else {
                    ExecutionState::Failed
                };
                execution.status.apply(state, message);
                execution.duration = elapsed(
                    execution.execute_time.or(observed.started_at),
                    observed.finished_at,
                );
            }
            phase => {
                debug!(execution_id = id, ?phase, "Runner phase does not move the execution");
                return Ok(ExecutionSync::Synced(Box::new(execution)));
            }
        }

        self.persistence.update_execution(&execution).await?;
        self.bus.publish_update(Topic::WorkflowExecution, execution.id);
        debug!(execution_id = id, state = %execution.status.state(), "Execution status synced");

        Ok(ExecutionSync::Synced(Box::new(execution)))
    }

    /// Whether the execution was canceled.
    pub async fn is_canceled(&self, execution_id: i64) -> Result<bool> {
        Ok(self
            .persistence
            .get_execution(execution_id)
            .await?
            .is_some_and(|e| e.status.is_true(ConditionType::Canceled)))
    }

    /// Sync a stage execution from its enter node.
    ///
    /// The enter node only reports that the stage started; completion comes
    /// from the step aggregate and the stage's exit report. A failing enter
    /// node fails the stage, or cancels it when `canceled` is set.
    #[instrument(skip(self, node), fields(node = %node.display_name))]
    pub async fn sync_stage(&self, node: &NodeStatus, stage_id: i64, canceled: bool) -> Result<()> {
        let Some(mut stage) = self.persistence.get_stage_execution(stage_id).await? else {
            debug!(stage_id, "Stage execution no longer exists, skipping");
            return Ok(());
        };

        let state = match node.phase() {
            NodePhase::Running | NodePhase::Succeeded => ExecutionState::Running,
            NodePhase::Failed | NodePhase::Error if canceled => ExecutionState::Canceled,
            phase => match node_state(phase) {
                Some(state) => state,
                None => return Ok(()),
            },
        };

        let message = node.message.as_deref().unwrap_or_default();
        if !transition(&mut stage.status, state, message) {
            return Ok(());
        }

        stage.execute_time = stage
            .execute_time
            .or(node.started_at)
            .or(Some(stage.create_time));
        if state.is_terminal() {
            stage.duration = elapsed(stage.execute_time, node.finished_at);
        }

        self.save_stage(&stage).await
    }

    /// Sync a step execution from its main node.
    ///
    /// On completion the step's logs are captured into `record` and the
    /// owning stage is aggregated once all of its steps are terminal.
    #[instrument(skip(self, object, node), fields(node = %node.display_name))]
    pub async fn sync_step(
        &self,
        object: &RunnerWorkflow,
        node: &NodeStatus,
        step_id: i64,
        canceled: bool,
    ) -> Result<()> {
        let Some(mut step) = self.persistence.get_step_execution(step_id).await? else {
            debug!(step_id, "Step execution no longer exists, skipping");
            return Ok(());
        };
        if step.status.is_finished() {
            return Ok(());
        }

        let Some(state) = node_state(node.phase()) else {
            return Ok(());
        };
        let state = match state {
            ExecutionState::Failed | ExecutionState::Error if canceled => ExecutionState::Canceled,
            state => state,
        };

        let mut message = node.message.clone().unwrap_or_default();
        if matches!(state, ExecutionState::Failed | ExecutionState::Error)
            && step.step_type == STEP_TYPE_APPROVAL
        {
            if let Some(rejection) = self.rejection_message(&step).await? {
                message = rejection;
            }
        }

        if !transition(&mut step.status, state, &message) {
            return Ok(());
        }

        match state {
            ExecutionState::Running => {
                step.execute_time = node.started_at.or(step.execute_time);
            }
            _ if node.is_completed() => {
                step.execute_time = step
                    .execute_time
                    .or(node.started_at)
                    .or(Some(step.create_time));
                step.duration = elapsed(step.execute_time, node.finished_at);
                self.capture_logs(object, &mut step).await;
            }
            _ => {}
        }

        self.persistence.update_step_status(&step).await?;
        self.bus
            .publish_update(Topic::WorkflowExecution, step.workflow_execution_id);

        if step.status.state().is_terminal() {
            self.aggregate_stage(step.workflow_stage_execution_id).await?;
        }
        Ok(())
    }

    /// Apply a status report callback.
    #[instrument(skip(self))]
    pub async fn apply_report(&self, target: ReportTarget, report: &StatusReport) -> Result<()> {
        let (id, state) = report.parse()?;
        let now = Utc::now();

        match target {
            ReportTarget::Execution => {
                let mut execution = self
                    .persistence
                    .get_execution(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("workflow execution {id}")))?;

                let state = match state {
                    ExecutionState::Failed | ExecutionState::Error
                        if execution.status.is_unknown(ConditionType::Canceled) =>
                    {
                        ExecutionState::Canceled
                    }
                    state => state,
                };
                if !transition(&mut execution.status, state, "") {
                    return Ok(());
                }
                execution.execute_time = execution.execute_time.or(Some(now));
                if state.is_terminal() {
                    execution.duration = elapsed(execution.execute_time, Some(now));
                }

                self.persistence.update_execution(&execution).await?;
                self.bus.publish_update(Topic::WorkflowExecution, execution.id);
            }
            ReportTarget::StageExecution => {
                let mut stage = self
                    .persistence
                    .get_stage_execution(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("workflow stage execution {id}")))?;

                if !transition(&mut stage.status, state, "") {
                    return Ok(());
                }
                stage.execute_time = stage.execute_time.or(Some(now));
                if state.is_terminal() {
                    stage.duration = elapsed(stage.execute_time, Some(now));
                }

                self.save_stage(&stage).await?;
            }
            ReportTarget::StepExecution => {
                let mut step = self
                    .persistence
                    .get_step_execution(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("workflow step execution {id}")))?;

                if !transition(&mut step.status, state, "") {
                    return Ok(());
                }
                step.execute_time = step.execute_time.or(Some(now));
                if state.is_terminal() {
                    step.duration = elapsed(step.execute_time, Some(now));
                }

                self.persistence.update_step_status(&step).await?;
                self.bus
                    .publish_update(Topic::WorkflowExecution, step.workflow_execution_id);
                if state.is_terminal() {
                    self.aggregate_stage(step.workflow_stage_execution_id).await?;
                }
            }
        }

        debug!(id, %state, "Status report applied");
        Ok(())
    }

    /// Settle stages and steps left open when the execution finished.
    ///
    /// A canceled execution cancels every unfinished stage and step. Otherwise
    /// stages whose steps are all terminal are aggregated; steps that never
    /// ran keep their pending status.
    #[instrument(skip(self))]
    pub async fn finalize_execution(&self, execution_id: i64) -> Result<()> {
        let Some(execution) = self.persistence.get_execution(execution_id).await? else {
            return Ok(());
        };
        if !execution.status.is_finished() {
            return Ok(());
        }
        let canceled = execution.status.is_true(ConditionType::Canceled);

        for stage in &execution.stages {
            if canceled {
                for step in stage.steps.iter().filter(|s| !s.status.is_finished()) {
                    let mut step = step.clone();
                    step.status.apply(ExecutionState::Canceled, "");
                    self.persistence.update_step_status(&step).await?;
                }
            }
            self.aggregate_stage(stage.id).await?;
        }

        self.bus.publish_update(Topic::WorkflowExecution, execution_id);
        Ok(())
    }

    /// Aggregate a stage from its steps once all of them are terminal.
    async fn aggregate_stage(&self, stage_id: i64) -> Result<()> {
        let Some(mut stage) = self.persistence.get_stage_execution(stage_id).await? else {
            return Ok(());
        };
        if stage.status.is_finished() {
            return Ok(());
        }

        let states: Vec<ExecutionState> = stage.steps.iter().map(|s| s.status.state()).collect();
        if !states.iter().all(ExecutionState::is_terminal) {
            return Ok(());
        }

        let state = aggregate(states);
        let message = stage
            .steps
            .iter()
            .find(|s| s.status.state() == state)
            .map(|s| s.status.summary.summary_status_message.clone())
            .unwrap_or_default();

        stage.status.apply(state, &message);
        stage.execute_time = stage.execute_time.or(Some(stage.create_time));
        stage.duration = elapsed(stage.execute_time, None);

        self.save_stage(&stage).await
    }

    async fn save_stage(&self, stage: &WorkflowStageExecution) -> Result<()> {
        self.persistence.update_stage_execution(stage).await?;
        self.bus
            .publish_update(Topic::WorkflowExecution, stage.workflow_execution_id);
        self.bus.publish_update(Topic::Workflow, stage.workflow_id);
        Ok(())
    }

    /// `rejected by alice,bob` from the step's rejecting subjects.
    async fn rejection_message(&self, step: &WorkflowStepExecution) -> Result<Option<String>> {
        let spec = ApprovalSpec::from_attributes(&step.attributes)?;
        if spec.rejected_users.is_empty() {
            return Ok(None);
        }

        let mut names = Vec::with_capacity(spec.rejected_users.len());
        for id in &spec.rejected_users {
            match self.persistence.get_subject(*id).await? {
                Some(subject) => names.push(subject.name),
                None => names.push(id.to_string()),
            }
        }
        Ok(Some(format!("rejected by {}", names.join(","))))
    }

    async fn capture_logs(&self, object: &RunnerWorkflow, step: &mut WorkflowStepExecution) {
        let options = LogOptions::main(format!("{STEP_EXECUTION_ID_LABEL}={}", step.id));
        match self
            .runner
            .get_logs(&self.namespace, &object.metadata.name, &options)
            .await
        {
            Ok(logs) if !logs.is_empty() => step.record = logs,
            Ok(_) => {}
            Err(e) => {
                warn!(step_id = step.id, error = %e, "Failed to capture step logs");
            }
        }
    }
}
