// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status reset for reruns.

use tracing::{debug, instrument};
use walrus_workflow::approval::ApprovalSpec;
use walrus_workflow::model::{WorkflowExecution, WorkflowStepExecution};
use walrus_workflow::status::ConditionType;
use walrus_workflow::step::STEP_TYPE_APPROVAL;

use crate::error::Result;
use crate::events::{ChangeBus, Topic};
use crate::persistence::Persistence;

/// Put an execution and all of its stages and steps back to pending.
///
/// Attempt counters are incremented, timing is cleared and approval votes
/// are forgotten. Step records (captured logs) are kept.
pub fn reset_status(execution: &mut WorkflowExecution) -> Result<()> {
    execution.status.reset(ConditionType::Pending, "");
    execution.times += 1;
    execution.execute_time = None;
    execution.duration = 0;

    for stage in &mut execution.stages {
        stage.status.reset(ConditionType::Pending, "");
        stage.execute_time = None;
        stage.duration = 0;

        for step in &mut stage.steps {
            reset_step(step)?;
        }
    }
    Ok(())
}

fn reset_step(step: &mut WorkflowStepExecution) -> Result<()> {
    step.status.reset(ConditionType::Pending, "");
    step.times += 1;
    step.execute_time = None;
    step.duration = 0;

    if step.step_type == STEP_TYPE_APPROVAL {
        let mut spec = ApprovalSpec::from_attributes(&step.attributes)?;
        spec.reset();
        step.attributes = spec.merge_into(&step.attributes)?;
    }
    Ok(())
}

/// Reset the stored execution hierarchy in one transaction and announce it.
///
/// Returns the execution as persisted.
#[instrument(skip(persistence, bus, execution), fields(execution_id = execution.id))]
pub async fn reset_execution(
    persistence: &dyn Persistence,
    bus: &ChangeBus,
    execution: &WorkflowExecution,
) -> Result<WorkflowExecution> {
    let mut reset = execution.clone();
    reset_status(&mut reset)?;

    persistence.reset_execution(&reset).await?;

    bus.publish_update(Topic::WorkflowExecution, reset.id);
    bus.publish_update(Topic::Workflow, reset.workflow_id);
    debug!(times = reset.times, "Execution status reset");

    Ok(reset)
}
