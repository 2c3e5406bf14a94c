// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Synthetic node and template names.
//!
//! Every generated template and node is named `{type}-{id}` or
//! `{type}-{id}-{phase}`. The reconciler parses runner node display names
//! back into a [`NodeName`] to find the entity a node belongs to. Names that
//! don't match the grammar (secret fetches, lifecycle hook nodes, runner
//! bookkeeping) parse to `None`.

use std::fmt;

/// Name of the workflow entrypoint DAG template.
pub const WORKFLOW_ENTRYPOINT: &str = "entrypoint";
/// Name of the template reporting the execution as running.
pub const WORKFLOW_ENTER: &str = "workflowEnter";
/// Name of the exit handler reporting the final execution status.
pub const WORKFLOW_EXIT: &str = "workflowExit";
/// Name of the secret fetch inside the exit handler.
pub const WORKFLOW_EXIT_SECRET: &str = "workflowExitSecret";
/// Name of the report inside the exit handler.
pub const WORKFLOW_EXIT_REPORT: &str = "workflowExitReport";

/// Label carrying the execution ID on runner workflow objects.
pub const WORKFLOW_EXECUTION_ID_LABEL: &str = "workflow-execution-id";
/// Label carrying the step execution ID on step main pods.
pub const STEP_EXECUTION_ID_LABEL: &str = "step-execution-id";

/// Entity kind a template belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateType {
    /// Step execution
    Step,
    /// Stage execution
    Stage,
    /// Workflow execution
    Workflow,
}

impl TemplateType {
    /// Name segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateType::Step => "step",
            TemplateType::Stage => "stage",
            TemplateType::Workflow => "workflow",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "step" => Some(TemplateType::Step),
            "stage" => Some(TemplateType::Stage),
            "workflow" => Some(TemplateType::Workflow),
            _ => None,
        }
    }
}

/// Lifecycle phase of a generated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Reports the entity as running.
    Enter,
    /// Does the work.
    Main,
    /// Reports the final status.
    Exit,
}

impl Phase {
    /// Name segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Enter => "enter",
            Phase::Main => "main",
            Phase::Exit => "exit",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "enter" => Some(Phase::Enter),
            "main" => Some(Phase::Main),
            "exit" => Some(Phase::Exit),
            _ => None,
        }
    }
}

/// Parsed `(template type, phase, entity ID)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeName {
    /// Entity kind
    pub template_type: TemplateType,
    /// Entity ID
    pub id: i64,
    /// Phase, absent for wrapper templates
    pub phase: Option<Phase>,
}

impl NodeName {
    /// Wrapper name `{type}-{id}`.
    pub fn wrapper(template_type: TemplateType, id: i64) -> Self {
        Self {
            template_type,
            id,
            phase: None,
        }
    }

    /// Phase name `{type}-{id}-{phase}`.
    pub fn phased(template_type: TemplateType, id: i64, phase: Phase) -> Self {
        Self {
            template_type,
            id,
            phase: Some(phase),
        }
    }

    /// Parse a node or template name.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('-');
        let template_type = TemplateType::parse(parts.next()?)?;

        let id_part = parts.next()?;
        if id_part.is_empty() || !id_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id: i64 = id_part.parse().ok()?;

        let phase = match parts.next() {
            None => None,
            Some(p) => Some(Phase::parse(p)?),
        };

        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            template_type,
            id,
            phase,
        })
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.template_type.as_str(), self.id)?;
        if let Some(phase) = self.phase {
            write!(f, "-{}", phase.as_str())?;
        }
        Ok(())
    }
}

/// `stage-{id}`
pub fn stage_name(id: i64) -> String {
    NodeName::wrapper(TemplateType::Stage, id).to_string()
}

/// `stage-{id}-{phase}`
pub fn stage_phase_name(id: i64, phase: Phase) -> String {
    NodeName::phased(TemplateType::Stage, id, phase).to_string()
}

/// `step-{id}`
pub fn step_name(id: i64) -> String {
    NodeName::wrapper(TemplateType::Step, id).to_string()
}

/// `step-{id}-{phase}`
pub fn step_phase_name(id: i64, phase: Phase) -> String {
    NodeName::phased(TemplateType::Step, id, phase).to_string()
}

/// `stage-{id}-secret`, outside the parseable grammar.
pub fn stage_secret_name(id: i64) -> String {
    format!("{}-secret", stage_name(id))
}

/// `step-{id}-secret`, deliberately outside the parseable grammar.
pub fn step_secret_name(id: i64) -> String {
    format!("{}-secret", step_name(id))
}

/// Runner node field selector targeting the main node of a step.
pub fn step_main_selector(step_execution_id: i64) -> String {
    format!(
        "templateName={}",
        step_phase_name(step_execution_id, Phase::Main)
    )
}

/// Name of the per-execution token secret.
pub fn execution_secret_name(execution_id: i64) -> String {
    format!("workflow-execution-{execution_id}")
}

/// Name of the runner workflow object of an execution.
pub fn runner_workflow_name(execution_name: &str, execution_id: i64) -> String {
    format!("{execution_name}-{execution_id}")
}
