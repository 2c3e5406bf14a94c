// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::approval::ApprovalSpec;
use crate::definition::{SuspendTemplate, Template};
use crate::error::Result;
use crate::model::WorkflowStepExecution;

use super::{GeneratedTemplates, STEP_TYPE_APPROVAL, StepManager};

/// Suspends the graph until the step is resumed by its approvers.
///
/// The attributes are decoded here only to reject malformed payloads at
/// submission time; voting happens in the execution client's resume path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalStep;

impl StepManager for ApprovalStep {
    fn step_type(&self) -> &'static str {
        STEP_TYPE_APPROVAL
    }

    fn generate_templates(&self, step: &WorkflowStepExecution) -> Result<GeneratedTemplates> {
        ApprovalSpec::from_attributes(&step.attributes)?;

        Ok(GeneratedTemplates::main_only(Template {
            suspend: Some(SuspendTemplate::default()),
            ..Default::default()
        }))
    }
}
