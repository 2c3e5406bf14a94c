// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step template generators.
//!
//! Each step type has a [`StepManager`] that turns one step execution into
//! the runner template doing the step's work. The [`StepRegistry`] maps type
//! keys to managers and is handed to the
//! [`TemplateManager`](crate::template::TemplateManager) at construction, so
//! adding a type never touches the template manager.
//!
//! | Type       | Main template                                  |
//! |------------|------------------------------------------------|
//! | `service`  | script deploying a resource through the API    |
//! | `approval` | suspend node resumed by approvers              |

mod approval;
mod service;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use approval::ApprovalStep;
pub use service::{ServiceStep, ServiceStepOptions};

use crate::definition::Template;
use crate::error::{Error, Result};
use crate::model::WorkflowStepExecution;

/// Type key of service steps.
pub const STEP_TYPE_SERVICE: &str = "service";
/// Type key of approval steps.
pub const STEP_TYPE_APPROVAL: &str = "approval";

/// Output of a step generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTemplates {
    /// Template doing the step's work. Its name, labels, timeout and retry
    /// policy are assigned by the template manager.
    pub main: Template,
    /// Extra templates referenced by `main`
    pub sub_templates: Vec<Template>,
}

impl GeneratedTemplates {
    /// Output with no sub-templates.
    pub fn main_only(main: Template) -> Self {
        Self {
            main,
            sub_templates: Vec::new(),
        }
    }
}

/// Generates runner templates for one step type.
pub trait StepManager: Send + Sync {
    /// Type key this manager handles.
    fn step_type(&self) -> &'static str;

    /// Build the main template (plus helpers) for a step execution.
    fn generate_templates(&self, step: &WorkflowStepExecution) -> Result<GeneratedTemplates>;
}

/// Explicit mapping from step type key to generator.
#[derive(Clone, Default)]
pub struct StepRegistry {
    managers: BTreeMap<&'static str, Arc<dyn StepManager>>,
}

impl StepRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `service` and `approval` types.
    pub fn with_builtin(service: ServiceStepOptions) -> Self {
        Self::new()
            .with(ServiceStep::new(service))
            .with(ApprovalStep)
    }

    /// Register a manager, replacing any manager of the same type.
    pub fn with<M: StepManager + 'static>(mut self, manager: M) -> Self {
        self.managers.insert(manager.step_type(), Arc::new(manager));
        self
    }

    /// Manager for a type key.
    pub fn get(&self, step_type: &str) -> Result<&dyn StepManager> {
        self.managers
            .get(step_type)
            .map(|m| m.as_ref())
            .ok_or_else(|| Error::UnknownStepType(step_type.to_string()))
    }

    /// Registered type keys.
    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.managers.keys().copied()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("types", &self.managers.keys().collect::<Vec<_>>())
            .finish()
    }
}
