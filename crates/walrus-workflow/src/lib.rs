// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Walrus Workflow
//!
//! Domain model and runner-graph generation for Walrus workflow executions.
//!
//! A workflow is a list of ordered stages, each holding steps. Executing it
//! produces a persisted hierarchy of execution records (execution → stage
//! executions → step executions) which this crate expands into a single
//! runner workflow object. The object reports progress back to the API
//! through status-callback nodes placed around every stage and step.
//!
//! # Modules
//!
//! | Module          | Contents                                                  |
//! |-----------------|-----------------------------------------------------------|
//! | [`model`]       | workflow definitions and execution records                |
//! | [`status`]      | condition-based status and its summary walker             |
//! | [`naming`]      | `{type}-{id}[-{phase}]` template and node names           |
//! | [`definition`]  | serde mirror of the runner workflow object                |
//! | [`template`]    | [`TemplateManager`] building the runner object            |
//! | [`step`]        | per-type step generators and their registry               |
//! | [`approval`]    | approval-step voting rules                                |
//! | [`variables`]   | `${workflow.var.NAME}` merging and substitution           |
//!
//! # Example
//!
//! ```no_run
//! use walrus_workflow::{StepRegistry, TemplateManager, TemplateOptions};
//! use walrus_workflow::step::ServiceStepOptions;
//!
//! # fn example(execution: &walrus_workflow::model::WorkflowExecution) -> walrus_workflow::Result<()> {
//! let manager = TemplateManager::new(
//!     StepRegistry::with_builtin(ServiceStepOptions::default()),
//!     TemplateOptions {
//!         server_url: "https://walrus.example.com".to_string(),
//!         ..Default::default()
//!     },
//! );
//!
//! let workflow = manager.to_runner_workflow(execution, "token")?;
//! println!("{}", serde_json::to_string_pretty(&workflow)?);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// Approval-step voting.
pub mod approval;
/// Runner workflow object model.
pub mod definition;
/// Error types.
pub mod error;
/// Workflow definitions and execution records.
pub mod model;
/// Template and node naming.
pub mod naming;
/// Runner placeholder strings.
pub mod placeholder;
/// Execution status.
pub mod status;
/// Step template generators.
pub mod step;
/// Runner workflow generation.
pub mod template;
/// Workflow variables.
pub mod variables;

pub use error::{Error, Result};
pub use status::{ExecutionState, Status};
pub use step::{StepManager, StepRegistry};
pub use template::{TemplateManager, TemplateOptions};
