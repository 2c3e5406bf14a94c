// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for definition generation and approval handling.

use thiserror::Error;

/// Errors raised while building runner definitions or mutating step attributes.
///
/// All of these are validation failures: they are surfaced synchronously to
/// the caller and never retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No generator is registered for the step type.
    #[error("unknown workflow step type: {0}")]
    UnknownStepType(String),

    /// A required step attribute is absent.
    #[error("step {step_id}: missing required attribute '{attribute}'")]
    MissingAttribute {
        /// Step execution ID
        step_id: i64,
        /// Attribute key
        attribute: &'static str,
    },

    /// A step attribute is present but has an unusable value.
    #[error("step {step_id}: invalid attribute '{attribute}': {reason}")]
    InvalidAttribute {
        /// Step execution ID
        step_id: i64,
        /// Attribute key
        attribute: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Approval attributes do not decode as an approval payload.
    #[error("invalid approval attributes: {0}")]
    InvalidApproval(String),

    /// The subject is not listed as an approver of the step.
    #[error("subject {0} is not an approver of this step")]
    NotAnApprover(i64),

    /// A run-time variable is unknown or not overwritable.
    #[error("invalid variables: {0}")]
    InvalidVariable(String),

    /// The server base URL substituted into callbacks is empty.
    #[error("server address is empty")]
    EmptyServerAddress,

    /// Script rendering failed.
    #[error("template rendering error: {0}")]
    Render(#[from] minijinja::Error),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for workflow definition operations.
pub type Result<T> = std::result::Result<T, Error>;
