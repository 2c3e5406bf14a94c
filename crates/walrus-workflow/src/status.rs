// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured execution status.
//!
//! Executions, stage executions and step executions share one status shape:
//! a list of [`Condition`]s plus a derived [`Summary`]. The summary is computed
//! by walking the conditions in a fixed order:
//!
//! | Condition | Unknown                 | False                             | True                  |
//! |-----------|-------------------------|-----------------------------------|-----------------------|
//! | Pending   | Pending (transitioning) | Failed (error)                    | continue              |
//! | Running   | Running (transitioning) | Failed / Error by reason (error)  | Succeeded, continue   |
//! | Canceled  | Canceling (transitioning) | CancelFailed (error)            | Canceled (inactive)   |
//!
//! The coarse [`ExecutionState`] is what parents aggregate over (see [`aggregate`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason attached to a `Running=False` condition when the runner reported an error
/// rather than an ordinary failure.
pub const REASON_ERROR: &str = "Error";

/// Condition kinds tracked for every execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// Waiting to be picked up by the runner.
    Pending,
    /// Being executed by the runner.
    Running,
    /// Cancellation requested or completed.
    Canceled,
}

/// Tri-state value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition failed.
    False,
    /// The condition is in progress.
    Unknown,
}

/// One condition entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition kind
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// Current value
    pub status: ConditionStatus,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Derived single-value view of a status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Display status, e.g. `Running` or `CancelFailed`
    #[serde(default)]
    pub summary_status: String,
    /// Message of the deciding condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary_status_message: String,
    /// The deciding condition failed
    #[serde(default)]
    pub error: bool,
    /// The deciding condition is in progress
    #[serde(default)]
    pub transitioning: bool,
    /// The record reached a final inactive state
    #[serde(default)]
    pub inactive: bool,
}

impl Summary {
    fn transitioning(status: &str) -> Self {
        Self {
            summary_status: status.to_string(),
            transitioning: true,
            ..Default::default()
        }
    }

    fn error(status: &str) -> Self {
        Self {
            summary_status: status.to_string(),
            error: true,
            ..Default::default()
        }
    }

    fn done(status: &str) -> Self {
        Self {
            summary_status: status.to_string(),
            ..Default::default()
        }
    }
}

/// Conditions plus their summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Condition list, at most one entry per type
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Derived summary, refreshed by [`Status::refresh_summary`]
    #[serde(flatten)]
    pub summary: Summary,
}

const WALK_ORDER: [ConditionType; 3] = [
    ConditionType::Pending,
    ConditionType::Running,
    ConditionType::Canceled,
];

impl Status {
    /// A fresh status with `Pending=Unknown` and an up to date summary.
    pub fn pending() -> Self {
        let mut status = Self::default();
        status.reset(ConditionType::Pending, "");
        status
    }

    /// Look up the condition of the given type.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether the condition is present with status `True`.
    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.has(condition_type, ConditionStatus::True)
    }

    /// Whether the condition is present with status `False`.
    pub fn is_false(&self, condition_type: ConditionType) -> bool {
        self.has(condition_type, ConditionStatus::False)
    }

    /// Whether the condition is present with status `Unknown`.
    pub fn is_unknown(&self, condition_type: ConditionType) -> bool {
        self.has(condition_type, ConditionStatus::Unknown)
    }

    fn has(&self, condition_type: ConditionType, status: ConditionStatus) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == status)
    }

    /// Set a condition's status and message, inserting it if absent.
    pub fn set(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(c) => {
                if c.status != status {
                    c.last_update_time = Some(now);
                }
                c.status = status;
                c.reason = reason.to_string();
                c.message = message.to_string();
            }
            None => self.conditions.push(Condition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_update_time: Some(now),
            }),
        }
    }

    /// Mark the condition `True`.
    pub fn mark_true(&mut self, condition_type: ConditionType, message: &str) {
        self.set(condition_type, ConditionStatus::True, "", message);
    }

    /// Mark the condition `False`.
    pub fn mark_false(&mut self, condition_type: ConditionType, message: &str) {
        self.set(condition_type, ConditionStatus::False, "", message);
    }

    /// Mark the condition `False` with a machine readable reason.
    pub fn mark_false_with_reason(
        &mut self,
        condition_type: ConditionType,
        reason: &str,
        message: &str,
    ) {
        self.set(condition_type, ConditionStatus::False, reason, message);
    }

    /// Mark the condition `Unknown`.
    pub fn mark_unknown(&mut self, condition_type: ConditionType, message: &str) {
        self.set(condition_type, ConditionStatus::Unknown, "", message);
    }

    /// Drop every condition and start over with `condition_type=Unknown`.
    ///
    /// Also refreshes the summary.
    pub fn reset(&mut self, condition_type: ConditionType, message: &str) {
        self.conditions.clear();
        self.mark_unknown(condition_type, message);
        self.refresh_summary();
    }

    /// Walk the conditions and compute the summary.
    pub fn walk(&self) -> Summary {
        let mut summary: Option<Summary> = None;

        for condition_type in WALK_ORDER {
            let Some(c) = self.condition(condition_type) else {
                continue;
            };

            let mut decided = match (condition_type, c.status) {
                (ConditionType::Pending, ConditionStatus::Unknown) => {
                    Summary::transitioning("Pending")
                }
                (ConditionType::Pending, ConditionStatus::False) => Summary::error("Failed"),
                (ConditionType::Pending, ConditionStatus::True) => Summary::done("Pending"),
                (ConditionType::Running, ConditionStatus::Unknown) => {
                    Summary::transitioning("Running")
                }
                (ConditionType::Running, ConditionStatus::False) if c.reason == REASON_ERROR => {
                    Summary::error("Error")
                }
                (ConditionType::Running, ConditionStatus::False) => Summary::error("Failed"),
                (ConditionType::Running, ConditionStatus::True) => Summary::done("Succeeded"),
                (ConditionType::Canceled, ConditionStatus::Unknown) => {
                    Summary::transitioning("Canceling")
                }
                (ConditionType::Canceled, ConditionStatus::False) => {
                    Summary::error("CancelFailed")
                }
                (ConditionType::Canceled, ConditionStatus::True) => Summary {
                    inactive: true,
                    ..Summary::done("Canceled")
                },
            };
            decided.summary_status_message = c.message.clone();

            let stop = decided.error || decided.transitioning;
            summary = Some(decided);
            if stop {
                break;
            }
        }

        summary.unwrap_or_else(|| Summary::transitioning("Pending"))
    }

    /// Recompute and store the summary.
    pub fn refresh_summary(&mut self) {
        self.summary = self.walk();
    }

    /// Coarse state used for aggregation and status reports.
    pub fn state(&self) -> ExecutionState {
        if self.is_true(ConditionType::Canceled) {
            return ExecutionState::Canceled;
        }
        if self.is_false(ConditionType::Canceled) || self.is_false(ConditionType::Pending) {
            return ExecutionState::Failed;
        }
        if let Some(c) = self.condition(ConditionType::Running) {
            return match c.status {
                ConditionStatus::True => ExecutionState::Succeeded,
                ConditionStatus::False if c.reason == REASON_ERROR => ExecutionState::Error,
                ConditionStatus::False => ExecutionState::Failed,
                ConditionStatus::Unknown => ExecutionState::Running,
            };
        }
        if self.is_true(ConditionType::Pending) || self.is_unknown(ConditionType::Canceled) {
            return ExecutionState::Running;
        }
        ExecutionState::Pending
    }

    /// Whether the record already reached a terminal outcome in this attempt.
    ///
    /// Terminal records are never updated again until an explicit reset.
    pub fn is_finished(&self) -> bool {
        self.is_true(ConditionType::Running)
            || self.is_false(ConditionType::Running)
            || self.is_true(ConditionType::Canceled)
    }

    /// Move the conditions to represent `state` and refresh the summary.
    pub fn apply(&mut self, state: ExecutionState, message: &str) {
        match state {
            ExecutionState::Pending => {
                self.reset(ConditionType::Pending, message);
                return;
            }
            ExecutionState::Running => {
                self.mark_true(ConditionType::Pending, "");
                self.mark_unknown(ConditionType::Running, message);
            }
            ExecutionState::Succeeded => {
                self.mark_true(ConditionType::Pending, "");
                self.mark_true(ConditionType::Running, message);
            }
            ExecutionState::Failed => {
                self.mark_true(ConditionType::Pending, "");
                self.mark_false(ConditionType::Running, message);
            }
            ExecutionState::Error => {
                self.mark_true(ConditionType::Pending, "");
                self.mark_false_with_reason(ConditionType::Running, REASON_ERROR, message);
            }
            ExecutionState::Canceled => {
                self.reset(ConditionType::Canceled, "");
                self.mark_true(ConditionType::Canceled, message);
            }
        }
        self.refresh_summary();
    }
}

/// Coarse lifecycle state of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Not started.
    Pending,
    /// In progress.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed unsuccessfully.
    Failed,
    /// The runner could not execute it.
    Error,
    /// Canceled externally.
    Canceled,
}

impl ExecutionState {
    /// Whether the state is final within one attempt.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Running)
    }

    /// Wire representation used in status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "Pending",
            ExecutionState::Running => "Running",
            ExecutionState::Succeeded => "Succeeded",
            ExecutionState::Failed => "Failed",
            ExecutionState::Error => "Error",
            ExecutionState::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ExecutionState::Pending),
            "Running" => Ok(ExecutionState::Running),
            "Succeeded" => Ok(ExecutionState::Succeeded),
            "Failed" => Ok(ExecutionState::Failed),
            "Error" => Ok(ExecutionState::Error),
            "Canceled" => Ok(ExecutionState::Canceled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Aggregate child states into the parent's state.
///
/// Any `Error` wins, then any `Failed`. All `Succeeded` (or no children at
/// all) gives `Succeeded`. When everything is terminal the remainder must
/// contain a cancellation, giving `Canceled`. Otherwise the parent is
/// `Running` once any child left `Pending`.
pub fn aggregate<I>(children: I) -> ExecutionState
where
    I: IntoIterator<Item = ExecutionState>,
{
    let states: Vec<ExecutionState> = children.into_iter().collect();

    if states.contains(&ExecutionState::Error) {
        ExecutionState::Error
    } else if states.contains(&ExecutionState::Failed) {
        ExecutionState::Failed
    } else if states.iter().all(|s| *s == ExecutionState::Succeeded) {
        ExecutionState::Succeeded
    } else if states.iter().all(ExecutionState::is_terminal) {
        ExecutionState::Canceled
    } else if states.iter().any(|s| *s != ExecutionState::Pending) {
        ExecutionState::Running
    } else {
        ExecutionState::Pending
    }
}
