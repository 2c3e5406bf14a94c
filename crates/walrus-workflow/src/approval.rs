// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Approval step attributes.
//!
//! An approval step suspends the graph until enough approvers voted. The
//! votes live in the step execution's attributes, so they survive restarts
//! and partial multi-approver flows.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Attributes;

/// How many approvals are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalType {
    /// One approval is enough.
    #[default]
    Or,
    /// Every listed approver must approve.
    And,
}

/// Decoded approval attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSpec {
    /// Threshold kind
    #[serde(default)]
    pub approval_type: ApprovalType,
    /// Subjects allowed to vote
    pub approval_users: Vec<i64>,
    /// Subjects that approved
    #[serde(default)]
    pub approved_users: Vec<i64>,
    /// Subjects that rejected
    #[serde(default)]
    pub rejected_users: Vec<i64>,
}

impl ApprovalSpec {
    /// Decode from step attributes.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self> {
        let spec: ApprovalSpec =
            serde_json::from_value(serde_json::Value::Object(attributes.clone()))
                .map_err(|e| Error::InvalidApproval(e.to_string()))?;

        if spec.approval_users.is_empty() {
            return Err(Error::InvalidApproval(
                "approvalUsers must not be empty".to_string(),
            ));
        }

        Ok(spec)
    }

    /// Encode back into step attributes, keeping unrelated keys of `base`.
    pub fn merge_into(&self, base: &Attributes) -> Result<Attributes> {
        let mut attributes = base.clone();
        if let serde_json::Value::Object(fields) = serde_json::to_value(self)? {
            attributes.extend(fields);
        }
        Ok(attributes)
    }

    /// Record a vote. Voting again replaces the previous vote.
    pub fn set_user_approval(&mut self, subject_id: i64, approve: bool) -> Result<()> {
        if !self.approval_users.contains(&subject_id) {
            return Err(Error::NotAnApprover(subject_id));
        }

        self.approved_users.retain(|id| *id != subject_id);
        self.rejected_users.retain(|id| *id != subject_id);

        if approve {
            self.approved_users.push(subject_id);
        } else {
            self.rejected_users.push(subject_id);
        }

        Ok(())
    }

    /// Whether the threshold is met.
    pub fn is_approved(&self) -> bool {
        match self.approval_type {
            ApprovalType::Or => !self.approved_users.is_empty(),
            ApprovalType::And => self
                .approval_users
                .iter()
                .all(|id| self.approved_users.contains(id)),
        }
    }

    /// Whether any approver rejected.
    pub fn is_rejected(&self) -> bool {
        !self.rejected_users.is_empty()
    }

    /// Forget all votes.
    pub fn reset(&mut self) {
        self.approved_users.clear();
        self.rejected_users.clear();
    }
}
