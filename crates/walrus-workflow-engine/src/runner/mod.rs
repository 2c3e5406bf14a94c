// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow runner client.
//!
//! The runner executes generated workflow objects and reports their progress
//! through the object status. [`ArgoRunner`] talks to the Argo Workflows
//! server REST API; [`MockRunner`] keeps objects in memory for tests.

mod argo;
mod mock;

pub use argo::ArgoRunner;
pub use mock::{MockRunner, RunnerCall};

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use walrus_workflow::definition::Workflow;

use crate::error::Result;

/// Container running a step's generated main template.
pub const MAIN_CONTAINER: &str = "main";

/// Log retrieval options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Container to read
    pub container: String,
    /// Pod label selector, e.g. `step-execution-id=5`
    pub selector: Option<String>,
    /// Keep the stream open while the pods run
    pub follow: bool,
}

impl LogOptions {
    /// Main container logs of the pods matching `selector`.
    pub fn main(selector: impl Into<String>) -> Self {
        Self {
            container: MAIN_CONTAINER.to_string(),
            selector: Some(selector.into()),
            follow: false,
        }
    }

    /// Follow the logs.
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Pod that produced the line
    #[serde(default)]
    pub pod_name: String,
    /// Line content without the trailing newline
    #[serde(default)]
    pub content: String,
}

/// Stream of log lines.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send>>;

/// Resubmission parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResubmitOptions {
    /// Reuse outputs of succeeded nodes
    pub memoized: bool,
    /// Global parameter overrides as `name=value`
    pub parameters: Vec<String>,
}

/// Operations on runner workflow objects.
///
/// Not-found conditions surface as errors for which
/// [`Error::is_not_found`](crate::error::Error::is_not_found) holds; callers
/// decide whether absence is benign.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Create a workflow object and return it as stored.
    async fn create_workflow(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow>;

    /// Get a workflow object, `None` if absent.
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<Workflow>>;

    /// List workflow objects matching a label selector.
    async fn list_workflows(&self, namespace: &str, label_selector: &str) -> Result<Vec<Workflow>>;

    /// Resume the suspended nodes matching `node_field_selector`.
    async fn resume_workflow(&self, namespace: &str, name: &str, node_field_selector: &str)
    -> Result<()>;

    /// Stop the workflow, failing the nodes matching `node_field_selector`.
    async fn stop_workflow(
        &self,
        namespace: &str,
        name: &str,
        node_field_selector: &str,
        message: &str,
    ) -> Result<()>;

    /// Resubmit a finished workflow. Returns the new object.
    async fn resubmit_workflow(
        &self,
        namespace: &str,
        name: &str,
        options: &ResubmitOptions,
    ) -> Result<Workflow>;

    /// Terminate the workflow without running exit handlers.
    async fn terminate_workflow(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete the workflow object.
    async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()>;

    /// Stream pod logs of the workflow.
    async fn stream_logs(&self, namespace: &str, name: &str, options: &LogOptions)
    -> Result<LogStream>;

    /// Collect pod logs of the workflow into one newline separated string.
    async fn get_logs(&self, namespace: &str, name: &str, options: &LogOptions) -> Result<String> {
        let options = LogOptions {
            follow: false,
            ..options.clone()
        };
        let mut stream = self.stream_logs(namespace, name, &options).await?;

        let mut lines = Vec::new();
        while let Some(entry) = stream.next().await {
            lines.push(entry?.content);
        }
        Ok(lines.join("\n"))
    }
}

/// Pick the current object among those sharing an execution label: the most
/// recently created one that is not being deleted.
pub fn current_object(objects: Vec<Workflow>) -> Option<Workflow> {
    objects
        .into_iter()
        .filter(|wf| !wf.is_deleting())
        .max_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.len().cmp(&b.metadata.name.len()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};
    use walrus_workflow::definition::ObjectMeta;

    fn object(name: &str, created: i64, deleting: bool) -> Workflow {
        Workflow {
            metadata: ObjectMeta {
                name: name.to_string(),
                creation_timestamp: Utc.timestamp_opt(created, 0).single(),
                deletion_timestamp: deleting.then(Utc::now),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_current_object_prefers_newest_live() {
        let picked = current_object(vec![
            object("deploy-7", 100, false),
            object("deploy-7-x2k9p", 200, false),
            object("deploy-7-p0q1r", 300, true),
        ]);
        assert_eq!(picked.expect("object").metadata.name, "deploy-7-x2k9p");
    }

    #[test]
    fn test_current_object_none_when_empty() {
        assert!(current_object(Vec::new()).is_none());
        assert!(current_object(vec![object("a", 1, true)]).is_none());
    }

    #[test]
    fn test_main_log_options() {
        let options = LogOptions::main("step-execution-id=5").follow(true);
        assert_eq!(options.container, "main");
        assert_eq!(options.selector.as_deref(), Some("step-execution-id=5"));
        assert!(options.follow);
    }
}
