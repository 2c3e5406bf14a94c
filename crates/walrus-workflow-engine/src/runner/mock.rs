// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory runner for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use walrus_workflow::definition::{Parameter, Workflow, WorkflowStatus};

use super::{LogEntry, LogOptions, LogStream, ResubmitOptions, WorkflowRunner};
use crate::error::{Error, Result};

/// A call recorded by [`MockRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    /// `create_workflow`
    Create {
        /// Object name
        name: String,
    },
    /// `resume_workflow`
    Resume {
        /// Object name
        name: String,
        /// Node field selector
        selector: String,
    },
    /// `stop_workflow`
    Stop {
        /// Object name
        name: String,
        /// Node field selector
        selector: String,
        /// Stop message
        message: String,
    },
    /// `resubmit_workflow`
    Resubmit {
        /// Object name
        name: String,
        /// Memoized flag
        memoized: bool,
        /// Parameter overrides
        parameters: Vec<String>,
    },
    /// `terminate_workflow`
    Terminate {
        /// Object name
        name: String,
    },
    /// `delete_workflow`
    Delete {
        /// Object name
        name: String,
    },
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Workflow>,
    calls: Vec<RunnerCall>,
    logs: HashMap<String, Vec<LogEntry>>,
    fail_create: Option<String>,
    sequence: u64,
}

impl State {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn stamp(&mut self, workflow: &mut Workflow) {
        let n = self.next();
        workflow.metadata.resource_version = Some(n.to_string());
    }

    fn object(&self, name: &str) -> Result<&Workflow> {
        self.objects
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("workflow {name}")))
    }
}

/// Runner keeping workflow objects in memory and recording every call.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<State>>,
}

impl MockRunner {
    /// Create an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls recorded so far.
    pub async fn calls(&self) -> Vec<RunnerCall> {
        self.state.lock().await.calls.clone()
    }

    /// Stored object by name.
    pub async fn object(&self, name: &str) -> Option<Workflow> {
        self.state.lock().await.objects.get(name).cloned()
    }

    /// All stored objects.
    pub async fn objects(&self) -> Vec<Workflow> {
        self.state.lock().await.objects.values().cloned().collect()
    }

    /// Replace an object's status as the runner would, bumping its version.
    pub async fn set_status(&self, name: &str, status: WorkflowStatus) -> Result<Workflow> {
        let mut state = self.state.lock().await;
        let n = state.next();
        let object = state
            .objects
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("workflow {name}")))?;
        object.status = Some(status);
        object.metadata.resource_version = Some(n.to_string());
        Ok(object.clone())
    }

    /// Log lines returned for pods matching `selector`.
    pub async fn set_logs(&self, selector: &str, lines: &[&str]) {
        let entries = lines
            .iter()
            .map(|line| LogEntry {
                pod_name: "pod".to_string(),
                content: (*line).to_string(),
            })
            .collect();
        self.state
            .lock()
            .await
            .logs
            .insert(selector.to_string(), entries);
    }

    /// Make the next `create_workflow` fail with an API error.
    pub async fn fail_next_create(&self, message: &str) {
        self.state.lock().await.fail_create = Some(message.to_string());
    }
}

fn matches_selector(workflow: &Workflow, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => workflow.metadata.labels.get(key).is_some_and(|v| v == value),
            None => workflow.metadata.labels.contains_key(term),
        })
}

#[async_trait]
impl WorkflowRunner for MockRunner {
    async fn create_workflow(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow> {
        let mut state = self.state.lock().await;
        let name = workflow.metadata.name.clone();
        state.calls.push(RunnerCall::Create { name: name.clone() });

        if let Some(message) = state.fail_create.take() {
            return Err(Error::Api {
                status: 500,
                message,
            });
        }
        if state.objects.contains_key(&name) {
            return Err(Error::Api {
                status: 409,
                message: format!("workflow {name} already exists"),
            });
        }

        let mut created = workflow.clone();
        let n = state.next();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("uid-{n}"));
        created.metadata.creation_timestamp = Some(Utc::now() + Duration::milliseconds(n as i64));
        state.stamp(&mut created);
        state.objects.insert(name, created.clone());
        Ok(created)
    }

    async fn get_workflow(&self, _namespace: &str, name: &str) -> Result<Option<Workflow>> {
        Ok(self.state.lock().await.objects.get(name).cloned())
    }

    async fn list_workflows(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Workflow>> {
        let state = self.state.lock().await;
        let mut items: Vec<Workflow> = state
            .objects
            .values()
            .filter(|wf| matches_selector(wf, label_selector))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }

    async fn resume_workflow(
        &self,
        _namespace: &str,
        name: &str,
        node_field_selector: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RunnerCall::Resume {
            name: name.to_string(),
            selector: node_field_selector.to_string(),
        });
        state.object(name)?;
        Ok(())
    }

    async fn stop_workflow(
        &self,
        _namespace: &str,
        name: &str,
        node_field_selector: &str,
        message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RunnerCall::Stop {
            name: name.to_string(),
            selector: node_field_selector.to_string(),
            message: message.to_string(),
        });
        state.object(name)?;
        Ok(())
    }

    async fn resubmit_workflow(
        &self,
        namespace: &str,
        name: &str,
        options: &ResubmitOptions,
    ) -> Result<Workflow> {
        let mut state = self.state.lock().await;
        state.calls.push(RunnerCall::Resubmit {
            name: name.to_string(),
            memoized: options.memoized,
            parameters: options.parameters.clone(),
        });

        let mut resubmitted = state.object(name)?.clone();
        let n = state.next();
        resubmitted.metadata.name = format!("{name}-r{n}");
        resubmitted.metadata.namespace = Some(namespace.to_string());
        resubmitted.metadata.uid = Some(format!("uid-{n}"));
        resubmitted.metadata.creation_timestamp = Some(Utc::now() + Duration::milliseconds(n as i64));
        resubmitted.status = None;
        for pair in &options.parameters {
            if let Some((key, value)) = pair.split_once('=') {
                let params = &mut resubmitted.spec.arguments.parameters;
                match params.iter_mut().find(|p| p.name == key) {
                    Some(param) => param.value = Some(value.to_string()),
                    None => params.push(Parameter::with_value(key, value)),
                }
            }
        }
        state.stamp(&mut resubmitted);
        state
            .objects
            .insert(resubmitted.metadata.name.clone(), resubmitted.clone());
        Ok(resubmitted)
    }

    async fn terminate_workflow(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RunnerCall::Terminate {
            name: name.to_string(),
        });
        let n = state.next();
        let object = state
            .objects
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("workflow {name}")))?;
        object.spec.shutdown = Some("Terminate".to_string());
        object.metadata.resource_version = Some(n.to_string());
        Ok(())
    }

    async fn delete_workflow(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(RunnerCall::Delete {
            name: name.to_string(),
        });
        state
            .objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("workflow {name}")))
    }

    async fn stream_logs(
        &self,
        _namespace: &str,
        name: &str,
        options: &LogOptions,
    ) -> Result<LogStream> {
        let state = self.state.lock().await;
        state.object(name)?;
        let entries = options
            .selector
            .as_deref()
            .and_then(|s| state.logs.get(s))
            .cloned()
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(entries.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use walrus_workflow::definition::ObjectMeta;

    fn labelled(name: &str, execution_id: &str) -> Workflow {
        Workflow {
            metadata: ObjectMeta {
                name: name.to_string(),
                labels: BTreeMap::from([(
                    "workflow-execution-id".to_string(),
                    execution_id.to_string(),
                )]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let runner = MockRunner::new();
        runner.create_workflow("ns", &labelled("a-1", "1")).await.expect("create");
        runner.create_workflow("ns", &labelled("b-2", "2")).await.expect("create");

        let one = runner
            .list_workflows("ns", "workflow-execution-id=1")
            .await
            .expect("list");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].metadata.name, "a-1");

        let all = runner
            .list_workflows("ns", "workflow-execution-id")
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_resubmit_overrides_parameters() {
        let runner = MockRunner::new();
        let mut wf = labelled("a-1", "1");
        wf.spec.arguments.parameters.push(Parameter::with_value("token", "old"));
        runner.create_workflow("ns", &wf).await.expect("create");

        let options = ResubmitOptions {
            memoized: false,
            parameters: vec!["token=new".to_string()],
        };
        let new = runner
            .resubmit_workflow("ns", "a-1", &options)
            .await
            .expect("resubmit");

        assert_ne!(new.metadata.name, "a-1");
        assert_eq!(new.spec.arguments.get("token"), Some("new"));
        assert_eq!(new.metadata.labels["workflow-execution-id"], "1");
    }

    #[tokio::test]
    async fn test_failed_create_is_recorded() {
        let runner = MockRunner::new();
        runner.fail_next_create("quota exceeded").await;

        let err = runner
            .create_workflow("ns", &labelled("a-1", "1"))
            .await
            .expect_err("fails");
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(runner.calls().await.len(), 1);
        assert!(runner.object("a-1").await.is_none());
    }
}
