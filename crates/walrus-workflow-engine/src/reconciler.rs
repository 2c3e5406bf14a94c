// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker reconciling runner objects into execution records.
//!
//! The worker lists every runner object labelled with an execution ID and
//! reconciles the ones whose `resourceVersion` changed since the last pass.
//! Reconciliation is based on the full current object, so a missed or
//! repeated pass is harmless. An object the execution has not recorded as
//! its own is left for the next pass.
//!
//! Per object:
//! - the execution status follows the object phase
//! - `stage-{id}-enter` nodes mark stages running
//! - `step-{id}-main` nodes drive step status
//! - once the object finished, stages and steps left open are settled

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument};
use walrus_workflow::definition::{Workflow as RunnerWorkflow, WorkflowPhase};
use walrus_workflow::naming::{NodeName, Phase, TemplateType, WORKFLOW_EXECUTION_ID_LABEL};

use crate::error::Result;
use crate::runner::WorkflowRunner;
use crate::syncer::{ExecutionSync, StatusSyncer};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often runner objects are listed.
    pub poll_interval: Duration,
    /// Namespace of runner objects.
    pub namespace: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            namespace: "walrus-system".to_string(),
        }
    }
}

/// Background worker syncing runner objects into execution records.
pub struct WorkflowReconciler {
    runner: Arc<dyn WorkflowRunner>,
    syncer: Arc<StatusSyncer>,
    config: ReconcilerConfig,
    /// Last reconciled `resourceVersion` per object name.
    seen: Mutex<HashMap<String, String>>,
    shutdown: Arc<Notify>,
}

impl WorkflowReconciler {
    /// Create a new reconciler.
    pub fn new(
        runner: Arc<dyn WorkflowRunner>,
        syncer: Arc<StatusSyncer>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            runner,
            syncer,
            config,
            seen: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconcile loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            namespace = %self.config.namespace,
            "Workflow reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Workflow reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll().await {
                        error!(error = %e, "Failed to list runner workflows");
                    }
                }
            }
        }

        info!("Workflow reconciler stopped");
    }

    /// List runner objects once and reconcile the changed ones.
    ///
    /// Returns the number of objects reconciled.
    pub async fn poll(&self) -> Result<usize> {
        let objects = self
            .runner
            .list_workflows(&self.config.namespace, WORKFLOW_EXECUTION_ID_LABEL)
            .await?;

        let mut reconciled = 0;
        let mut live = Vec::with_capacity(objects.len());

        for object in objects {
            let name = object.metadata.name.clone();
            let version = object.metadata.resource_version.clone().unwrap_or_default();
            live.push(name.clone());

            if self.seen.lock().await.get(&name) == Some(&version) {
                continue;
            }

            match self.reconcile(&object).await {
                Ok(true) => {
                    self.seen.lock().await.insert(name, version);
                    reconciled += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    // Retried on the next pass.
                    error!(name = %name, error = %e, "Failed to reconcile runner workflow");
                }
            }
        }

        self.seen.lock().await.retain(|name, _| live.contains(name));

        if reconciled > 0 {
            debug!(reconciled, "Reconciled runner workflows");
        }
        Ok(reconciled)
    }

    /// Reconcile one runner object.
    ///
    /// Returns false when the object does not drive its execution (yet), so
    /// the caller retries it later.
    #[instrument(skip(self, object), fields(name = %object.metadata.name))]
    pub async fn reconcile(&self, object: &RunnerWorkflow) -> Result<bool> {
        if object.is_deleting() {
            return Ok(true);
        }

        let execution = match self.syncer.sync_execution(object).await? {
            ExecutionSync::Synced(execution) => execution,
            ExecutionSync::NotOwner => return Ok(false),
            ExecutionSync::Skipped => return Ok(true),
        };
        let Some(status) = object.status.as_ref() else {
            return Ok(true);
        };

        let canceled =
            object.is_shutdown_requested() || self.syncer.is_canceled(execution.id).await?;

        for node in status.nodes.values() {
            let Some(parsed) = NodeName::parse(&node.display_name) else {
                continue;
            };

            match (parsed.template_type, parsed.phase) {
                (TemplateType::Stage, Some(Phase::Enter)) => {
                    if execution.stage(parsed.id).is_some() {
                        self.syncer.sync_stage(node, parsed.id, canceled).await?;
                    }
                }
                (TemplateType::Step, Some(Phase::Main)) => {
                    if execution.step(parsed.id).is_some() {
                        self.syncer
                            .sync_step(object, node, parsed.id, canceled)
                            .await?;
                    }
                }
                _ => {}
            }
        }

        if matches!(
            status.phase(),
            WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error
        ) {
            self.syncer.finalize_execution(execution.id).await?;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use walrus_workflow::definition::{NodeStatus, WorkflowStatus};
    use walrus_workflow::status::ExecutionState;

    use crate::client::Client;
    use crate::persistence::Persistence;
    use crate::test_support::{Fixture, fixture};

    fn node(display_name: &str, phase: &str) -> (String, NodeStatus) {
        let id = format!("deploy-{display_name}");
        let finished = matches!(phase, "Succeeded" | "Failed" | "Error");
        (
            id.clone(),
            NodeStatus {
                id,
                name: display_name.to_string(),
                display_name: display_name.to_string(),
                raw_phase: phase.to_string(),
                started_at: Some(Utc::now()),
                finished_at: finished.then(Utc::now),
                ..Default::default()
            },
        )
    }

    fn reconciler(fx: &Fixture) -> WorkflowReconciler {
        let runner: Arc<dyn WorkflowRunner> = Arc::new(fx.runner.clone());
        let syncer = Arc::new(StatusSyncer::new(
            fx.persistence.clone(),
            runner.clone(),
            fx.bus.clone(),
            "walrus-system",
        ));
        WorkflowReconciler::new(runner, syncer, ReconcilerConfig::default())
    }

    async fn submitted(fx: &Fixture) -> String {
        fx.client
            .submit(&fx.execution, &fx.subject)
            .await
            .expect("submit");
        fx.runner.objects().await[0].metadata.name.clone()
    }

    #[tokio::test]
    async fn test_poll_reconciles_changed_objects_once() {
        let fx = fixture().await;
        let name = submitted(&fx).await;
        let reconciler = reconciler(&fx);

        assert_eq!(reconciler.poll().await.expect("poll"), 1);
        assert_eq!(reconciler.poll().await.expect("poll"), 0);

        fx.runner
            .set_status(
                &name,
                WorkflowStatus {
                    raw_phase: "Running".to_string(),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("status");
        assert_eq!(reconciler.poll().await.expect("poll"), 1);

        let loaded = fx
            .persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status.state(), ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_reconcile_walks_nodes() {
        let fx = fixture().await;
        let name = submitted(&fx).await;
        let stage = &fx.execution.stages[0];
        let step = &stage.steps[0];
        let approval_stage = &fx.execution.stages[1];

        let object = fx
            .runner
            .set_status(
                &name,
                WorkflowStatus {
                    raw_phase: "Running".to_string(),
                    started_at: Some(Utc::now()),
                    nodes: [
                        node(&format!("stage-{}-enter", stage.id), "Succeeded"),
                        node(&format!("step-{}-main", step.id), "Succeeded"),
                        node(&format!("step-{}-main(0)", step.id), "Failed"),
                        node(&format!("stage-{}-enter", approval_stage.id), "Running"),
                        node("workflowEnter", "Succeeded"),
                    ]
                    .into_iter()
                    .collect(),
                    ..Default::default()
                },
            )
            .await
            .expect("status");

        assert!(reconciler(&fx).reconcile(&object).await.expect("reconcile"));

        let loaded = fx
            .persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status.state(), ExecutionState::Running);
        assert_eq!(loaded.stages[0].status.state(), ExecutionState::Succeeded);
        assert_eq!(
            loaded.stages[0].steps[0].status.state(),
            ExecutionState::Succeeded
        );
        assert_eq!(loaded.stages[1].status.state(), ExecutionState::Running);
        assert_eq!(
            loaded.stages[1].steps[0].status.state(),
            ExecutionState::Pending
        );
    }

    #[tokio::test]
    async fn test_terminated_workflow_cancels_open_records() {
        let fx = fixture().await;
        let name = submitted(&fx).await;
        fx.client.terminate(&fx.execution).await.expect("terminate");
        let approval_step = &fx.execution.stages[1].steps[0];

        let object = fx
            .runner
            .set_status(
                &name,
                WorkflowStatus {
                    raw_phase: "Failed".to_string(),
                    message: Some("Stopped with strategy 'Terminate'".to_string()),
                    nodes: [node(&format!("step-{}-main", approval_step.id), "Failed")]
                        .into_iter()
                        .collect(),
                    ..Default::default()
                },
            )
            .await
            .expect("status");

        assert!(reconciler(&fx).reconcile(&object).await.expect("reconcile"));

        let loaded = fx
            .persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status.state(), ExecutionState::Canceled);
        for stage in &loaded.stages {
            assert_eq!(stage.status.state(), ExecutionState::Canceled);
            for step in &stage.steps {
                assert_eq!(step.status.state(), ExecutionState::Canceled);
            }
        }
    }

    async fn state(fx: &Fixture) -> ExecutionState {
        fx.persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists")
            .status
            .state()
    }

    #[tokio::test]
    async fn test_rerun_ignores_previous_attempt() {
        let fx = fixture().await;
        let previous = submitted(&fx).await;
        let reconciler = reconciler(&fx);

        let failed = fx
            .runner
            .set_status(
                &previous,
                WorkflowStatus {
                    raw_phase: "Failed".to_string(),
                    message: Some("old attempt".to_string()),
                    started_at: Some(Utc::now()),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("status");
        assert!(reconciler.reconcile(&failed).await.expect("reconcile"));
        let finished = fx
            .persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(finished.status.state(), ExecutionState::Failed);

        fx.client
            .resubmit(&finished, &fx.subject)
            .await
            .expect("resubmit");
        let next = fx.runner.objects().await.pop().expect("next attempt");
        assert_ne!(next.metadata.name, previous);

        // A late pass over the previous attempt's object.
        assert!(!reconciler.reconcile(&failed).await.expect("reconcile"));
        assert_eq!(state(&fx).await, ExecutionState::Pending);

        let running = fx
            .runner
            .set_status(
                &next.metadata.name,
                WorkflowStatus {
                    raw_phase: "Running".to_string(),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("status");
        assert!(reconciler.reconcile(&running).await.expect("reconcile"));

        let loaded = fx
            .persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status.state(), ExecutionState::Running);
        assert_ne!(loaded.status.summary.summary_status_message, "old attempt");
    }

    #[tokio::test]
    async fn test_unowned_object_is_retried_on_next_poll() {
        let fx = fixture().await;
        let name = submitted(&fx).await;
        let reconciler = reconciler(&fx);

        fx.persistence
            .set_runner_object(fx.execution.id, "deploy-other")
            .await
            .expect("owner");
        fx.runner
            .set_status(
                &name,
                WorkflowStatus {
                    raw_phase: "Running".to_string(),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .expect("status");

        assert_eq!(reconciler.poll().await.expect("poll"), 0);
        assert_eq!(state(&fx).await, ExecutionState::Pending);

        fx.persistence
            .set_runner_object(fx.execution.id, &name)
            .await
            .expect("owner");
        assert_eq!(reconciler.poll().await.expect("poll"), 1);
        assert_eq!(state(&fx).await, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_deleting_object_is_ignored() {
        let fx = fixture().await;
        let name = submitted(&fx).await;
        let mut object = fx
            .runner
            .set_status(
                &name,
                WorkflowStatus {
                    raw_phase: "Succeeded".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("status");
        object.metadata.deletion_timestamp = Some(Utc::now());

        assert!(reconciler(&fx).reconcile(&object).await.expect("reconcile"));

        let loaded = fx
            .persistence
            .get_execution(fx.execution.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status.state(), ExecutionState::Pending);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run_loop() {
        let fx = fixture().await;
        let reconciler = Arc::new(reconciler(&fx));
        let shutdown = reconciler.shutdown_handle();

        let worker = reconciler.clone();
        let handle = tokio::spawn(async move { worker.run().await });
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop stops")
            .expect("task");
    }
}
