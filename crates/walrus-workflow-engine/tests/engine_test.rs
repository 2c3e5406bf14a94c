// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the engine over in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use walrus_workflow::definition::{NodeStatus, WorkflowStatus};
use walrus_workflow::model::{
    Subject, Workflow, WorkflowExecution, WorkflowStage, WorkflowStep, WorkflowType,
};
use walrus_workflow::status::ExecutionState;
use walrus_workflow::template::TemplateOptions;
use walrus_workflow_engine::events::Topic;
use walrus_workflow_engine::persistence::{Persistence, SqlitePersistence};
use walrus_workflow_engine::runner::{MockRunner, RunnerCall};
use walrus_workflow_engine::secrets::MockSecretStore;
use walrus_workflow_engine::token::StaticTokenIssuer;
use walrus_workflow_engine::{Client, RunOptions, WorkflowEngine, migrations};

struct Harness {
    engine: WorkflowEngine,
    persistence: Arc<SqlitePersistence>,
    runner: MockRunner,
    secrets: MockSecretStore,
    alice: Subject,
    bob: Subject,
    workflow: Workflow,
}

fn step(name: &str, step_type: &str, attributes: serde_json::Value) -> WorkflowStep {
    WorkflowStep {
        id: 0,
        workflow_id: 0,
        workflow_stage_id: 0,
        project_id: 1,
        name: name.to_string(),
        step_type: step_type.to_string(),
        attributes: attributes.as_object().cloned().unwrap_or_default(),
        retry_strategy: None,
        timeout: 0,
        order: 0,
        dependencies: Vec::new(),
    }
}

fn stage(name: &str, order: i32, step: WorkflowStep) -> WorkflowStage {
    WorkflowStage {
        id: 0,
        workflow_id: 0,
        project_id: 1,
        name: name.to_string(),
        order,
        dependencies: Vec::new(),
        steps: vec![step],
    }
}

async fn harness() -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    let persistence = Arc::new(SqlitePersistence::new(pool));

    let alice = persistence.create_subject("alice").await.expect("alice");
    let bob = persistence.create_subject("bob").await.expect("bob");

    let workflow = persistence
        .create_workflow(&Workflow {
            id: 0,
            name: "release".to_string(),
            description: String::new(),
            project_id: 1,
            environment_id: None,
            workflow_type: WorkflowType::Default,
            parallelism: 0,
            timeout: 0,
            version: 0,
            variables: Vec::new(),
            stages: vec![
                stage(
                    "deploy",
                    0,
                    step("api", "service", json!({"environmentID": "7", "name": "api"})),
                ),
                stage(
                    "promote",
                    1,
                    step(
                        "sign-off",
                        "approval",
                        json!({"approvalType": "or", "approvalUsers": [bob.id]}),
                    ),
                ),
            ],
        })
        .await
        .expect("create workflow");

    let runner = MockRunner::new();
    let secrets = MockSecretStore::new();
    let engine = WorkflowEngine::builder()
        .persistence(persistence.clone())
        .runner(Arc::new(runner.clone()))
        .secrets(Arc::new(secrets.clone()))
        .tokens(Arc::new(StaticTokenIssuer::new()))
        .template_options(TemplateOptions {
            server_url: "https://walrus.example.com".to_string(),
            ..Default::default()
        })
        .build()
        .expect("build engine");

    Harness {
        engine,
        persistence,
        runner,
        secrets,
        alice,
        bob,
        workflow,
    }
}

impl Harness {
    async fn execution(&self, id: i64) -> WorkflowExecution {
        self.persistence
            .get_execution(id)
            .await
            .expect("get execution")
            .expect("execution exists")
    }

    async fn object_name(&self) -> String {
        let objects = self.runner.objects().await;
        assert_eq!(objects.len(), 1);
        objects[0].metadata.name.clone()
    }

    async fn report(&self, phase: &str, nodes: Vec<(String, &str)>) {
        let finished = matches!(phase, "Succeeded" | "Failed" | "Error");
        let status = WorkflowStatus {
            raw_phase: phase.to_string(),
            started_at: Some(Utc::now()),
            finished_at: finished.then(Utc::now),
            nodes: nodes
                .into_iter()
                .map(|(display_name, phase)| {
                    let done = matches!(phase, "Succeeded" | "Failed" | "Error");
                    (
                        format!("node-{display_name}"),
                        NodeStatus {
                            id: format!("node-{display_name}"),
                            name: display_name.clone(),
                            display_name,
                            raw_phase: phase.to_string(),
                            started_at: Some(Utc::now()),
                            finished_at: done.then(Utc::now),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            ..Default::default()
        };
        self.runner
            .set_status(&self.object_name().await, status)
            .await
            .expect("set status");
        self.engine.reconciler().poll().await.expect("poll");
    }
}

#[tokio::test]
async fn test_run_approve_and_rerun() {
    let h = harness().await;
    let mut events = h.engine.events().subscribe(Topic::Workflow);

    let execution = h
        .engine
        .service()
        .run(&h.workflow, &RunOptions::default(), &h.alice)
        .await
        .expect("run");
    assert_eq!(execution.status.state(), ExecutionState::Pending);
    assert_eq!(execution.version, h.workflow.version + 1);
    assert_eq!(h.secrets.len().await, 1);

    let event = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("workflow event")
        .expect("open stream");
    assert_eq!(event.ids, vec![h.workflow.id]);

    let service_stage = &execution.stages[0];
    let service_step = &service_stage.steps[0];
    let approval_stage = &execution.stages[1];
    let approval_step = &approval_stage.steps[0];

    h.report(
        "Running",
        vec![
            (format!("stage-{}-enter", service_stage.id), "Succeeded"),
            (format!("step-{}-main", service_step.id), "Succeeded"),
            (format!("stage-{}-enter", approval_stage.id), "Running"),
            (format!("step-{}-main", approval_step.id), "Running"),
        ],
    )
    .await;

    let running = h.execution(execution.id).await;
    assert_eq!(running.status.state(), ExecutionState::Running);
    assert_eq!(running.stages[0].status.state(), ExecutionState::Succeeded);
    assert_eq!(running.stages[1].status.state(), ExecutionState::Running);
    assert_eq!(
        running.stages[1].steps[0].status.state(),
        ExecutionState::Running
    );

    h.engine
        .client()
        .resume(approval_step.id, &h.bob, true)
        .await
        .expect("approve");
    assert!(
        h.runner
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, RunnerCall::Resume { .. }))
    );

    h.report(
        "Succeeded",
        vec![
            (format!("stage-{}-enter", service_stage.id), "Succeeded"),
            (format!("step-{}-main", service_step.id), "Succeeded"),
            (format!("stage-{}-enter", approval_stage.id), "Succeeded"),
            (format!("step-{}-main", approval_step.id), "Succeeded"),
        ],
    )
    .await;

    let finished = h.execution(execution.id).await;
    assert_eq!(finished.status.state(), ExecutionState::Succeeded);
    for stage in &finished.stages {
        assert_eq!(stage.status.state(), ExecutionState::Succeeded);
    }

    h.engine
        .service()
        .rerun(execution.id, &h.alice)
        .await
        .expect("rerun");

    let rerun = h.execution(execution.id).await;
    assert_eq!(rerun.times, 2);
    assert_eq!(rerun.status.state(), ExecutionState::Pending);
    for stage in &rerun.stages {
        assert_eq!(stage.status.state(), ExecutionState::Pending);
        for step in &stage.steps {
            assert_eq!(step.status.state(), ExecutionState::Pending);
            assert_eq!(step.times, 2);
        }
    }
    assert!(h.runner.calls().await.iter().any(|c| matches!(
        c,
        RunnerCall::Resubmit {
            memoized: false,
            ..
        }
    )));
    // Previous object replaced by the resubmitted one.
    h.object_name().await;
}

#[tokio::test]
async fn test_rejection_fails_execution_with_approver_name() {
    let h = harness().await;
    let execution = h
        .engine
        .service()
        .run(&h.workflow, &RunOptions::default(), &h.alice)
        .await
        .expect("run");
    let approval_step = &execution.stages[1].steps[0];

    h.engine
        .client()
        .resume(approval_step.id, &h.bob, false)
        .await
        .expect("reject");
    assert!(h.runner.calls().await.iter().any(|c| matches!(
        c,
        RunnerCall::Stop { message, .. } if message == "rejected by bob"
    )));

    h.report(
        "Failed",
        vec![(format!("step-{}-main", approval_step.id), "Failed")],
    )
    .await;

    let loaded = h.execution(execution.id).await;
    let step = &loaded.stages[1].steps[0];
    assert_eq!(step.status.state(), ExecutionState::Failed);
    assert_eq!(step.status.summary.summary_status_message, "rejected by bob");
}

#[tokio::test]
async fn test_concurrent_runs_from_same_version_conflict() {
    let h = harness().await;
    h.engine
        .service()
        .run(&h.workflow, &RunOptions::default(), &h.alice)
        .await
        .expect("first run");

    let err = h
        .engine
        .service()
        .run(&h.workflow, &RunOptions::default(), &h.bob)
        .await
        .expect_err("stale version");
    assert!(err.is_conflict());
    assert_eq!(h.runner.objects().await.len(), 1);
}

#[tokio::test]
async fn test_racing_runs_from_same_version_admit_one() {
    let h = harness().await;
    let options = RunOptions::default();

    let (first, second) = tokio::join!(
        h.engine.service().run(&h.workflow, &options, &h.alice),
        h.engine.service().run(&h.workflow, &options, &h.bob),
    );

    let (won, lost) = match (first, second) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        (Ok(_), Ok(_)) => panic!("both runs were admitted"),
        (Err(a), Err(b)) => panic!("both runs failed: {a}, {b}"),
    };
    assert!(lost.is_conflict());
    assert_eq!(won.version, h.workflow.version + 1);

    let objects = h.runner.objects().await;
    assert_eq!(objects.len(), 1);
    assert_eq!(
        h.execution(won.id).await.runner_object,
        Some(objects[0].metadata.name.clone())
    );
}

#[tokio::test]
async fn test_rerun_is_not_failed_by_previous_attempt() {
    let h = harness().await;
    let execution = h
        .engine
        .service()
        .run(&h.workflow, &RunOptions::default(), &h.alice)
        .await
        .expect("run");
    let first_attempt = h.object_name().await;

    h.report("Failed", Vec::new()).await;
    assert_eq!(
        h.execution(execution.id).await.status.state(),
        ExecutionState::Failed
    );
    let stale = h
        .runner
        .object(&first_attempt)
        .await
        .expect("first attempt object");

    h.engine
        .service()
        .rerun(execution.id, &h.alice)
        .await
        .expect("rerun");
    assert_ne!(h.object_name().await, first_attempt);

    // The previous attempt's object is still seen once more.
    assert!(
        !h.engine
            .reconciler()
            .reconcile(&stale)
            .await
            .expect("reconcile")
    );
    assert_eq!(
        h.execution(execution.id).await.status.state(),
        ExecutionState::Pending
    );

    h.report("Running", Vec::new()).await;
    assert_eq!(
        h.execution(execution.id).await.status.state(),
        ExecutionState::Running
    );
}

#[tokio::test]
async fn test_terminate_then_delete() {
    let h = harness().await;
    let execution = h
        .engine
        .service()
        .run(&h.workflow, &RunOptions::default(), &h.alice)
        .await
        .expect("run");

    h.engine
        .client()
        .terminate(&execution)
        .await
        .expect("terminate");
    let canceling = h.execution(execution.id).await;
    assert_eq!(canceling.status.summary.summary_status, "Canceling");

    h.report("Failed", Vec::new()).await;
    let canceled = h.execution(execution.id).await;
    assert_eq!(canceled.status.state(), ExecutionState::Canceled);

    h.engine.client().delete(&canceled).await.expect("delete");
    h.engine.client().delete(&canceled).await.expect("idempotent");
    assert!(h.runner.objects().await.is_empty());
    assert!(h.secrets.is_empty().await);
}
