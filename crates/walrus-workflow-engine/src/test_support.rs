// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for unit tests.

use std::sync::Arc;

use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use walrus_workflow::model::{
    Subject, Workflow, WorkflowExecution, WorkflowStage, WorkflowStageExecution, WorkflowStep,
    WorkflowStepExecution, WorkflowType, WorkflowVariable,
};
use walrus_workflow::step::{ServiceStepOptions, StepRegistry};
use walrus_workflow::template::{TemplateManager, TemplateOptions};

use crate::client::ExecutionClient;
use crate::events::ChangeBus;
use crate::migrations;
use crate::persistence::{Persistence, SqlitePersistence};
use crate::runner::MockRunner;
use crate::secrets::MockSecretStore;
use crate::service::{RunOptions, WorkflowService, build_execution};
use crate::token::StaticTokenIssuer;

/// Subject IDs of the first two subjects created in a fresh database.
pub const APPROVER_IDS: [i64; 2] = [1, 2];

/// Two stages, a service step then an approval step.
pub fn sample_workflow() -> Workflow {
    Workflow {
        id: 0,
        name: "deploy".to_string(),
        description: "deploy web".to_string(),
        project_id: 10,
        environment_id: None,
        workflow_type: WorkflowType::Default,
        parallelism: 0,
        timeout: 0,
        version: 0,
        variables: vec![
            WorkflowVariable {
                name: "release".to_string(),
                value: "web".to_string(),
                overwrite: true,
                description: String::new(),
            },
            WorkflowVariable {
                name: "region".to_string(),
                value: "us".to_string(),
                overwrite: false,
                description: String::new(),
            },
        ],
        stages: vec![
            WorkflowStage {
                id: 0,
                workflow_id: 0,
                project_id: 10,
                name: "build".to_string(),
                order: 0,
                dependencies: Vec::new(),
                steps: vec![step("web", "service", json!({
                    "environmentID": "301",
                    "name": "${workflow.var.release}",
                }))],
            },
            WorkflowStage {
                id: 0,
                workflow_id: 0,
                project_id: 10,
                name: "release".to_string(),
                order: 1,
                dependencies: Vec::new(),
                steps: vec![step("sign-off", "approval", json!({
                    "approvalType": "or",
                    "approvalUsers": APPROVER_IDS,
                }))],
            },
        ],
    }
}

fn step(name: &str, step_type: &str, attributes: serde_json::Value) -> WorkflowStep {
    WorkflowStep {
        id: 0,
        workflow_id: 0,
        workflow_stage_id: 0,
        project_id: 10,
        name: name.to_string(),
        step_type: step_type.to_string(),
        attributes: match attributes {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        },
        retry_strategy: None,
        timeout: 0,
        order: 0,
        dependencies: Vec::new(),
    }
}

/// Unsaved execution of a stored workflow.
pub fn sample_execution(workflow: &Workflow, subject: &Subject) -> WorkflowExecution {
    build_execution(workflow, &RunOptions::default(), subject).expect("build execution")
}

/// Migrated in-memory SQLite persistence.
pub async fn sqlite_persistence() -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    migrations::SQLITE
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Arc::new(SqlitePersistence::new(pool))
}

/// Template manager with the built-in steps.
pub fn template_manager() -> TemplateManager {
    TemplateManager::new(
        StepRegistry::with_builtin(ServiceStepOptions::default()),
        TemplateOptions {
            server_url: "https://walrus.example.com".to_string(),
            ..Default::default()
        },
    )
}

/// Engine parts over in-memory collaborators, with one stored execution.
pub struct Fixture {
    pub persistence: Arc<SqlitePersistence>,
    pub runner: MockRunner,
    pub secrets: MockSecretStore,
    pub tokens: StaticTokenIssuer,
    pub bus: ChangeBus,
    pub client: Arc<ExecutionClient>,
    pub service: WorkflowService,
    /// Triggers runs, also an approver
    pub subject: Subject,
    /// Second approver
    pub approver: Subject,
    /// Stored, not submitted
    pub execution: WorkflowExecution,
}

pub async fn fixture() -> Fixture {
    let persistence = sqlite_persistence().await;
    let subject = persistence.create_subject("alice").await.expect("alice");
    let approver = persistence.create_subject("bob").await.expect("bob");
    assert_eq!([subject.id, approver.id], APPROVER_IDS);

    let workflow = persistence
        .create_workflow(&sample_workflow())
        .await
        .expect("create workflow");
    let execution = persistence
        .create_execution(&sample_execution(&workflow, &subject), workflow.version)
        .await
        .expect("create execution");

    let runner = MockRunner::new();
    let secrets = MockSecretStore::new();
    let tokens = StaticTokenIssuer::new();
    let bus = ChangeBus::new();

    let client = Arc::new(ExecutionClient::new(
        persistence.clone(),
        Arc::new(runner.clone()),
        Arc::new(secrets.clone()),
        Arc::new(tokens.clone()),
        Arc::new(template_manager()),
        bus.clone(),
    ));
    let service = WorkflowService::new(persistence.clone(), client.clone(), bus.clone());

    Fixture {
        persistence,
        runner,
        secrets,
        tokens,
        bus,
        client,
        service,
        subject,
        approver,
        execution,
    }
}

impl Fixture {
    pub async fn workflow(&self) -> Workflow {
        self.persistence
            .get_workflow(self.execution.workflow_id)
            .await
            .expect("get workflow")
            .expect("workflow exists")
    }

    pub async fn stage(&self, id: i64) -> WorkflowStageExecution {
        self.persistence
            .get_stage_execution(id)
            .await
            .expect("get stage")
            .expect("stage exists")
    }

    pub async fn step(&self, id: i64) -> WorkflowStepExecution {
        self.persistence
            .get_step_execution(id)
            .await
            .expect("get step")
            .expect("step exists")
    }

    /// Switch the approval step between `or` and `and`.
    pub async fn set_approval_type(&mut self, approval_type: &str) {
        let step = &mut self.execution.stages[1].steps[0];
        step.attributes
            .insert("approvalType".to_string(), json!(approval_type));
        self.persistence
            .update_step_attributes(step.id, &step.attributes)
            .await
            .expect("update approval step");
    }
}
