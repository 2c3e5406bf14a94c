// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution client.
//!
//! Drives a workflow execution through the runner: submission, approval
//! resumes, reruns, termination, deletion and log retrieval. Every runner
//! object carries a short-lived bearer token that its callback nodes use to
//! report status back. The token lives in a per-execution secret owned by the
//! runner object, and it is rotated whenever the object is about to make
//! progress after a wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use walrus_workflow::approval::ApprovalSpec;
use walrus_workflow::definition::{API_VERSION, KIND, OwnerReference, Workflow as RunnerWorkflow};
use walrus_workflow::model::{Subject, WorkflowExecution};
use walrus_workflow::naming::{
    STEP_EXECUTION_ID_LABEL, WORKFLOW_EXECUTION_ID_LABEL, execution_secret_name, step_main_selector,
};
use walrus_workflow::placeholder::params;
use walrus_workflow::status::{ConditionType, ExecutionState};
use walrus_workflow::step::STEP_TYPE_APPROVAL;
use walrus_workflow::template::{SECRET_TOKEN_KEY, TemplateManager};

use crate::error::{Error, Result};
use crate::events::{ChangeBus, Topic};
use crate::persistence::Persistence;
use crate::reset::reset_execution;
use crate::runner::{LogOptions, LogStream, ResubmitOptions, WorkflowRunner, current_object};
use crate::secrets::{Secret, SecretStore};
use crate::token::{TOKEN_KIND_DEPLOYMENT, TokenIssuer, execution_token_name};

/// Default lifetime of execution tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Operations on the runner side of an execution.
#[async_trait]
pub trait Client: Send + Sync {
    /// Submit a stored execution to the runner.
    ///
    /// A failure is recorded as a failed execution status before the error
    /// is returned.
    async fn submit(&self, execution: &WorkflowExecution, subject: &Subject) -> Result<()>;

    /// Record `subject`'s vote on a suspended approval step and resume or
    /// stop the step once the vote decides it.
    async fn resume(&self, step_execution_id: i64, subject: &Subject, approve: bool) -> Result<()>;

    /// Run a finished execution again.
    ///
    /// The next attempt's runner object is created first. The records are
    /// then reset to pending and handed over to that object.
    async fn resubmit(&self, execution: &WorkflowExecution, subject: &Subject) -> Result<()>;

    /// Terminate a running execution. Absence of the runner object is benign.
    async fn terminate(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Delete the runner object and the execution secret. Absence is benign.
    async fn delete(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Main container logs of a step.
    async fn get_logs(&self, execution: &WorkflowExecution, step_execution_id: i64) -> Result<String>;

    /// Stream the main container logs of a step.
    async fn stream_logs(
        &self,
        execution: &WorkflowExecution,
        step_execution_id: i64,
        follow: bool,
    ) -> Result<LogStream>;
}

/// [`Client`] backed by a [`WorkflowRunner`], a [`SecretStore`] and a
/// [`TokenIssuer`].
pub struct ExecutionClient {
    persistence: Arc<dyn Persistence>,
    runner: Arc<dyn WorkflowRunner>,
    secrets: Arc<dyn SecretStore>,
    tokens: Arc<dyn TokenIssuer>,
    templates: Arc<TemplateManager>,
    bus: ChangeBus,
    token_ttl: Duration,
}

impl ExecutionClient {
    /// Create a client. Objects and secrets live in the template manager's
    /// namespace.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runner: Arc<dyn WorkflowRunner>,
        secrets: Arc<dyn SecretStore>,
        tokens: Arc<dyn TokenIssuer>,
        templates: Arc<TemplateManager>,
        bus: ChangeBus,
    ) -> Self {
        Self {
            persistence,
            runner,
            secrets,
            tokens,
            templates,
            bus,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Override the token lifetime.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    fn namespace(&self) -> &str {
        &self.templates.options().namespace
    }

    async fn issue_token(&self, execution: &WorkflowExecution, subject: &Subject) -> Result<String> {
        let name = execution_token_name(execution.id, Utc::now());
        let token = self
            .tokens
            .create_access_token(subject.id, TOKEN_KIND_DEPLOYMENT, &name, self.token_ttl)
            .await?;
        Ok(token.value)
    }

    /// Store `token` in the execution secret, creating it if needed.
    async fn store_token(&self, execution_id: i64, token: &str) -> Result<()> {
        let name = execution_secret_name(execution_id);
        let secret = Secret::with_entry(self.namespace(), &name, SECRET_TOKEN_KEY, token);

        match self.secrets.create(&secret).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                let Some(mut existing) = self.secrets.get(self.namespace(), &name).await? else {
                    return Err(e);
                };
                existing
                    .data
                    .insert(SECRET_TOKEN_KEY.to_string(), token.to_string());
                self.secrets.update(&existing).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Issue a fresh token and store it in the execution secret.
    async fn rotate_token(&self, execution: &WorkflowExecution, subject: &Subject) -> Result<String> {
        let token = self.issue_token(execution, subject).await?;
        self.store_token(execution.id, &token).await?;
        debug!(execution_id = execution.id, "Execution token rotated");
        Ok(token)
    }

    async fn own_secret(&self, execution_id: i64, object: &RunnerWorkflow) -> Result<()> {
        let owner = OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: object.metadata.name.clone(),
            uid: object.metadata.uid.clone().unwrap_or_default(),
        };
        self.secrets
            .set_owner(self.namespace(), &execution_secret_name(execution_id), &owner)
            .await
    }

    /// The live runner object of an execution.
    async fn current(&self, execution_id: i64) -> Result<Option<RunnerWorkflow>> {
        let selector = format!("{WORKFLOW_EXECUTION_ID_LABEL}={execution_id}");
        let objects = self.runner.list_workflows(self.namespace(), &selector).await?;
        Ok(current_object(objects))
    }

    async fn require_current(&self, execution_id: i64) -> Result<RunnerWorkflow> {
        self.current(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("runner workflow of execution {execution_id}")))
    }

    /// Create the runner object. The execution does not own it yet.
    async fn try_submit(
        &self,
        execution: &WorkflowExecution,
        subject: &Subject,
    ) -> Result<RunnerWorkflow> {
        let token = self.issue_token(execution, subject).await?;
        let workflow = self.templates.to_runner_workflow(execution, &token)?;

        self.store_token(execution.id, &token).await?;
        let created = self.runner.create_workflow(self.namespace(), &workflow).await?;
        self.own_secret(execution.id, &created).await?;

        info!(
            execution_id = execution.id,
            name = %created.metadata.name,
            "Workflow execution submitted"
        );
        Ok(created)
    }

    /// Start the next attempt from the previous runner object, or from
    /// scratch when it is gone. Returns the object of the new attempt.
    async fn try_resubmit(
        &self,
        execution: &WorkflowExecution,
        subject: &Subject,
    ) -> Result<RunnerWorkflow> {
        let Some(previous) = self.current(execution.id).await? else {
            debug!(execution_id = execution.id, "No runner workflow left, submitting afresh");
            return self.try_submit(execution, subject).await;
        };

        let token = self.rotate_token(execution, subject).await?;
        let options = ResubmitOptions {
            memoized: false,
            parameters: vec![format!("{}={token}", params::TOKEN)],
        };
        let created = self
            .runner
            .resubmit_workflow(self.namespace(), &previous.metadata.name, &options)
            .await?;
        self.own_secret(execution.id, &created).await?;

        match self
            .runner
            .delete_workflow(self.namespace(), &previous.metadata.name)
            .await
        {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        info!(
            execution_id = execution.id,
            name = %created.metadata.name,
            previous = %previous.metadata.name,
            "Workflow execution resubmitted"
        );
        Ok(created)
    }

    /// Persist a failed execution status after a runner side failure.
    async fn record_failure(&self, execution_id: i64, error: &Error) -> Result<()> {
        let Some(mut execution) = self.persistence.get_execution(execution_id).await? else {
            return Ok(());
        };
        execution.status.apply(ExecutionState::Failed, &error.to_string());
        self.persistence.update_execution(&execution).await?;
        self.bus.publish_update(Topic::WorkflowExecution, execution.id);
        Ok(())
    }

    async fn fail(&self, execution_id: i64, error: Error) -> Error {
        warn!(execution_id, error = %error, "Workflow execution submission failed");
        if let Err(e) = self.record_failure(execution_id, &error).await {
            warn!(execution_id, error = %e, "Failed to record submission failure");
        }
        error
    }

    fn step_log_options(step_execution_id: i64) -> LogOptions {
        LogOptions::main(format!("{STEP_EXECUTION_ID_LABEL}={step_execution_id}"))
    }
}

#[async_trait]
impl Client for ExecutionClient {
    #[instrument(skip(self, execution, subject), fields(execution_id = execution.id))]
    async fn submit(&self, execution: &WorkflowExecution, subject: &Subject) -> Result<()> {
        let error = match self.try_submit(execution, subject).await {
            Ok(created) => match self
                .persistence
                .set_runner_object(execution.id, &created.metadata.name)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            },
            Err(e) => e,
        };

        let secret = execution_secret_name(execution.id);
        if let Err(e) = self.secrets.delete(self.namespace(), &secret).await {
            warn!(execution_id = execution.id, error = %e, "Failed to clean up execution secret");
        }
        Err(self.fail(execution.id, error).await)
    }

    #[instrument(skip(self, subject), fields(subject = %subject.name))]
    async fn resume(&self, step_execution_id: i64, subject: &Subject, approve: bool) -> Result<()> {
        let mut step = self
            .persistence
            .get_step_execution(step_execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workflow step execution {step_execution_id}")))?;

        if step.step_type != STEP_TYPE_APPROVAL {
            return Err(Error::InvalidRequest(format!(
                "cannot resume workflow step execution of type {}",
                step.step_type
            )));
        }

        let mut spec = ApprovalSpec::from_attributes(&step.attributes)?;
        spec.set_user_approval(subject.id, approve)?;

        step.attributes = spec.merge_into(&step.attributes)?;
        self.persistence
            .update_step_attributes(step.id, &step.attributes)
            .await?;
        self.bus
            .publish_update(Topic::WorkflowExecution, step.workflow_execution_id);

        let selector = step_main_selector(step.id);

        if spec.is_rejected() {
            let object = self.require_current(step.workflow_execution_id).await?;
            let message = format!("rejected by {}", subject.name);
            self.runner
                .stop_workflow(self.namespace(), &object.metadata.name, &selector, &message)
                .await?;
            info!(step_execution_id, "Approval rejected, workflow stopped");
            return Ok(());
        }

        if !spec.is_approved() {
            debug!(step_execution_id, "Approval recorded, waiting for other approvers");
            return Ok(());
        }

        let execution = self
            .persistence
            .get_execution(step.workflow_execution_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("workflow execution {}", step.workflow_execution_id))
            })?;
        let object = self.require_current(execution.id).await?;

        self.rotate_token(&execution, subject).await?;
        self.runner
            .resume_workflow(self.namespace(), &object.metadata.name, &selector)
            .await?;

        info!(step_execution_id, "Approval granted, workflow resumed");
        Ok(())
    }

    #[instrument(skip(self, execution, subject), fields(execution_id = execution.id))]
    async fn resubmit(&self, execution: &WorkflowExecution, subject: &Subject) -> Result<()> {
        let created = match self.try_resubmit(execution, subject).await {
            Ok(created) => created,
            Err(error) => return Err(self.fail(execution.id, error).await),
        };

        // Pending records and the new owner land in one transaction.
        let mut next = execution.clone();
        next.runner_object = Some(created.metadata.name);
        reset_execution(self.persistence.as_ref(), &self.bus, &next).await?;
        Ok(())
    }

    #[instrument(skip(self, execution), fields(execution_id = execution.id))]
    async fn terminate(&self, execution: &WorkflowExecution) -> Result<()> {
        if let Some(mut stored) = self.persistence.get_execution(execution.id).await? {
            if !stored.status.is_finished() {
                stored.status.reset(ConditionType::Canceled, "");
                self.persistence.update_execution(&stored).await?;
                self.bus.publish_update(Topic::WorkflowExecution, stored.id);
            }
        }

        let Some(object) = self.current(execution.id).await? else {
            debug!("No runner workflow to terminate");
            return Ok(());
        };
        match self
            .runner
            .terminate_workflow(self.namespace(), &object.metadata.name)
            .await
        {
            Err(e) if !e.is_not_found() => Err(e),
            _ => {
                info!(name = %object.metadata.name, "Workflow execution terminated");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, execution), fields(execution_id = execution.id))]
    async fn delete(&self, execution: &WorkflowExecution) -> Result<()> {
        let selector = format!("{WORKFLOW_EXECUTION_ID_LABEL}={}", execution.id);
        for object in self.runner.list_workflows(self.namespace(), &selector).await? {
            match self
                .runner
                .delete_workflow(self.namespace(), &object.metadata.name)
                .await
            {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => debug!(name = %object.metadata.name, "Runner workflow deleted"),
            }
        }

        self.secrets
            .delete(self.namespace(), &execution_secret_name(execution.id))
            .await
    }

    async fn get_logs(&self, execution: &WorkflowExecution, step_execution_id: i64) -> Result<String> {
        let object = self.require_current(execution.id).await?;
        self.runner
            .get_logs(
                self.namespace(),
                &object.metadata.name,
                &Self::step_log_options(step_execution_id),
            )
            .await
    }

    async fn stream_logs(
        &self,
        execution: &WorkflowExecution,
        step_execution_id: i64,
        follow: bool,
    ) -> Result<LogStream> {
        let object = self.require_current(execution.id).await?;
        self.runner
            .stream_logs(
                self.namespace(),
                &object.metadata.name,
                &Self::step_log_options(step_execution_id).follow(follow),
            )
            .await
    }
}
