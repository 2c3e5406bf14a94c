// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`WorkflowEngine`] wires the execution client, the status syncer, the
//! run service and the reconciler over the given collaborators.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use walrus_workflow_engine::runtime::WorkflowEngine;
//!
//! let engine = WorkflowEngine::builder()
//!     .persistence(persistence)
//!     .runner(Arc::new(ArgoRunner::new(&config.runner_url, None)?))
//!     .secrets(Arc::new(secrets))
//!     .tokens(Arc::new(DatabaseTokenIssuer::new(persistence.clone())))
//!     .template_options(config.template_options())
//!     .build()?;
//!
//! let handle = engine.start();
//! let execution = engine.service().run(&workflow, &RunOptions::default(), &subject).await?;
//! handle.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;
use walrus_workflow::step::{ServiceStepOptions, StepRegistry};
use walrus_workflow::template::{TemplateManager, TemplateOptions};

use crate::client::{DEFAULT_TOKEN_TTL, ExecutionClient};
use crate::events::ChangeBus;
use crate::persistence::Persistence;
use crate::reconciler::{ReconcilerConfig, WorkflowReconciler};
use crate::runner::WorkflowRunner;
use crate::secrets::SecretStore;
use crate::service::WorkflowService;
use crate::syncer::StatusSyncer;
use crate::token::TokenIssuer;

/// Builder for creating a [`WorkflowEngine`].
pub struct WorkflowEngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    runner: Option<Arc<dyn WorkflowRunner>>,
    secrets: Option<Arc<dyn SecretStore>>,
    tokens: Option<Arc<dyn TokenIssuer>>,
    template_options: TemplateOptions,
    service_step_options: ServiceStepOptions,
    bus: ChangeBus,
    token_ttl: Duration,
    reconcile_interval: Duration,
}

impl Default for WorkflowEngineBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            runner: None,
            secrets: None,
            tokens: None,
            template_options: TemplateOptions::default(),
            service_step_options: ServiceStepOptions::default(),
            bus: ChangeBus::new(),
            token_ttl: DEFAULT_TOKEN_TTL,
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

impl WorkflowEngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the workflow runner (required).
    pub fn runner(mut self, runner: Arc<dyn WorkflowRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the secret store holding execution tokens (required).
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Set the token issuer (required).
    pub fn tokens(mut self, tokens: Arc<dyn TokenIssuer>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Set the settings substituted into generated workflows.
    ///
    /// `server_url` must be set.
    pub fn template_options(mut self, options: TemplateOptions) -> Self {
        self.template_options = options;
        self
    }

    /// Set the service step settings.
    pub fn service_step_options(mut self, options: ServiceStepOptions) -> Self {
        self.service_step_options = options;
        self
    }

    /// Share an existing change bus.
    pub fn bus(mut self, bus: ChangeBus) -> Self {
        self.bus = bus;
        self
    }

    /// Set the execution token lifetime.
    ///
    /// Default: 1 day
    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Set the reconciler poll interval.
    ///
    /// Default: 5 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkflowEngine> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;
        let secrets = self
            .secrets
            .ok_or_else(|| anyhow::anyhow!("secrets is required"))?;
        let tokens = self
            .tokens
            .ok_or_else(|| anyhow::anyhow!("tokens is required"))?;
        if self.template_options.server_url.is_empty() {
            anyhow::bail!("template_options.server_url is required");
        }

        let namespace = self.template_options.namespace.clone();
        let templates = Arc::new(TemplateManager::new(
            StepRegistry::with_builtin(self.service_step_options),
            self.template_options,
        ));

        let client = Arc::new(
            ExecutionClient::new(
                persistence.clone(),
                runner.clone(),
                secrets,
                tokens,
                templates,
                self.bus.clone(),
            )
            .with_token_ttl(self.token_ttl),
        );
        let syncer = Arc::new(StatusSyncer::new(
            persistence.clone(),
            runner.clone(),
            self.bus.clone(),
            namespace.clone(),
        ));
        let service = Arc::new(WorkflowService::new(
            persistence,
            client.clone(),
            self.bus.clone(),
        ));
        let reconciler = Arc::new(WorkflowReconciler::new(
            runner,
            syncer.clone(),
            ReconcilerConfig {
                poll_interval: self.reconcile_interval,
                namespace,
            },
        ));

        Ok(WorkflowEngine {
            service,
            client,
            syncer,
            reconciler,
            bus: self.bus,
        })
    }
}

/// The assembled engine.
pub struct WorkflowEngine {
    service: Arc<WorkflowService>,
    client: Arc<ExecutionClient>,
    syncer: Arc<StatusSyncer>,
    reconciler: Arc<WorkflowReconciler>,
    bus: ChangeBus,
}

impl WorkflowEngine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new()
    }

    /// Run and rerun entrypoints.
    pub fn service(&self) -> &Arc<WorkflowService> {
        &self.service
    }

    /// Execution client for resume, terminate, delete and logs.
    pub fn client(&self) -> &Arc<ExecutionClient> {
        &self.client
    }

    /// Status syncer, also the handler of status report callbacks.
    pub fn syncer(&self) -> &Arc<StatusSyncer> {
        &self.syncer
    }

    /// Change notifications.
    pub fn events(&self) -> &ChangeBus {
        &self.bus
    }

    /// Reconciler, for driving single passes.
    pub fn reconciler(&self) -> &Arc<WorkflowReconciler> {
        &self.reconciler
    }

    /// Spawn the reconciler loop.
    pub fn start(&self) -> EngineHandle {
        let reconciler = self.reconciler.clone();
        let shutdown = reconciler.shutdown_handle();
        let handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        info!("Workflow engine started");
        EngineHandle { handle, shutdown }
    }
}

/// Handle of a started engine.
pub struct EngineHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl EngineHandle {
    /// Stop the reconciler and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Workflow engine shutting down...");
        self.shutdown.notify_one();
        self.handle.await?;
        info!("Workflow engine stopped");
        Ok(())
    }
}
