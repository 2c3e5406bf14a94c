// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Walrus Workflow Engine
//!
//! Standalone process running the reconciler against an Argo server:
//! - runner object status is synced into execution records
//! - execution tokens live in Kubernetes secrets

use std::sync::Arc;

use tracing::{info, warn};

use walrus_workflow_engine::WorkflowEngine;
use walrus_workflow_engine::config::Config;
use walrus_workflow_engine::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use walrus_workflow_engine::runner::ArgoRunner;
use walrus_workflow_engine::secrets::KubeSecretStore;
use walrus_workflow_engine::token::DatabaseTokenIssuer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,walrus_workflow_engine=debug".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        runner_url = %config.runner_url,
        server_url = %config.server_url,
        namespace = %config.system_namespace,
        "Starting Walrus Workflow Engine"
    );

    // Connect to database, migrations run on connect
    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        Arc::new(SqlitePersistence::connect(&config.database_url).await?)
    } else {
        Arc::new(PostgresPersistence::connect(&config.database_url).await?)
    };
    persistence.health_check_db().await?;

    info!("Connected to database");

    let runner = Arc::new(ArgoRunner::new(
        &config.runner_url,
        config.runner_token.as_deref(),
    )?);
    let secrets = Arc::new(
        KubeSecretStore::from_token_file(&config.kube_api_url, &config.kube_token_file).await?,
    );
    let tokens = Arc::new(DatabaseTokenIssuer::new(persistence.clone()));

    let engine = WorkflowEngine::builder()
        .persistence(persistence)
        .runner(runner)
        .secrets(secrets)
        .tokens(tokens)
        .template_options(config.template_options())
        .service_step_options(config.service_step_options())
        .token_ttl(config.token_ttl)
        .reconcile_interval(config.reconcile_interval)
        .build()?;

    let handle = engine.start();

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown().await?;

    info!("Walrus Workflow Engine shut down");

    Ok(())
}
