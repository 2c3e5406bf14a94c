// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for walrus-workflow-engine.

use std::path::PathBuf;
use std::time::Duration;

use walrus_workflow::TemplateOptions;
use walrus_workflow::step::ServiceStepOptions;

const DEFAULT_RUNNER_URL: &str = "https://argo-server.walrus-system:2746";
const DEFAULT_KUBE_API_URL: &str = "https://kubernetes.default.svc";
const DEFAULT_KUBE_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://` or `sqlite:` URL
    pub database_url: String,
    /// API base URL status callbacks are sent to
    pub server_url: String,
    /// Whether callbacks verify the API's TLS certificate
    pub tls_verify: bool,
    /// Argo server base URL
    pub runner_url: String,
    /// Optional bearer token for the Argo server
    pub runner_token: Option<String>,
    /// Kubernetes API base URL
    pub kube_api_url: String,
    /// File holding the Kubernetes bearer token
    pub kube_token_file: PathBuf,
    /// Namespace of runner objects and execution secrets
    pub system_namespace: String,
    /// Service account workflow pods run as
    pub service_account: String,
    /// Image of service step containers
    pub step_image: String,
    /// Poll interval of the reconciler
    pub reconcile_interval: Duration,
    /// Lifetime of execution tokens
    pub token_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WALRUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WALRUS_DATABASE_URL"))?;
        let server_url = std::env::var("WALRUS_SERVER_URL")
            .map_err(|_| ConfigError::Missing("WALRUS_SERVER_URL"))?;

        let tls_verify = match std::env::var("WALRUS_TLS_VERIFY") {
            Ok(v) => parse_bool(&v).ok_or(ConfigError::Invalid(
                "WALRUS_TLS_VERIFY",
                "expected true or false",
            ))?,
            Err(_) => true,
        };

        let reconcile_interval = Duration::from_secs(parse_secs(
            "WALRUS_RECONCILE_INTERVAL_SECS",
            5,
        )?);
        let token_ttl = Duration::from_secs(parse_secs("WALRUS_TOKEN_TTL_SECS", 86_400)?);

        Ok(Self {
            database_url,
            server_url: server_url.trim_end_matches('/').to_string(),
            tls_verify,
            runner_url: env_or("WALRUS_RUNNER_URL", DEFAULT_RUNNER_URL),
            runner_token: std::env::var("WALRUS_RUNNER_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            kube_api_url: env_or("WALRUS_KUBE_API_URL", DEFAULT_KUBE_API_URL),
            kube_token_file: PathBuf::from(env_or(
                "WALRUS_KUBE_TOKEN_FILE",
                DEFAULT_KUBE_TOKEN_FILE,
            )),
            system_namespace: env_or("WALRUS_SYSTEM_NAMESPACE", "walrus-system"),
            service_account: env_or("WALRUS_SERVICE_ACCOUNT", "walrus-workflow"),
            step_image: env_or("WALRUS_STEP_IMAGE", "curlimages/curl:8.5.0"),
            reconcile_interval,
            token_ttl,
        })
    }

    /// Options handed to the template manager.
    pub fn template_options(&self) -> TemplateOptions {
        TemplateOptions {
            server_url: self.server_url.clone(),
            tls_verify: self.tls_verify,
            namespace: self.system_namespace.clone(),
            service_account: self.service_account.clone(),
        }
    }

    /// Options handed to the service step generator.
    pub fn service_step_options(&self) -> ServiceStepOptions {
        ServiceStepOptions {
            image: self.step_image.clone(),
            ..Default::default()
        }
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_secs(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(key, "expected a positive number of seconds")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
