// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Walrus Workflow Engine - Execution Lifecycle Management
//!
//! This crate drives workflow executions through an external DAG runner.
//! It turns stored workflow definitions into runner objects, keeps the
//! execution records in sync with the runner, and handles approvals,
//! termination and reruns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       API layer (embedder)                        │
//! └──────────────────────────────────────────────────────────────────┘
//!          │ run / rerun            │ resume / terminate / logs
//!          ▼                        ▼
//! ┌──────────────────┐    ┌──────────────────┐    ┌────────────────┐
//! │ WorkflowService  │───►│ ExecutionClient  │───►│ TemplateManager│
//! └──────────────────┘    └──────────────────┘    └────────────────┘
//!          │                   │          │
//!          ▼                   ▼          ▼
//! ┌──────────────────┐  ┌────────────┐  ┌──────────────┐
//! │   Persistence    │  │  Runner    │  │ Secret store │
//! │ (Postgres/SQLite)│  │ (Argo API) │  │  (Kube API)  │
//! └──────────────────┘  └────────────┘  └──────────────┘
//!          ▲                   │
//!          │                   ▼
//! ┌──────────────────┐  ┌────────────────────┐
//! │   StatusSyncer   │◄─│ WorkflowReconciler │
//! └──────────────────┘  └────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Entry point |
//! |-----------|-------------|
//! | Run | [`service::WorkflowService::run`] |
//! | Rerun | [`service::WorkflowService::rerun`] |
//! | Submit | [`client::Client::submit`] |
//! | Resume (approve/reject) | [`client::Client::resume`] |
//! | Resubmit | [`client::Client::resubmit`] |
//! | Terminate | [`client::Client::terminate`] |
//! | Delete | [`client::Client::delete`] |
//! | Step logs | [`client::Client::get_logs`], [`client::Client::stream_logs`] |
//! | Status reports | [`syncer::StatusSyncer::apply_report`] |
//! | Status reset | [`reset::reset_execution`] |
//!
//! Every record change is published on the [`events::ChangeBus`].

#![deny(missing_docs)]

/// Execution client: submit, resume, resubmit, terminate, delete, logs.
pub mod client;
/// Configuration loading.
pub mod config;
/// Error types.
pub mod error;
/// Change notifications.
pub mod events;
pub(crate) mod http;
/// Embedded database migrations.
pub mod migrations;
/// Persistence of workflows and execution records.
pub mod persistence;
/// Background reconciliation of runner objects.
pub mod reconciler;
/// Execution status reset.
pub mod reset;
/// Runner backends.
pub mod runner;
/// Engine assembly.
pub mod runtime;
/// Execution token secrets.
pub mod secrets;
/// Run and rerun.
pub mod service;
/// Runner status to execution record sync.
pub mod syncer;
/// Execution token issuance.
pub mod token;

#[cfg(test)]
mod test_support;

pub use client::{Client, ExecutionClient};
pub use error::{Error, Result};
pub use runtime::{EngineHandle, WorkflowEngine, WorkflowEngineBuilder};
pub use service::{RunOptions, WorkflowService};
pub use syncer::{ReportTarget, StatusReport, StatusSyncer};
