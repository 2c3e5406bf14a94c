// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner workflow object model.
//!
//! A serde mirror of the subset of the Argo Workflows `v1alpha1` API that is
//! generated here and read back during reconciliation. Field names follow the
//! runner's camelCase wire format.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API group/version of runner workflow objects.
pub const API_VERSION: &str = "argoproj.io/v1alpha1";
/// Kind of runner workflow objects.
pub const KIND: &str = "Workflow";

// ============================================================================
// Object
// ============================================================================

/// A runner workflow object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Always [`API_VERSION`]
    #[serde(default)]
    pub api_version: String,
    /// Always [`KIND`]
    #[serde(default)]
    pub kind: String,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default)]
    pub spec: WorkflowSpec,
    /// Observed state, filled by the runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
}

impl Workflow {
    /// Whether a shutdown (stop or terminate) was requested on the object.
    pub fn is_shutdown_requested(&self) -> bool {
        self.spec.shutdown.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Whether the object is being deleted.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Look up a template by name.
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.spec.templates.iter().find(|t| t.name == name)
    }
}

/// Kubernetes object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name
    #[serde(default)]
    pub name: String,
    /// Object namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Server-assigned UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Server-assigned version used for change detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Server-assigned creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Owners whose deletion garbage-collects this object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Set once deletion started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Reference to an owning object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Owner API version
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner UID
    pub uid: String,
}

// ============================================================================
// Spec
// ============================================================================

/// Workflow spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Template run first
    #[serde(default)]
    pub entrypoint: String,
    /// Global parameters
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// All templates
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Exit handler template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,
    /// Whole-workflow deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    /// Maximum concurrently running pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i64>,
    /// Service account pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Pod security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    /// Cleanup policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_strategy: Option<TtlStrategy>,
    /// `Stop` or `Terminate` once shutdown was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<String>,
}

/// Pod security context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityContext {
    /// Refuse to run as root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    /// UID of the container process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
}

/// Cleanup policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
    /// Delete the object this long after completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_after_completion: Option<i32>,
}

/// Parameter list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    /// Parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

impl Arguments {
    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Build from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            parameters: pairs
                .into_iter()
                .map(|(k, v)| Parameter::with_value(k, v))
                .collect(),
        }
    }

    /// Value of a parameter.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.value.as_deref())
    }
}

/// Template inputs.
pub type Inputs = Arguments;

/// Template outputs.
pub type Outputs = Arguments;

/// A named parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    /// Name
    pub name: String,
    /// Literal value or default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Source of an output value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

impl Parameter {
    /// Parameter without a default; the caller must supply it.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parameter with a value.
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }
}

/// Where an output parameter value comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    /// JSON path into a fetched resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
}

// ============================================================================
// Templates
// ============================================================================

/// A reusable unit of execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template name
    pub name: String,
    /// Input parameters
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub inputs: Inputs,
    /// Output parameters
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub outputs: Outputs,
    /// Pod metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    /// DAG body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagTemplate>,
    /// Sequential groups of parallel steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Vec<WorkflowStep>>,
    /// HTTP request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<Http>,
    /// Script body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptTemplate>,
    /// Suspend body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<SuspendTemplate>,
    /// Resource body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceTemplate>,
    /// Retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    /// Deadline, e.g. `"30s"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Pod labels and annotations of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// DAG body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagTemplate {
    /// Tasks
    #[serde(default)]
    pub tasks: Vec<DagTask>,
}

/// A DAG node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagTask {
    /// Task name, becomes the node display name
    pub name: String,
    /// Referenced template
    pub template: String,
    /// Arguments
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Names of tasks that must finish first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Lifecycle hooks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, LifecycleHook>,
}

/// A node in a steps template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name, becomes the node display name
    pub name: String,
    /// Referenced template
    pub template: String,
    /// Arguments
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Lifecycle hooks keyed by `succeeded`, `failed`, `error`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, LifecycleHook>,
}

/// Conditional follow-up of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleHook {
    /// Template to run
    pub template: String,
    /// Arguments
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Guard expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// HTTP request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Http {
    /// Request URL
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,
    /// Request timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    /// Request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Expression deciding success from the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    /// Skip TLS verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// One HTTP header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// Script body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTemplate {
    /// Container image
    pub image: String,
    /// Interpreter
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Script source
    pub source: String,
    /// Environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Container environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value, may contain placeholders
    pub value: String,
}

impl EnvVar {
    /// Create an env var.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Suspend body. An empty body waits for an external resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendTemplate {
    /// Auto-resume after this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Kubernetes resource operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    /// `get`, `create`, `apply`, ...
    pub action: String,
    /// YAML manifest
    pub manifest: String,
}

/// When a failed node is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Retry on any unsuccessful outcome.
    Always,
    /// Retry when the node failed.
    OnFailure,
    /// Retry when the node errored.
    OnError,
    /// Retry on transient errors.
    OnTransientError,
}

/// Retry policy of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Maximum retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
    /// Retry condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Backoff between retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

/// Exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Initial delay, seconds as string or a duration like `"10s"`
    pub duration: String,
    /// Multiplier between retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<i32>,
    /// Give up after this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

// ============================================================================
// Status
// ============================================================================

/// Observed workflow state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Wire phase, see [`WorkflowStatus::phase`]
    #[serde(default, rename = "phase")]
    pub raw_phase: String,
    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Nodes keyed by node ID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeStatus>,
}

impl WorkflowStatus {
    /// Parsed phase.
    pub fn phase(&self) -> WorkflowPhase {
        WorkflowPhase::from_wire(&self.raw_phase)
    }
}

/// Workflow phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    /// Not yet picked up, or a phase not known here.
    Unknown,
    /// Queued.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
    /// Could not execute.
    Error,
}

impl WorkflowPhase {
    /// Parse the wire string.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "Pending" => WorkflowPhase::Pending,
            "Running" => WorkflowPhase::Running,
            "Succeeded" => WorkflowPhase::Succeeded,
            "Failed" => WorkflowPhase::Failed,
            "Error" => WorkflowPhase::Error,
            _ => WorkflowPhase::Unknown,
        }
    }
}

/// Observed node state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node ID
    #[serde(default)]
    pub id: String,
    /// Fully qualified node name
    #[serde(default)]
    pub name: String,
    /// Short name, the task or step name that produced the node
    #[serde(default)]
    pub display_name: String,
    /// Node type, e.g. `Pod`, `DAG`, `Steps`, `Suspend`
    #[serde(default, rename = "type")]
    pub node_type: String,
    /// Template the node ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    /// Wire phase, see [`NodeStatus::phase`]
    #[serde(default, rename = "phase")]
    pub raw_phase: String,
    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeStatus {
    /// Parsed phase.
    pub fn phase(&self) -> NodePhase {
        NodePhase::from_wire(&self.raw_phase)
    }

    /// Whether the node reached a final phase.
    pub fn is_completed(&self) -> bool {
        matches!(
            self.phase(),
            NodePhase::Succeeded
                | NodePhase::Failed
                | NodePhase::Error
                | NodePhase::Skipped
                | NodePhase::Omitted
        )
    }
}

/// Node phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    /// A phase not known here.
    Unknown,
    /// Waiting to run.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Not run because of a `when` condition.
    Skipped,
    /// Finished unsuccessfully.
    Failed,
    /// Could not execute.
    Error,
    /// Not run because of an upstream failure.
    Omitted,
}

impl NodePhase {
    /// Parse the wire string.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "Pending" => NodePhase::Pending,
            "Running" => NodePhase::Running,
            "Succeeded" => NodePhase::Succeeded,
            "Skipped" => NodePhase::Skipped,
            "Failed" => NodePhase::Failed,
            "Error" => NodePhase::Error,
            "Omitted" => NodePhase::Omitted,
            _ => NodePhase::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserializes_runner_object() {
        let json = serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Workflow",
            "metadata": {
                "name": "deploy-12",
                "uid": "b7f3",
                "resourceVersion": "991",
                "labels": {"workflow-execution-id": "12"}
            },
            "spec": {"entrypoint": "entrypoint", "shutdown": "Terminate"},
            "status": {
                "phase": "Failed",
                "startedAt": "2024-05-01T10:00:00Z",
                "finishedAt": null,
                "nodes": {
                    "deploy-12-1": {
                        "id": "deploy-12-1",
                        "displayName": "step-4-main",
                        "type": "Pod",
                        "phase": "Failed",
                        "message": "exit code 1"
                    }
                }
            }
        });

        let wf: Workflow = serde_json::from_value(json).expect("deserialize");
        assert!(wf.is_shutdown_requested());
        assert!(!wf.is_deleting());

        let status = wf.status.expect("status");
        assert_eq!(status.phase(), WorkflowPhase::Failed);
        assert!(status.finished_at.is_none());

        let node = status.nodes.get("deploy-12-1").expect("node");
        assert_eq!(node.phase(), NodePhase::Failed);
        assert!(node.is_completed());
    }

    #[test]
    fn test_unknown_phase_is_tolerated() {
        let node = NodeStatus {
            raw_phase: "Paused".to_string(),
            ..Default::default()
        };
        assert_eq!(node.phase(), NodePhase::Unknown);
        assert!(!node.is_completed());
    }

    #[test]
    fn test_empty_sections_are_omitted() {
        let template = Template {
            name: "t".to_string(),
            suspend: Some(SuspendTemplate::default()),
            ..Default::default()
        };
        let json = serde_json::to_value(&template).expect("serialize");
        assert_eq!(json, serde_json::json!({"name": "t", "suspend": {}}));
    }
}
