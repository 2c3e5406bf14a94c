// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner placeholder strings.
//!
//! The runner substitutes `{{workflow.parameters.*}}`, `{{inputs.parameters.*}}`
//! and `{{=expr}}` at execution time. This module is the only place that
//! spells that grammar out.

/// Global workflow parameter names.
pub mod params {
    /// API base URL status reports are sent to.
    pub const SERVER: &str = "server";
    /// Project of the executed workflow.
    pub const PROJECT_ID: &str = "projectID";
    /// Executed workflow.
    pub const WORKFLOW_ID: &str = "workflowID";
    /// Whether TLS certificates of `server` are verified.
    pub const TLS_VERIFY: &str = "tlsVerify";
    /// Submit-time bearer token.
    pub const TOKEN: &str = "token";
}

/// Template input parameter names.
pub mod inputs {
    /// Entity ID addressed by a status report.
    pub const ID: &str = "id";
    /// Reported status.
    pub const STATUS: &str = "status";
    /// Bearer token for step reports.
    pub const TOKEN: &str = "token";
    /// Owning execution of a stage or step.
    pub const WORKFLOW_EXECUTION_ID: &str = "workflowExecutionID";
    /// Owning stage execution of a step.
    pub const WORKFLOW_STAGE_EXECUTION_ID: &str = "workflowStageExecutionID";
    /// Secret to read.
    pub const SECRET_NAME: &str = "secretName";
    /// Key inside the secret.
    pub const SECRET_KEY: &str = "secretKey";
    /// Namespace of the secret.
    pub const SECRET_NAMESPACE: &str = "secretNamespace";
}

/// Output parameter of the secret-fetch template.
pub const SECRET_VALUE_OUTPUT: &str = "secretValue";

/// `{{workflow.parameters.<name>}}`
pub fn workflow_param(name: &str) -> String {
    format!("{{{{workflow.parameters.{name}}}}}")
}

/// `{{inputs.parameters.<name>}}`
pub fn input_param(name: &str) -> String {
    format!("{{{{inputs.parameters.{name}}}}}")
}

/// `{{workflow.status}}`, the final phase seen by exit handlers.
pub fn workflow_status() -> String {
    "{{workflow.status}}".to_string()
}

/// Expression decoding the token fetched by a preceding secret step.
pub fn secret_token_from_step(secret_step: &str) -> String {
    format!(
        "{{{{=fromBase64(steps['{secret_step}'].outputs.parameters.{SECRET_VALUE_OUTPUT})}}}}"
    )
}

/// Hook guard matching the outcome of a sibling step.
pub fn step_status_is(step: &str, phase: &str) -> String {
    format!("steps['{step}'].status == \"{phase}\"")
}

/// JSON path of a key inside a fetched secret's data.
pub fn secret_data_path() -> String {
    format!("{{.data.{}}}", input_param(inputs::SECRET_KEY))
}

/// `Bearer {{...}}` header value.
pub fn bearer(token_placeholder: &str) -> String {
    format!("Bearer {token_placeholder}")
}

/// URL of the execution status endpoint.
pub fn execution_report_url() -> String {
    format!(
        "{}/v1/projects/{}/workflows/{}/executions/{}",
        workflow_param(params::SERVER),
        workflow_param(params::PROJECT_ID),
        workflow_param(params::WORKFLOW_ID),
        input_param(inputs::ID),
    )
}

/// URL of the stage execution status endpoint.
pub fn stage_report_url() -> String {
    format!(
        "{}/v1/projects/{}/workflows/{}/executions/{}/stage-executions/{}",
        workflow_param(params::SERVER),
        workflow_param(params::PROJECT_ID),
        workflow_param(params::WORKFLOW_ID),
        input_param(inputs::WORKFLOW_EXECUTION_ID),
        input_param(inputs::ID),
    )
}

/// URL of the step execution status endpoint.
pub fn step_report_url() -> String {
    format!(
        "{}/v1/projects/{}/workflows/{}/executions/{}/stage-executions/{}/step-executions/{}",
        workflow_param(params::SERVER),
        workflow_param(params::PROJECT_ID),
        workflow_param(params::WORKFLOW_ID),
        input_param(inputs::WORKFLOW_EXECUTION_ID),
        input_param(inputs::WORKFLOW_STAGE_EXECUTION_ID),
        input_param(inputs::ID),
    )
}

/// JSON body of every status report.
pub fn report_body() -> String {
    format!(
        "{{\n\t\"id\": \"{}\",\n\t\"status\": \"{}\"\n}}",
        input_param(inputs::ID),
        input_param(inputs::STATUS),
    )
}
