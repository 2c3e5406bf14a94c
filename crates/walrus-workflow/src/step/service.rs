// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later

use minijinja::{Environment, context};
use serde_json::Value;

use crate::definition::{EnvVar, Parameter, ScriptTemplate, Template};
use crate::error::{Error, Result};
use crate::model::WorkflowStepExecution;
use crate::placeholder::{self, inputs, params};

use super::{GeneratedTemplates, STEP_TYPE_SERVICE, StepManager};

const SCRIPT: &str = include_str!("service.sh");

/// Attribute key of the target environment.
pub const ATTR_ENVIRONMENT_ID: &str = "environmentID";
/// Attribute key of the resource name.
pub const ATTR_NAME: &str = "name";
/// Attribute key injected to correlate the deployment with the step execution.
pub const ATTR_STEP_EXECUTION_ID: &str = "workflowStepExecutionID";

/// Settings shared by all service steps.
#[derive(Debug, Clone)]
pub struct ServiceStepOptions {
    /// Image providing `sh` and `curl`
    pub image: String,
    /// Seconds between status polls
    pub poll_interval_secs: u64,
    /// Deadline used when the step has no timeout of its own
    pub default_timeout_secs: u64,
}

impl Default for ServiceStepOptions {
    fn default() -> Self {
        Self {
            image: "curlimages/curl:8.5.0".to_string(),
            poll_interval_secs: 5,
            default_timeout_secs: 3600,
        }
    }
}

/// Creates or upgrades a resource and waits for it to finish deploying.
#[derive(Debug, Clone)]
pub struct ServiceStep {
    options: ServiceStepOptions,
}

impl ServiceStep {
    /// Create the generator.
    pub fn new(options: ServiceStepOptions) -> Self {
        Self { options }
    }

    fn render(&self, environment_id: &str, resource_name: &str, timeout: u64) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("service.sh", SCRIPT)?;

        let source = env.get_template("service.sh")?.render(context! {
            environment_id => environment_id,
            resource_name => resource_name,
            poll_interval => self.options.poll_interval_secs,
            timeout => timeout,
        })?;

        Ok(source)
    }
}

impl StepManager for ServiceStep {
    fn step_type(&self) -> &'static str {
        STEP_TYPE_SERVICE
    }

    fn generate_templates(&self, step: &WorkflowStepExecution) -> Result<GeneratedTemplates> {
        let environment_id = environment_id(step)?;
        let resource_name = resource_name(step)?;

        let mut attributes = step.attributes.clone();
        attributes.insert(
            ATTR_STEP_EXECUTION_ID.to_string(),
            Value::String(step.id.to_string()),
        );
        let attributes = serde_json::to_string(&attributes)?;

        let timeout = u64::try_from(step.timeout)
            .ok()
            .filter(|t| *t > 0)
            .unwrap_or(self.options.default_timeout_secs);

        let source = self.render(&environment_id, resource_name, timeout)?;

        Ok(GeneratedTemplates::main_only(Template {
            inputs: crate::definition::Arguments {
                parameters: vec![Parameter::named(inputs::TOKEN)],
            },
            script: Some(ScriptTemplate {
                image: self.options.image.clone(),
                command: vec!["sh".to_string()],
                source,
                env: vec![
                    EnvVar::new("SERVER", placeholder::workflow_param(params::SERVER)),
                    EnvVar::new("PROJECT_ID", placeholder::workflow_param(params::PROJECT_ID)),
                    EnvVar::new("TLS_VERIFY", placeholder::workflow_param(params::TLS_VERIFY)),
                    EnvVar::new("TOKEN", placeholder::input_param(inputs::TOKEN)),
                    EnvVar::new("ATTRIBUTES", attributes),
                ],
            }),
            ..Default::default()
        }))
    }
}

fn environment_id(step: &WorkflowStepExecution) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidAttribute {
        step_id: step.id,
        attribute: ATTR_ENVIRONMENT_ID,
        reason: reason.to_string(),
    };

    let id = match step.attributes.get(ATTR_ENVIRONMENT_ID) {
        None | Some(Value::Null) => {
            return Err(Error::MissingAttribute {
                step_id: step.id,
                attribute: ATTR_ENVIRONMENT_ID,
            });
        }
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(invalid("must be a string or number")),
    };

    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("must be a numeric ID"));
    }

    Ok(id)
}

fn resource_name(step: &WorkflowStepExecution) -> Result<&str> {
    let name = step
        .attributes
        .get(ATTR_NAME)
        .and_then(Value::as_str)
        .ok_or(Error::MissingAttribute {
            step_id: step.id,
            attribute: ATTR_NAME,
        })?;

    if !is_dns_label(name) {
        return Err(Error::InvalidAttribute {
            step_id: step.id,
            attribute: ATTR_NAME,
            reason: "must be a lowercase DNS label".to_string(),
        });
    }

    Ok(name)
}

fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::step::test_support::step_execution;

    fn generate(attributes: serde_json::Value) -> Result<GeneratedTemplates> {
        ServiceStep::new(ServiceStepOptions::default())
            .generate_templates(&step_execution(8, "service", attributes))
    }

    #[test]
    fn test_renders_script() {
        let out = generate(json!({"environmentID": "301", "name": "web", "replicas": 2}))
            .expect("generate");
        let script = out.main.script.expect("script");

        assert_eq!(script.image, "curlimages/curl:8.5.0");
        assert!(script.source.starts_with("#!/bin/sh"));
        assert!(script.source.contains("/environments/301/resources\""));
        assert!(script.source.contains("name=\"web\""));
        assert!(script.source.contains("interval=5"));
        assert!(script.source.contains("+ 3600 ))"));
        assert!(!script.source.contains("{{"));
        assert!(out.sub_templates.is_empty());
    }

    #[test]
    fn test_runtime_values_come_from_placeholders() {
        let out = generate(json!({"environmentID": 301, "name": "web"})).expect("generate");
        let script = out.main.script.expect("script");
        let env = |name: &str| {
            script
                .env
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.value.clone())
                .expect("env var")
        };

        assert_eq!(env("TOKEN"), "{{inputs.parameters.token}}");
        assert_eq!(env("SERVER"), "{{workflow.parameters.server}}");

        let attrs: serde_json::Value = serde_json::from_str(&env("ATTRIBUTES")).expect("json");
        assert_eq!(attrs["workflowStepExecutionID"], "8");
        assert_eq!(attrs["name"], "web");
    }

    #[test]
    fn test_poll_survives_failed_calls() {
        let out = generate(json!({"environmentID": "1", "name": "web"})).expect("generate");
        let source = out.main.script.expect("script").source;

        assert!(source.contains("sort=-createTime\") || code=000"));
        assert!(source.contains("run_id=$(field id 2)"));
        assert!(source.contains("status=$(field summaryStatus 3)"));
    }

    #[cfg(unix)]
    #[test]
    fn test_field_reads_keys_at_item_depth() {
        let out = generate(json!({"environmentID": "1", "name": "web"})).expect("generate");
        let source = out.main.script.expect("script").source;
        let start = source.find("field() {").expect("field function");
        let end = start + source[start..].find("\n}\n").expect("function end") + 3;

        let body = r#"{"pagination":{"page":1},"items":[{"resource":{"id":"res-1",
            "status":{"summaryStatus":"Deployed"}},"id":"run-9",
            "status":{"summaryStatus":"Running","summaryStatusMessage":"a \"b\" c"}}]}"#;
        let script = format!(
            "{}\nresp=$(mktemp)\nprintf '%s' \"$BODY\" > \"$resp\"\n\
             field id 2\nfield summaryStatus 3\nrm -f \"$resp\"\n",
            &source[start..end]
        );
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("BODY", body)
            .output()
            .expect("run sh");

        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "run-9\nRunning\n");
    }

    #[test]
    fn test_step_timeout_bounds_the_wait() {
        let mut step = step_execution(8, "service", json!({"environmentID": "1", "name": "db"}));
        step.timeout = 90;
        let out = ServiceStep::new(ServiceStepOptions::default())
            .generate_templates(&step)
            .expect("generate");
        assert!(out.main.script.expect("script").source.contains("+ 90 ))"));
    }

    #[test]
    fn test_missing_attributes() {
        assert!(matches!(
            generate(json!({"name": "web"})),
            Err(Error::MissingAttribute { attribute: ATTR_ENVIRONMENT_ID, .. })
        ));
        assert!(matches!(
            generate(json!({"environmentID": "1"})),
            Err(Error::MissingAttribute { attribute: ATTR_NAME, .. })
        ));
    }

    #[test]
    fn test_invalid_attributes() {
        for attrs in [
            json!({"environmentID": "1; rm -rf /", "name": "web"}),
            json!({"environmentID": "1", "name": "Web_App"}),
            json!({"environmentID": "1", "name": "-web"}),
            json!({"environmentID": true, "name": "web"}),
        ] {
            assert!(matches!(generate(attrs), Err(Error::InvalidAttribute { .. })));
        }
    }
}
