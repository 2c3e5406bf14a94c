// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expansion of an execution hierarchy into a runner workflow.
//!
//! ```text
//! entrypoint (DAG)
//! ├── workflowEnter                 PUT execution Running
//! ├── stage-A ──────────────────────┐ depends on workflowEnter
//! │   ├── stage-A-secret            │ read execution token
//! │   ├── stage-A-enter             │ PUT stage Running
//! │   └── stage-A-main (DAG)        │ hooks → stage-A-exit
//! │       └── step-S (steps)        │
//! │           ├── step-S-secret     │ read execution token
//! │           ├── step-S-enter      │ PUT step Running
//! │           └── step-S-main       │ generator output, hooks → step-S-exit
//! └── stage-B ──────────────────────┘ depends on stage-A
//! onExit: workflowExit (steps)
//!         ├── workflowExitSecret    read execution token
//!         └── workflowExitReport    PUT execution {{workflow.status}}
//! ```
//!
//! Only `workflowEnter` authenticates with the token passed as a workflow
//! parameter. Every later report reads the execution secret first, so it
//! picks up tokens rotated while the workflow was running.
//!
//! Stages are chained strictly by `order`; the persisted `dependencies`
//! fields of stages and steps are not consulted. Steps of one stage run
//! without ordering between them.

use std::collections::BTreeMap;

use crate::definition::{
    self, Arguments, Backoff, DagTask, DagTemplate, Http, HttpHeader, LifecycleHook, ObjectMeta,
    Parameter, PodSecurityContext, ResourceTemplate, RetryPolicy, RetryStrategy,
    Template, TemplateMetadata, TtlStrategy, ValueFrom, Workflow, WorkflowSpec, WorkflowStep,
};
use crate::error::{Error, Result};
use crate::model::{WorkflowExecution, WorkflowStageExecution, WorkflowStepExecution};
use crate::naming::{
    self, Phase, STEP_EXECUTION_ID_LABEL, WORKFLOW_ENTER, WORKFLOW_ENTRYPOINT,
    WORKFLOW_EXECUTION_ID_LABEL, WORKFLOW_EXIT, WORKFLOW_EXIT_REPORT, WORKFLOW_EXIT_SECRET,
};
use crate::placeholder::{self, SECRET_VALUE_OUTPUT, inputs, params};
use crate::status::ExecutionState;
use crate::step::{GeneratedTemplates, StepRegistry};

/// Key inside the execution secret holding the bearer token.
pub const SECRET_TOKEN_KEY: &str = "token";

const REPORT_SUCCESS_CONDITION: &str = "response.statusCode >= 200 && response.statusCode < 300";
const REPORT_TIMEOUT_SECONDS: i64 = 5;

const HOOK_OUTCOMES: [(&str, ExecutionState); 3] = [
    ("succeeded", ExecutionState::Succeeded),
    ("failed", ExecutionState::Failed),
    ("error", ExecutionState::Error),
];

/// Deployment settings substituted into every generated workflow.
#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// API base URL status reports are sent to
    pub server_url: String,
    /// Whether the API's TLS certificate is verified
    pub tls_verify: bool,
    /// Namespace of runner objects and execution secrets
    pub namespace: String,
    /// Service account workflow pods run as
    pub service_account: String,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            tls_verify: true,
            namespace: "walrus-system".to_string(),
            service_account: "walrus-workflow".to_string(),
        }
    }
}

/// Builds runner workflows from execution hierarchies.
///
/// Generation is pure: the same execution and token always produce the same
/// workflow object.
#[derive(Debug, Clone)]
pub struct TemplateManager {
    registry: StepRegistry,
    options: TemplateOptions,
}

impl TemplateManager {
    /// Create a manager using `registry` to expand steps.
    pub fn new(registry: StepRegistry, options: TemplateOptions) -> Self {
        Self { registry, options }
    }

    /// Deployment settings.
    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    /// Build the complete runner workflow for `execution`.
    ///
    /// The execution must have its stage and step executions loaded.
    pub fn to_runner_workflow(&self, execution: &WorkflowExecution, token: &str) -> Result<Workflow> {
        if self.options.server_url.is_empty() {
            return Err(Error::EmptyServerAddress);
        }

        let templates = self.execution_templates(execution)?;

        Ok(Workflow {
            api_version: definition::API_VERSION.to_string(),
            kind: definition::KIND.to_string(),
            metadata: ObjectMeta {
                name: naming::runner_workflow_name(&execution.name, execution.id),
                namespace: Some(self.options.namespace.clone()),
                labels: BTreeMap::from([(
                    WORKFLOW_EXECUTION_ID_LABEL.to_string(),
                    execution.id.to_string(),
                )]),
                ..Default::default()
            },
            spec: WorkflowSpec {
                entrypoint: WORKFLOW_ENTRYPOINT.to_string(),
                arguments: Arguments::from_pairs([
                    (params::SERVER, self.options.server_url.clone()),
                    (params::PROJECT_ID, execution.project_id.to_string()),
                    (params::WORKFLOW_ID, execution.workflow_id.to_string()),
                    (params::TLS_VERIFY, self.options.tls_verify.to_string()),
                    (params::TOKEN, token.to_string()),
                ]),
                templates,
                on_exit: Some(WORKFLOW_EXIT.to_string()),
                active_deadline_seconds: (execution.timeout > 0).then(|| i64::from(execution.timeout)),
                parallelism: (execution.parallelism > 0).then(|| i64::from(execution.parallelism)),
                service_account_name: Some(self.options.service_account.clone()),
                security_context: Some(PodSecurityContext {
                    run_as_non_root: Some(true),
                    run_as_user: Some(1000),
                }),
                ttl_strategy: Some(TtlStrategy {
                    seconds_after_completion: Some(600),
                }),
                shutdown: None,
            },
            status: None,
        })
    }

    /// All templates of an execution: entrypoint, enter/exit reports and
    /// every stage's templates.
    pub fn execution_templates(&self, execution: &WorkflowExecution) -> Result<Vec<Template>> {
        let mut stages: Vec<&WorkflowStageExecution> = execution.stages.iter().collect();
        stages.sort_by_key(|s| s.order);

        let mut tasks = Vec::with_capacity(stages.len() + 1);
        tasks.push(DagTask {
            name: WORKFLOW_ENTER.to_string(),
            template: WORKFLOW_ENTER.to_string(),
            ..Default::default()
        });

        let mut stage_templates = Vec::new();
        for stage in stages {
            let previous = tasks.last().map(|t: &DagTask| t.name.clone());
            let name = naming::stage_name(stage.id);
            tasks.push(DagTask {
                name: name.clone(),
                template: name,
                dependencies: previous.into_iter().collect(),
                ..Default::default()
            });
            stage_templates.extend(self.stage_templates(stage)?);
        }

        let secret_name = naming::execution_secret_name(execution.id);
        let token = placeholder::secret_token_from_step(WORKFLOW_EXIT_SECRET);
        let exit = Template {
            name: WORKFLOW_EXIT.to_string(),
            steps: vec![
                vec![secret_step(WORKFLOW_EXIT_SECRET, &secret_name)],
                vec![WorkflowStep {
                    name: WORKFLOW_EXIT_REPORT.to_string(),
                    template: WORKFLOW_EXIT_REPORT.to_string(),
                    arguments: Arguments::from_pairs([(inputs::TOKEN, token.as_str())]),
                    ..Default::default()
                }],
            ],
            ..Default::default()
        };

        let mut exit_report = self.execution_report_template(
            WORKFLOW_EXIT_REPORT,
            execution,
            placeholder::workflow_status(),
            placeholder::input_param(inputs::TOKEN),
        );
        exit_report
            .inputs
            .parameters
            .push(Parameter::named(inputs::TOKEN));

        let mut templates = Vec::with_capacity(stage_templates.len() + 5);
        templates.push(Template {
            name: WORKFLOW_ENTRYPOINT.to_string(),
            dag: Some(DagTemplate { tasks }),
            ..Default::default()
        });
        templates.push(self.execution_report_template(
            WORKFLOW_ENTER,
            execution,
            ExecutionState::Running.as_str().to_string(),
            placeholder::workflow_param(params::TOKEN),
        ));
        templates.push(exit);
        templates.push(self.secret_template(WORKFLOW_EXIT_SECRET, &secret_name));
        templates.push(exit_report);
        templates.extend(stage_templates);

        Ok(templates)
    }

    /// Templates of one stage: the wrapper, secret fetch, enter/main/exit and
    /// all step templates.
    pub fn stage_templates(&self, stage: &WorkflowStageExecution) -> Result<Vec<Template>> {
        let secret = naming::stage_secret_name(stage.id);
        let token = placeholder::secret_token_from_step(&secret);
        let secret_name = naming::execution_secret_name(stage.workflow_execution_id);
        let enter = naming::stage_phase_name(stage.id, Phase::Enter);
        let main = naming::stage_phase_name(stage.id, Phase::Main);
        let exit = naming::stage_phase_name(stage.id, Phase::Exit);

        let mut steps: Vec<&WorkflowStepExecution> = stage.steps.iter().collect();
        steps.sort_by_key(|s| s.order);

        let mut tasks = Vec::with_capacity(steps.len());
        let mut step_templates = Vec::new();
        for step in steps {
            let name = naming::step_name(step.id);
            tasks.push(DagTask {
                name: name.clone(),
                template: name,
                ..Default::default()
            });
            step_templates.extend(self.step_templates(step)?);
        }

        let wrapper = Template {
            name: naming::stage_name(stage.id),
            steps: vec![
                vec![secret_step(&secret, &secret_name)],
                vec![WorkflowStep {
                    name: enter.clone(),
                    template: enter.clone(),
                    arguments: Arguments::from_pairs([
                        (inputs::STATUS, ExecutionState::Running.as_str()),
                        (inputs::TOKEN, token.as_str()),
                    ]),
                    ..Default::default()
                }],
                vec![WorkflowStep {
                    name: main.clone(),
                    template: main.clone(),
                    hooks: outcome_hooks(&main, &exit, &[(inputs::TOKEN, token.as_str())]),
                    ..Default::default()
                }],
            ],
            ..Default::default()
        };

        let mut templates = Vec::with_capacity(step_templates.len() + 5);
        templates.push(wrapper);
        templates.push(self.secret_template(&secret, &secret_name));
        templates.push(self.stage_report_template(&enter, stage));
        templates.push(Template {
            name: main,
            dag: Some(DagTemplate { tasks }),
            ..Default::default()
        });
        templates.push(self.stage_report_template(&exit, stage));
        templates.extend(step_templates);

        Ok(templates)
    }

    /// Templates of one step: the wrapper, secret fetch, enter/main/exit and
    /// the generator's sub-templates.
    pub fn step_templates(&self, step: &WorkflowStepExecution) -> Result<Vec<Template>> {
        let GeneratedTemplates {
            main: mut main_template,
            sub_templates,
        } = self
            .registry
            .get(&step.step_type)?
            .generate_templates(step)?;

        let secret = naming::step_secret_name(step.id);
        let enter = naming::step_phase_name(step.id, Phase::Enter);
        let main = naming::step_phase_name(step.id, Phase::Main);
        let exit = naming::step_phase_name(step.id, Phase::Exit);
        let token = placeholder::secret_token_from_step(&secret);
        let secret_name = naming::execution_secret_name(step.workflow_execution_id);

        main_template.name = main.clone();
        main_template
            .metadata
            .get_or_insert_with(TemplateMetadata::default)
            .labels
            .insert(STEP_EXECUTION_ID_LABEL.to_string(), step.id.to_string());
        if step.timeout > 0 {
            main_template.timeout = Some(format!("{}s", step.timeout));
        }
        if let Some(retry) = &step.retry_strategy {
            main_template.retry_strategy = Some(retry.clone());
        }
        if !main_template
            .inputs
            .parameters
            .iter()
            .any(|p| p.name == inputs::TOKEN)
        {
            main_template
                .inputs
                .parameters
                .push(Parameter::named(inputs::TOKEN));
        }

        let wrapper = Template {
            name: naming::step_name(step.id),
            steps: vec![
                vec![secret_step(&secret, &secret_name)],
                vec![WorkflowStep {
                    name: enter.clone(),
                    template: enter.clone(),
                    arguments: Arguments::from_pairs([
                        (inputs::STATUS, ExecutionState::Running.as_str()),
                        (inputs::TOKEN, token.as_str()),
                    ]),
                    ..Default::default()
                }],
                vec![WorkflowStep {
                    name: main.clone(),
                    template: main.clone(),
                    arguments: Arguments::from_pairs([(inputs::TOKEN, token.as_str())]),
                    hooks: outcome_hooks(&main, &exit, &[(inputs::TOKEN, token.as_str())]),
                }],
            ],
            ..Default::default()
        };

        let mut templates = Vec::with_capacity(sub_templates.len() + 5);
        templates.push(wrapper);
        templates.push(self.secret_template(&secret, &secret_name));
        templates.push(self.step_report_template(&enter, step));
        templates.push(main_template);
        templates.push(self.step_report_template(&exit, step));
        templates.extend(sub_templates);

        Ok(templates)
    }

    fn execution_report_template(
        &self,
        name: &str,
        execution: &WorkflowExecution,
        status: String,
        token: String,
    ) -> Template {
        self.report_template(
            name,
            placeholder::execution_report_url(),
            vec![
                Parameter::with_value(inputs::ID, execution.id.to_string()),
                Parameter::with_value(inputs::STATUS, status),
            ],
            token,
        )
    }

    fn stage_report_template(&self, name: &str, stage: &WorkflowStageExecution) -> Template {
        self.report_template(
            name,
            placeholder::stage_report_url(),
            vec![
                Parameter::with_value(inputs::ID, stage.id.to_string()),
                Parameter::with_value(
                    inputs::WORKFLOW_EXECUTION_ID,
                    stage.workflow_execution_id.to_string(),
                ),
                Parameter::named(inputs::STATUS),
                Parameter::named(inputs::TOKEN),
            ],
            placeholder::input_param(inputs::TOKEN),
        )
    }

    fn step_report_template(&self, name: &str, step: &WorkflowStepExecution) -> Template {
        self.report_template(
            name,
            placeholder::step_report_url(),
            vec![
                Parameter::with_value(inputs::ID, step.id.to_string()),
                Parameter::with_value(
                    inputs::WORKFLOW_STAGE_EXECUTION_ID,
                    step.workflow_stage_execution_id.to_string(),
                ),
                Parameter::with_value(
                    inputs::WORKFLOW_EXECUTION_ID,
                    step.workflow_execution_id.to_string(),
                ),
                Parameter::named(inputs::STATUS),
                Parameter::named(inputs::TOKEN),
            ],
            placeholder::input_param(inputs::TOKEN),
        )
    }

    fn report_template(
        &self,
        name: &str,
        url: String,
        parameters: Vec<Parameter>,
        token: String,
    ) -> Template {
        Template {
            name: name.to_string(),
            inputs: Arguments { parameters },
            http: Some(Http {
                url,
                method: "PUT".to_string(),
                headers: vec![
                    HttpHeader {
                        name: "Content-Type".to_string(),
                        value: "application/json".to_string(),
                    },
                    HttpHeader {
                        name: "Authorization".to_string(),
                        value: placeholder::bearer(&token),
                    },
                ],
                timeout_seconds: Some(REPORT_TIMEOUT_SECONDS),
                body: Some(placeholder::report_body()),
                success_condition: Some(REPORT_SUCCESS_CONDITION.to_string()),
                insecure_skip_verify: !self.options.tls_verify,
            }),
            retry_strategy: Some(retry_strategy("1")),
            ..Default::default()
        }
    }

    fn secret_template(&self, name: &str, secret_name: &str) -> Template {
        Template {
            name: name.to_string(),
            inputs: Arguments {
                parameters: vec![
                    Parameter::with_value(inputs::SECRET_NAME, secret_name),
                    Parameter::with_value(inputs::SECRET_KEY, SECRET_TOKEN_KEY),
                    Parameter::with_value(inputs::SECRET_NAMESPACE, self.options.namespace.as_str()),
                ],
            },
            outputs: Arguments {
                parameters: vec![Parameter {
                    name: SECRET_VALUE_OUTPUT.to_string(),
                    value: None,
                    value_from: Some(ValueFrom {
                        json_path: Some(placeholder::secret_data_path()),
                    }),
                }],
            },
            resource: Some(ResourceTemplate {
                action: "get".to_string(),
                manifest: format!(
                    "apiVersion: v1\nkind: Secret\nmetadata:\n  name: \"{}\"\n  namespace: \"{}\"",
                    placeholder::input_param(inputs::SECRET_NAME),
                    placeholder::input_param(inputs::SECRET_NAMESPACE),
                ),
            }),
            timeout: Some("10s".to_string()),
            retry_strategy: Some(retry_strategy("5")),
            ..Default::default()
        }
    }
}

/// Wrapper step reading the token key of `secret_name` through the secret
/// template `name`.
fn secret_step(name: &str, secret_name: &str) -> WorkflowStep {
    WorkflowStep {
        name: name.to_string(),
        template: name.to_string(),
        arguments: Arguments::from_pairs([
            (inputs::SECRET_NAME, secret_name),
            (inputs::SECRET_KEY, SECRET_TOKEN_KEY),
        ]),
        ..Default::default()
    }
}

/// Bounded retry used by report and secret templates.
fn retry_strategy(initial_backoff: &str) -> RetryStrategy {
    RetryStrategy {
        limit: Some(2),
        retry_policy: Some(RetryPolicy::OnFailure),
        backoff: Some(Backoff {
            duration: initial_backoff.to_string(),
            factor: Some(2),
            max_duration: Some("1m".to_string()),
        }),
    }
}

/// `succeeded`/`failed`/`error` hooks on `step` invoking `exit` with the
/// matching status.
fn outcome_hooks(
    step: &str,
    exit: &str,
    extra: &[(&str, &str)],
) -> BTreeMap<String, LifecycleHook> {
    HOOK_OUTCOMES
        .iter()
        .map(|(key, state)| {
            let mut arguments = Arguments::from_pairs([(inputs::STATUS, state.as_str())]);
            arguments
                .parameters
                .extend(extra.iter().map(|(k, v)| Parameter::with_value(*k, *v)));

            (
                (*key).to_string(),
                LifecycleHook {
                    template: exit.to_string(),
                    arguments,
                    expression: Some(placeholder::step_status_is(step, state.as_str())),
                },
            )
        })
        .collect()
}
