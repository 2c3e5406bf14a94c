// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Argo Workflows server REST client.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use walrus_workflow::definition::Workflow;

use super::{LogEntry, LogOptions, LogStream, ResubmitOptions, WorkflowRunner};
use crate::error::{Error, Result};
use crate::http;

/// Client for the Argo server `/api/v1/workflows` endpoints.
#[derive(Debug, Clone)]
pub struct ArgoRunner {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    namespace: &'a str,
    workflow: &'a Workflow,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRequest<'a> {
    name: &'a str,
    namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_field_selector: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct ResubmitRequest<'a> {
    name: &'a str,
    namespace: &'a str,
    memoized: bool,
    parameters: &'a [String],
}

#[derive(Deserialize)]
struct WorkflowList {
    #[serde(default)]
    items: Option<Vec<Workflow>>,
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    result: Option<LogEntry>,
    #[serde(default)]
    error: Option<LogError>,
}

#[derive(Deserialize)]
struct LogError {
    #[serde(default)]
    message: String,
}

impl ArgoRunner {
    /// Create a client for the Argo server at `base_url`.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .default_headers(http::bearer_headers(token)?)
            .build()?;

        Ok(Self {
            http,
            base_url: http::base_url(base_url)?,
        })
    }

    fn url(&self, namespace: &str, name: Option<&str>, action: Option<&str>) -> Result<Url> {
        let mut path = format!("api/v1/workflows/{namespace}");
        if let Some(name) = name {
            path.push('/');
            path.push_str(name);
        }
        if let Some(action) = action {
            path.push('/');
            path.push_str(action);
        }
        Ok(self.base_url.join(&path)?)
    }

    async fn put_action<B: Serialize + ?Sized>(
        &self,
        namespace: &str,
        name: &str,
        action: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .put(self.url(namespace, Some(name), Some(action))?)
            .timeout(http::DEFAULT_TIMEOUT)
            .json(body)
            .send()
            .await?;
        http::ensure_success(response).await
    }
}

fn parse_log_line(line: &[u8]) -> Result<Option<LogEntry>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: LogLine = serde_json::from_slice(line)?;
    if let Some(error) = parsed.error {
        return Err(Error::Api {
            status: 500,
            message: error.message,
        });
    }
    Ok(parsed.result)
}

#[async_trait]
impl WorkflowRunner for ArgoRunner {
    async fn create_workflow(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow> {
        debug!(namespace, name = %workflow.metadata.name, "Creating runner workflow");
        let response = self
            .http
            .post(self.url(namespace, None, None)?)
            .timeout(http::DEFAULT_TIMEOUT)
            .json(&CreateRequest {
                namespace,
                workflow,
            })
            .send()
            .await?;
        http::handle_response(response).await
    }

    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<Workflow>> {
        let response = self
            .http
            .get(self.url(namespace, Some(name), None)?)
            .timeout(http::DEFAULT_TIMEOUT)
            .send()
            .await?;
        match http::handle_response(response).await {
            Ok(workflow) => Ok(Some(workflow)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_workflows(&self, namespace: &str, label_selector: &str) -> Result<Vec<Workflow>> {
        let response = self
            .http
            .get(self.url(namespace, None, None)?)
            .query(&[("listOptions.labelSelector", label_selector)])
            .timeout(http::DEFAULT_TIMEOUT)
            .send()
            .await?;
        let list: WorkflowList = http::handle_response(response).await?;
        Ok(list.items.unwrap_or_default())
    }

    async fn resume_workflow(
        &self,
        namespace: &str,
        name: &str,
        node_field_selector: &str,
    ) -> Result<()> {
        debug!(namespace, name, node_field_selector, "Resuming runner workflow");
        self.put_action(
            namespace,
            name,
            "resume",
            &NodeRequest {
                name,
                namespace,
                node_field_selector: Some(node_field_selector),
                message: None,
            },
        )
        .await?;
        Ok(())
    }

    async fn stop_workflow(
        &self,
        namespace: &str,
        name: &str,
        node_field_selector: &str,
        message: &str,
    ) -> Result<()> {
        debug!(namespace, name, node_field_selector, "Stopping runner workflow");
        self.put_action(
            namespace,
            name,
            "stop",
            &NodeRequest {
                name,
                namespace,
                node_field_selector: Some(node_field_selector),
                message: Some(message),
            },
        )
        .await?;
        Ok(())
    }

    async fn resubmit_workflow(
        &self,
        namespace: &str,
        name: &str,
        options: &ResubmitOptions,
    ) -> Result<Workflow> {
        debug!(namespace, name, memoized = options.memoized, "Resubmitting runner workflow");
        let response = self
            .put_action(
                namespace,
                name,
                "resubmit",
                &ResubmitRequest {
                    name,
                    namespace,
                    memoized: options.memoized,
                    parameters: &options.parameters,
                },
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn terminate_workflow(&self, namespace: &str, name: &str) -> Result<()> {
        self.put_action(
            namespace,
            name,
            "terminate",
            &NodeRequest {
                name,
                namespace,
                node_field_selector: None,
                message: None,
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(namespace, Some(name), None)?)
            .timeout(http::DEFAULT_TIMEOUT)
            .send()
            .await?;
        http::ensure_success(response).await?;
        Ok(())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        name: &str,
        options: &LogOptions,
    ) -> Result<LogStream> {
        let mut query = vec![
            ("logOptions.container", options.container.clone()),
            ("logOptions.follow", options.follow.to_string()),
        ];
        if let Some(selector) = &options.selector {
            query.push(("selector", selector.clone()));
        }

        // No request timeout: a followed stream lives as long as the pods.
        let response = self
            .http
            .get(self.url(namespace, Some(name), Some("log"))?)
            .query(&query)
            .send()
            .await?;
        let response = http::ensure_success(response).await?;
        let mut bytes = response.bytes_stream();

        Ok(Box::pin(async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            match parse_log_line(&line) {
                                Ok(Some(entry)) => yield Ok(entry),
                                Ok(None) => {}
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Runner log stream interrupted");
                        yield Err(Error::from(e));
                        return;
                    }
                    None => break,
                }
            }

            match parse_log_line(&buffer) {
                Ok(Some(entry)) => yield Ok(entry),
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NS: &str = "walrus-system";

    fn runner_object(name: &str, phase: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Workflow",
            "metadata": {
                "name": name,
                "namespace": NS,
                "uid": format!("uid-{name}"),
                "resourceVersion": "3",
                "labels": {"workflow-execution-id": "7"}
            },
            "spec": {"entrypoint": "entrypoint"},
            "status": {"phase": phase}
        })
    }

    async fn runner(server: &MockServer) -> ArgoRunner {
        ArgoRunner::new(&server.uri(), Some("argo")).expect("runner")
    }

    #[tokio::test]
    async fn test_create_wraps_workflow() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/workflows/walrus-system"))
            .and(header("Authorization", "Bearer argo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(runner_object("deploy-7", "")))
            .expect(1)
            .mount(&server)
            .await;

        let workflow = Workflow {
            api_version: "argoproj.io/v1alpha1".to_string(),
            kind: "Workflow".to_string(),
            ..Default::default()
        };
        let created = runner(&server)
            .await
            .create_workflow(NS, &workflow)
            .await
            .expect("create");
        assert_eq!(created.metadata.uid.as_deref(), Some("uid-deploy-7"));

        let requests = server.received_requests().await.expect("recorded");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json");
        assert_eq!(body["namespace"], NS);
        assert_eq!(body["workflow"]["kind"], "Workflow");
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/workflows/walrus-system/deploy-9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": 5,
                "message": "workflows.argoproj.io \"deploy-9\" not found"
            })))
            .mount(&server)
            .await;

        let found = runner(&server)
            .await
            .get_workflow(NS, "deploy-9")
            .await
            .expect("get");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_list_by_label_selector() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/workflows/walrus-system"))
            .and(query_param("listOptions.labelSelector", "workflow-execution-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"resourceVersion": "10"},
                "items": [runner_object("deploy-7", "Running")]
            })))
            .mount(&server)
            .await;

        let items = runner(&server)
            .await
            .list_workflows(NS, "workflow-execution-id")
            .await
            .expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata.name, "deploy-7");
    }

    #[tokio::test]
    async fn test_list_null_items_is_empty() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/workflows/walrus-system"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": null})),
            )
            .mount(&server)
            .await;

        let items = runner(&server)
            .await
            .list_workflows(NS, "workflow-execution-id")
            .await
            .expect("list");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_resume_sends_node_selector() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/api/v1/workflows/walrus-system/deploy-7/resume"))
            .and(body_json(serde_json::json!({
                "name": "deploy-7",
                "namespace": NS,
                "nodeFieldSelector": "templateName=step-4-main"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(runner_object("deploy-7", "Running")))
            .expect(1)
            .mount(&server)
            .await;

        runner(&server)
            .await
            .resume_workflow(NS, "deploy-7", "templateName=step-4-main")
            .await
            .expect("resume");
    }

    #[tokio::test]
    async fn test_resubmit_returns_new_object() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/api/v1/workflows/walrus-system/deploy-7/resubmit"))
            .and(body_json(serde_json::json!({
                "name": "deploy-7",
                "namespace": NS,
                "memoized": false,
                "parameters": ["token=abc"]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(runner_object("deploy-7-x2k9p", "Pending")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let options = ResubmitOptions {
            memoized: false,
            parameters: vec!["token=abc".to_string()],
        };
        let resubmitted = runner(&server)
            .await
            .resubmit_workflow(NS, "deploy-7", &options)
            .await
            .expect("resubmit");
        assert_eq!(resubmitted.metadata.name, "deploy-7-x2k9p");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v1/workflows/walrus-system/deploy-7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = runner(&server)
            .await
            .delete_workflow(NS, "deploy-7")
            .await
            .expect_err("absent");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_logs_joins_lines() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"result":{"content":"creating service web","podName":"deploy-7-1"}}"#,
            "\n",
            r#"{"result":{"content":"revision succeeded","podName":"deploy-7-1"}}"#,
            "\n"
        );

        Mock::given(method("GET"))
            .and(path("/api/v1/workflows/walrus-system/deploy-7/log"))
            .and(query_param("logOptions.container", "main"))
            .and(query_param("selector", "step-execution-id=4"))
            .and(query_param("logOptions.follow", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let logs = runner(&server)
            .await
            .get_logs(NS, "deploy-7", &LogOptions::main("step-execution-id=4"))
            .await
            .expect("logs");
        assert_eq!(logs, "creating service web\nrevision succeeded");
    }

    #[tokio::test]
    async fn test_stream_logs_surfaces_error_line() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"result":{"content":"line","podName":"p"}}"#,
            "\n",
            r#"{"error":{"code":2,"message":"pod deleted"}}"#
        );

        Mock::given(method("GET"))
            .and(path("/api/v1/workflows/walrus-system/deploy-7/log"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let mut stream = runner(&server)
            .await
            .stream_logs(NS, "deploy-7", &LogOptions::main("step-execution-id=4"))
            .await
            .expect("stream");

        let first = stream.next().await.expect("line").expect("ok");
        assert_eq!(first.content, "line");
        let second = stream.next().await.expect("error item");
        assert!(second.is_err());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_parse_blank_line() {
        assert!(parse_log_line(b"  \n").expect("parse").is_none());
    }
}
