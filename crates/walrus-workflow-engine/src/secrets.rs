// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution secrets.
//!
//! Each execution keeps its callback token in `workflow-execution-{id}`
//! under the `token` key. Step pods read it just before reporting, so the
//! token can be rotated while an approval waits.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;
use walrus_workflow::definition::{ObjectMeta, OwnerReference};

use crate::error::{Error, Result};
use crate::http;

const MERGE_PATCH: &str = "application/merge-patch+json";

/// A namespaced key/value secret with decoded values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    /// Secret name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Decoded data
    pub data: BTreeMap<String, String>,
    /// Owners garbage-collecting the secret
    pub owner_references: Vec<OwnerReference>,
    /// Server version, set on secrets read from the store
    pub resource_version: Option<String>,
}

impl Secret {
    /// A secret holding one key.
    pub fn with_entry(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data: BTreeMap::from([(key.into(), value.into())]),
            ..Default::default()
        }
    }
}

/// Secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create a secret. An existing secret of the same name is a conflict
    /// (see [`Error::is_conflict`]).
    async fn create(&self, secret: &Secret) -> Result<Secret>;

    /// Get a secret, `None` if absent.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Replace a secret's data.
    async fn update(&self, secret: &Secret) -> Result<Secret>;

    /// Delete a secret. Deleting an absent secret succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Make `owner` the sole owner of the secret.
    async fn set_owner(&self, namespace: &str, name: &str, owner: &OwnerReference) -> Result<()>;
}

// ============================================================================
// Kubernetes
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretObject {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    secret_type: Option<String>,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl SecretObject {
    fn encode(secret: &Secret) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            metadata: ObjectMeta {
                name: secret.name.clone(),
                namespace: Some(secret.namespace.clone()),
                resource_version: secret.resource_version.clone(),
                owner_references: secret.owner_references.clone(),
                ..Default::default()
            },
            secret_type: Some("Opaque".to_string()),
            data: secret
                .data
                .iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect(),
        }
    }

    fn decode(self) -> Result<Secret> {
        let data = self
            .data
            .into_iter()
            .map(|(k, v)| {
                let raw = STANDARD
                    .decode(v.as_bytes())
                    .map_err(|e| Error::Secret(format!("key {k}: {e}")))?;
                let value = String::from_utf8(raw)
                    .map_err(|e| Error::Secret(format!("key {k}: {e}")))?;
                Ok((k, value))
            })
            .collect::<Result<_>>()?;

        Ok(Secret {
            name: self.metadata.name,
            namespace: self.metadata.namespace.unwrap_or_default(),
            data,
            owner_references: self.metadata.owner_references,
            resource_version: self.metadata.resource_version,
        })
    }
}

/// Secret store backed by the Kubernetes core API.
#[derive(Debug, Clone)]
pub struct KubeSecretStore {
    http: reqwest::Client,
    base_url: Url,
}

impl KubeSecretStore {
    /// Create a store talking to `base_url`, authenticating with `token`.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .default_headers(http::bearer_headers(token)?)
            .timeout(http::DEFAULT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: http::base_url(base_url)?,
        })
    }

    /// Create a store reading the bearer token from `token_file`, as mounted
    /// into in-cluster pods. A missing file means anonymous access.
    pub async fn from_token_file(base_url: &str, token_file: &Path) -> Result<Self> {
        let token = match tokio::fs::read_to_string(token_file).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %token_file.display(), "No Kubernetes token file, using anonymous access");
                None
            }
            Err(e) => return Err(e.into()),
        };
        Self::new(base_url, token.as_deref())
    }

    fn url(&self, namespace: &str, name: Option<&str>) -> Result<Url> {
        let path = match name {
            Some(name) => format!("api/v1/namespaces/{namespace}/secrets/{name}"),
            None => format!("api/v1/namespaces/{namespace}/secrets"),
        };
        Ok(self.base_url.join(&path)?)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn create(&self, secret: &Secret) -> Result<Secret> {
        let response = self
            .http
            .post(self.url(&secret.namespace, None)?)
            .json(&SecretObject::encode(secret))
            .send()
            .await?;
        http::handle_response::<SecretObject>(response).await?.decode()
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let response = self.http.get(self.url(namespace, Some(name))?).send().await?;
        match http::handle_response::<SecretObject>(response).await {
            Ok(object) => Ok(Some(object.decode()?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update(&self, secret: &Secret) -> Result<Secret> {
        let response = self
            .http
            .put(self.url(&secret.namespace, Some(&secret.name))?)
            .json(&SecretObject::encode(secret))
            .send()
            .await?;
        http::handle_response::<SecretObject>(response).await?.decode()
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(namespace, Some(name))?)
            .send()
            .await?;
        match http::ensure_success(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_owner(&self, namespace: &str, name: &str, owner: &OwnerReference) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "ownerReferences": [owner] }
        });
        let response = self
            .http
            .patch(self.url(namespace, Some(name))?)
            .header(CONTENT_TYPE, HeaderValue::from_static(MERGE_PATCH))
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await?;
        http::ensure_success(response).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory secret store for tests.
#[derive(Debug, Clone, Default)]
pub struct MockSecretStore {
    secrets: Arc<Mutex<HashMap<(String, String), Secret>>>,
    fail_create: Arc<Mutex<Option<String>>>,
}

impl MockSecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub async fn len(&self) -> usize {
        self.secrets.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.secrets.lock().await.is_empty()
    }

    /// Make the next `create` fail with an API error.
    pub async fn fail_next_create(&self, message: &str) {
        *self.fail_create.lock().await = Some(message.to_string());
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl SecretStore for MockSecretStore {
    async fn create(&self, secret: &Secret) -> Result<Secret> {
        if let Some(message) = self.fail_create.lock().await.take() {
            return Err(Error::Api {
                status: 500,
                message,
            });
        }
        let mut secrets = self.secrets.lock().await;
        let k = key(&secret.namespace, &secret.name);
        if secrets.contains_key(&k) {
            return Err(Error::Conflict(format!("secret {} already exists", secret.name)));
        }
        secrets.insert(k, secret.clone());
        Ok(secret.clone())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets.lock().await.get(&key(namespace, name)).cloned())
    }

    async fn update(&self, secret: &Secret) -> Result<Secret> {
        let mut secrets = self.secrets.lock().await;
        match secrets.get_mut(&key(&secret.namespace, &secret.name)) {
            Some(stored) => {
                *stored = secret.clone();
                Ok(secret.clone())
            }
            None => Err(Error::NotFound(format!("secret {}", secret.name))),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets.lock().await.remove(&key(namespace, name));
        Ok(())
    }

    async fn set_owner(&self, namespace: &str, name: &str, owner: &OwnerReference) -> Result<()> {
        let mut secrets = self.secrets.lock().await;
        let stored = secrets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("secret {name}")))?;
        stored.owner_references = vec![owner.clone()];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NS: &str = "walrus-system";

    fn secret_body(token_b64: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "workflow-execution-7",
                "namespace": NS,
                "resourceVersion": "12"
            },
            "type": "Opaque",
            "data": {"token": token_b64}
        })
    }

    #[tokio::test]
    async fn test_create_encodes_data() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/walrus-system/secrets"))
            .and(body_json(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "workflow-execution-7", "namespace": NS},
                "type": "Opaque",
                "data": {"token": "czNjcjN0"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(secret_body("czNjcjN0")))
            .expect(1)
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), Some("kube")).expect("store");
        let created = store
            .create(&Secret::with_entry(NS, "workflow-execution-7", "token", "s3cr3t"))
            .await
            .expect("create");

        assert_eq!(created.data["token"], "s3cr3t");
        assert_eq!(created.resource_version.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_create_existing_is_conflict() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/walrus-system/secrets"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "kind": "Status",
                "reason": "AlreadyExists",
                "message": "secrets \"workflow-execution-7\" already exists",
                "code": 409
            })))
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), None).expect("store");
        let err = store
            .create(&Secret::with_entry(NS, "workflow-execution-7", "token", "x"))
            .await
            .expect_err("conflict");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/walrus-system/secrets/workflow-execution-8"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), None).expect("store");
        assert!(store
            .get(NS, "workflow-execution-8")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_get_decodes_and_sends_bearer() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/walrus-system/secrets/workflow-execution-7"))
            .and(header("Authorization", "Bearer kube"))
            .respond_with(ResponseTemplate::new(200).set_body_json(secret_body("dG9rZW4tMQ==")))
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), Some("kube")).expect("store");
        let secret = store
            .get(NS, "workflow-execution-7")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(secret.data["token"], "token-1");
    }

    #[tokio::test]
    async fn test_from_token_file() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().expect("temp dir");
        let token_file = dir.path().join("token");
        std::fs::write(&token_file, "kube\n").expect("write token");

        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/walrus-system/secrets/workflow-execution-7"))
            .and(header("Authorization", "Bearer kube"))
            .respond_with(ResponseTemplate::new(200).set_body_json(secret_body("eA==")))
            .expect(1)
            .mount(&server)
            .await;

        let store = KubeSecretStore::from_token_file(&server.uri(), &token_file)
            .await
            .expect("store");
        store.get(NS, "workflow-execution-7").await.expect("get");

        // Outside a cluster the token file is absent.
        KubeSecretStore::from_token_file(&server.uri(), &dir.path().join("missing"))
            .await
            .expect("anonymous store");
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/walrus-system/secrets/workflow-execution-7"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), None).expect("store");
        store.delete(NS, "workflow-execution-7").await.expect("delete");
    }

    #[tokio::test]
    async fn test_set_owner_sends_merge_patch() {
        let server = MockServer::start().await;
        let owner = OwnerReference {
            api_version: "argoproj.io/v1alpha1".to_string(),
            kind: "Workflow".to_string(),
            name: "deploy-7".to_string(),
            uid: "b7f3".to_string(),
        };

        Mock::given(method("PATCH"))
            .and(path("/api/v1/namespaces/walrus-system/secrets/workflow-execution-7"))
            .and(header("Content-Type", MERGE_PATCH))
            .and(body_json(serde_json::json!({
                "metadata": {"ownerReferences": [{
                    "apiVersion": "argoproj.io/v1alpha1",
                    "kind": "Workflow",
                    "name": "deploy-7",
                    "uid": "b7f3"
                }]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(secret_body("eA==")))
            .expect(1)
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), None).expect("store");
        store
            .set_owner(NS, "workflow-execution-7", &owner)
            .await
            .expect("patch");
    }

    #[tokio::test]
    async fn test_server_error_is_api_error() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = KubeSecretStore::new(&server.uri(), None).expect("store");
        let err = store
            .update(&Secret::with_entry(NS, "s", "token", "x"))
            .await
            .expect_err("server error");
        assert!(matches!(err, Error::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_mock_store_lifecycle() {
        let store = MockSecretStore::new();
        let secret = Secret::with_entry(NS, "a", "token", "1");

        store.create(&secret).await.expect("create");
        assert!(store.create(&secret).await.expect_err("dup").is_conflict());

        let mut updated = secret.clone();
        updated.data.insert("token".into(), "2".into());
        store.update(&updated).await.expect("update");
        assert_eq!(store.get(NS, "a").await.expect("get").expect("some").data["token"], "2");

        store.delete(NS, "a").await.expect("delete");
        store.delete(NS, "a").await.expect("delete again");
        assert!(store.is_empty().await);
    }
}
