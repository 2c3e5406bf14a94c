// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access tokens for status callbacks.
//!
//! Each submission mints a short-lived token acting as the triggering
//! subject. The runner reads it from the execution secret and presents it
//! on every status report. Only a SHA-256 digest is stored.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persistence::{Persistence, TokenRecord};

/// Token kind used for execution callbacks.
pub const TOKEN_KIND_DEPLOYMENT: &str = "deployment";

/// A freshly issued token. `value` is only available at issue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Bearer value
    pub value: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// Issues access tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Create a token acting as `subject_id`, valid for `ttl`.
    async fn create_access_token(
        &self,
        subject_id: i64,
        kind: &str,
        name: &str,
        ttl: Duration,
    ) -> Result<AccessToken>;
}

/// Name of the token minted for an execution at `now`.
pub fn execution_token_name(execution_id: i64, now: DateTime<Utc>) -> String {
    format!("{execution_id}-{}", now.timestamp())
}

/// Hex encoded SHA-256 digest of a token value.
pub fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Issues random tokens and records their digests in the database.
pub struct DatabaseTokenIssuer {
    persistence: Arc<dyn Persistence>,
}

impl DatabaseTokenIssuer {
    /// Create an issuer writing to `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    fn generate() -> (String, String) {
        let id = Uuid::new_v4();
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        let mut material = id.as_bytes().to_vec();
        material.extend_from_slice(&secret);

        (id.to_string(), URL_SAFE_NO_PAD.encode(material))
    }
}

#[async_trait]
impl TokenIssuer for DatabaseTokenIssuer {
    async fn create_access_token(
        &self,
        subject_id: i64,
        kind: &str,
        name: &str,
        ttl: Duration,
    ) -> Result<AccessToken> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Token(format!("invalid ttl: {e}")))?;
        let now = Utc::now();
        let (id, value) = Self::generate();

        let record = TokenRecord {
            id,
            subject_id,
            kind: kind.to_string(),
            name: name.to_string(),
            value_hash: digest(&value),
            expires_at: now + ttl,
            create_time: now,
        };
        self.persistence.insert_token(&record).await?;

        Ok(AccessToken {
            value,
            expires_at: record.expires_at,
        })
    }
}

/// Issued token as seen by [`StaticTokenIssuer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Subject
    pub subject_id: i64,
    /// Kind
    pub kind: String,
    /// Name
    pub name: String,
    /// Lifetime
    pub ttl: Duration,
}

/// Deterministic issuer for tests: returns `token-1`, `token-2`, ...
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIssuer {
    counter: Arc<AtomicUsize>,
    issued: Arc<Mutex<Vec<IssuedToken>>>,
    fail_next: Arc<Mutex<Option<String>>>,
}

impl StaticTokenIssuer {
    /// Create an issuer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens issued so far.
    pub async fn issued(&self) -> Vec<IssuedToken> {
        self.issued.lock().await.clone()
    }

    /// Make the next issue fail.
    pub async fn fail_next_issue(&self, message: &str) {
        *self.fail_next.lock().await = Some(message.to_string());
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn create_access_token(
        &self,
        subject_id: i64,
        kind: &str,
        name: &str,
        ttl: Duration,
    ) -> Result<AccessToken> {
        if let Some(message) = self.fail_next.lock().await.take() {
            return Err(Error::Token(message));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.issued.lock().await.push(IssuedToken {
            subject_id,
            kind: kind.to_string(),
            name: name.to_string(),
            ttl,
        });

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Token(format!("invalid ttl: {e}")))?;

        Ok(AccessToken {
            value: format!("token-{n}"),
            expires_at: Utc::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::sqlite_persistence;

    #[test]
    fn test_digest_is_hex_sha256() {
        let d = digest("abc");
        assert_eq!(d.len(), 64);
        assert_eq!(
            d,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_execution_token_name() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp");
        assert_eq!(execution_token_name(12, now), "12-1700000000");
    }

    #[tokio::test]
    async fn test_database_issuer_stores_digest_only() {
        let persistence = sqlite_persistence().await;
        let subject = persistence.create_subject("alice").await.expect("subject");
        let issuer = DatabaseTokenIssuer::new(persistence.clone());

        let first = issuer
            .create_access_token(subject.id, TOKEN_KIND_DEPLOYMENT, "1-1", Duration::from_secs(60))
            .await
            .expect("issue");
        let second = issuer
            .create_access_token(subject.id, TOKEN_KIND_DEPLOYMENT, "1-2", Duration::from_secs(60))
            .await
            .expect("issue");

        assert_ne!(first.value, second.value);
        assert!(first.expires_at > Utc::now());
        assert!(
            URL_SAFE_NO_PAD
                .decode(&first.value)
                .is_ok_and(|raw| raw.len() == 48)
        );
    }

    #[tokio::test]
    async fn test_static_issuer_counts_calls() {
        let issuer = StaticTokenIssuer::new();
        let a = issuer
            .create_access_token(1, TOKEN_KIND_DEPLOYMENT, "a", Duration::from_secs(1))
            .await
            .expect("issue");
        let b = issuer
            .create_access_token(1, TOKEN_KIND_DEPLOYMENT, "b", Duration::from_secs(1))
            .await
            .expect("issue");

        assert_eq!(a.value, "token-1");
        assert_eq!(b.value, "token-2");
        let issued = issuer.issued().await;
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[1].name, "b");
    }
}
