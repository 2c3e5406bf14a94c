// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared plumbing for the REST clients (runner and Kubernetes).

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, Result};

/// Default timeout for unary requests.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body returned by both APIs. Kubernetes sends a `Status` object and
/// the runner a gRPC gateway error; both carry `message`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Parse a base URL and make sure relative joins keep its path.
pub(crate) fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url)
}

/// Default headers carrying an optional bearer token.
pub(crate) fn bearer_headers(token: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::InvalidRequest("invalid bearer token".to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Decode a successful JSON response or map the error.
pub(crate) async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(extract_error(response).await)
    }
}

/// Fail on a non-success response, returning it otherwise.
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(extract_error(response).await)
    }
}

/// Turn an error response into an [`Error`].
pub(crate) async fn extract_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) if !body.message.is_empty() => body.message,
        _ => format!("HTTP {status}"),
    };

    if status == 404 {
        Error::NotFound(message)
    } else {
        Error::Api { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let url = base_url("https://argo.example:2746/prefix").expect("parse");
        assert_eq!(
            url.join("api/v1/workflows").expect("join").as_str(),
            "https://argo.example:2746/prefix/api/v1/workflows"
        );
    }

    #[test]
    fn test_bearer_headers() {
        assert!(bearer_headers(None).expect("headers").is_empty());
        let headers = bearer_headers(Some("abc")).expect("headers");
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");
        assert!(bearer_headers(Some("bad\nvalue")).is_err());
    }
}
