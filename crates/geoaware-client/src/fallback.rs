//! One-shot HTTP fetch of the zone list, used after live retries run out.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

use geoaware_core::{normalize, NormalizeContext, Snapshot};

use crate::error::ClientError;

/// `{base}/{space_id}`, with the space id percent-encoded as one path segment.
pub fn fallback_url(base: &str, space_id: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base)
        .map_err(|err| ClientError::Config(format!("invalid fallback URL: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Config(format!("fallback URL cannot be a base: {base}")))?
        .pop_if_empty()
        .push(space_id);
    Ok(url)
}

pub struct FallbackFetcher {
    client: Client,
    auth_token: Option<String>,
}

impl FallbackFetcher {
    pub fn new(timeout: Duration, auth_token: Option<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, auth_token })
    }

    /// Fetch and normalize the zone list for `space_id`.
    pub async fn fetch(&self, url: Url, space_id: &str) -> Result<Snapshot, ClientError> {
        let body = self
            .fetch_body(url)
            .await
            .map_err(|err| ClientError::Fallback(format!("{err:#}")))?;
        normalize(&body, &NormalizeContext::fallback(space_id, Utc::now()))
            .map_err(|err| ClientError::Fallback(err.to_string()))
    }

    async fn fetch_body(&self, url: Url) -> Result<Value> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = self.auth_token.as_deref() {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GET {url} returned {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to decode zones response")
    }
}
