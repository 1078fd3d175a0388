//! Registry client for anonymous, token-authenticated pulls.
//!
//! Speaks the distribution HTTP API directly: a pull token is obtained from
//! the auth endpoint, then every manifest and blob request carries it as a
//! bearer credential.

use std::time::Duration;

use chrono::{DateTime, Utc};
use minibox_core::config::RegistryConfig;
use minibox_core::error::{BoxError, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::Deserialize;

use super::image::ImageConfig;
use super::manifest::{
    select_platform, Descriptor, ManifestIndex, PlatformManifest, INDEX_MEDIA_TYPES,
    MANIFEST_MEDIA_TYPES,
};
use super::reference::ImageReference;

/// Lifetime assumed when the auth endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 60;

/// Bearer credential scoped to one repository and the pull action.
#[derive(Clone)]
pub struct PullToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl PullToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token is expired at `now`, with a small safety margin.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(5) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// Keep the credential out of logs.
impl std::fmt::Debug for PullToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    issued_at: Option<String>,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>) -> Result<PullToken> {
        let value = self
            .token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| BoxError::AuthError("token response carries no token".to_string()))?;

        let issued_at = self
            .issued_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);
        let lifetime = self
            .expires_in
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        Ok(PullToken::new(
            value,
            issued_at + chrono::Duration::seconds(lifetime),
        ))
    }
}

/// Pulls manifests and blobs from a single registry.
#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    config: RegistryConfig,
    /// Registry host, used to label errors
    registry: String,
}

impl RegistryClient {
    /// Create a client for the configured registry.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("minibox/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BoxError::Other(format!("Failed to build HTTP client: {}", e)))?;

        let registry = reqwest::Url::parse(&config.registry_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| config.registry_url.clone());

        Ok(Self {
            client,
            config,
            registry,
        })
    }

    /// Registry host name.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Obtain an anonymous pull token for `reference`.
    pub async fn fetch_token(&self, reference: &ImageReference) -> Result<PullToken> {
        let scope = reference.pull_scope();
        tracing::debug!(auth_url = %self.config.auth_url, scope = %scope, "Requesting pull token");

        let response = self
            .client
            .get(&self.config.auth_url)
            .query(&[("service", self.config.service.as_str()), ("scope", scope.as_str())])
            .send()
            .await
            .map_err(|e| BoxError::AuthError(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BoxError::AuthError(format!(
                "token endpoint returned HTTP {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BoxError::AuthError(format!("malformed token response: {}", e)))?;

        let token = body.into_token(Utc::now())?;
        tracing::debug!(expires_at = %token.expires_at(), "Obtained pull token");
        Ok(token)
    }

    /// Fetch the manifest index for the reference's tag.
    pub async fn fetch_manifest_index(
        &self,
        reference: &ImageReference,
        token: &PullToken,
    ) -> Result<ManifestIndex> {
        let url = self.manifest_url(reference, &reference.tag);
        let bytes = self.get_bytes(&url, token, INDEX_MEDIA_TYPES).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| self.registry_error(format!("Malformed manifest index: {}", e)))
    }

    /// Select the linux/amd64 entry from `index` and fetch its manifest.
    pub async fn select_platform_manifest(
        &self,
        reference: &ImageReference,
        index: &ManifestIndex,
        token: &PullToken,
    ) -> Result<PlatformManifest> {
        let entry = select_platform(index)?;
        tracing::debug!(digest = %entry.digest(), "Selected platform manifest");
        self.fetch_platform_manifest(reference, entry, token).await
    }

    /// Fetch a platform manifest by digest.
    pub async fn fetch_platform_manifest(
        &self,
        reference: &ImageReference,
        entry: &Descriptor,
        token: &PullToken,
    ) -> Result<PlatformManifest> {
        let url = self.manifest_url(reference, entry.digest());
        let bytes = self.get_bytes(&url, token, MANIFEST_MEDIA_TYPES).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| self.registry_error(format!("Malformed platform manifest: {}", e)))
    }

    /// Fetch and parse the config blob referenced by `manifest`.
    pub async fn fetch_config(
        &self,
        reference: &ImageReference,
        manifest: &PlatformManifest,
        token: &PullToken,
    ) -> Result<ImageConfig> {
        let bytes = self
            .fetch_blob(reference, manifest.config(), token)
            .await?
            .bytes()
            .await
            .map_err(|e| self.registry_error(format!("Failed to read config blob: {}", e)))?;
        ImageConfig::from_json(&bytes).map_err(|e| self.registry_error(e.to_string()))
    }

    /// Start a blob download. The body is not read; callers stream it with
    /// `bytes_stream()` so large layers never sit in memory.
    pub async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        token: &PullToken,
    ) -> Result<Response> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.config.registry_url,
            reference.repository,
            descriptor.digest()
        );
        self.get(&url, token, &[]).await
    }

    fn manifest_url(&self, reference: &ImageReference, reference_or_digest: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, reference.repository, reference_or_digest
        )
    }

    async fn get_bytes(&self, url: &str, token: &PullToken, accept: &[&str]) -> Result<Vec<u8>> {
        let response = self.get(url, token, accept).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.registry_error(format!("Failed to read {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    async fn get(&self, url: &str, token: &PullToken, accept: &[&str]) -> Result<Response> {
        let mut request = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", token.value()));
        if !accept.is_empty() {
            request = request.header(ACCEPT, accept.join(", "));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.registry_error(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.registry_error(format!(
                "GET {} returned HTTP {}: {}",
                url,
                status,
                body.trim()
            )));
        }

        Ok(response)
    }

    fn registry_error(&self, message: String) -> BoxError {
        BoxError::RegistryError {
            registry: self.registry.clone(),
            message,
        }
    }
}
