//! Bearer token lifecycle.
//!
//! A single [`CredentialManager`] is shared by every virtual user. Reads are
//! served from a cached [`Credential`] behind a read lock; refreshes are
//! serialized by an async mutex so concurrent callers that observe an
//! expired token collapse into one in-flight refresh.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{AuthSettings, AuthSource};
use crate::error::{AuthError, AuthResult};

/// Upper bound on a single token fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Instant,
}

impl Credential {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Instant::now() + lifetime,
        }
    }
}

/// Produces fresh credentials on demand.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Fetches a new credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing source is unreachable or answers
    /// with something that is not a token.
    async fn fetch(&self) -> AuthResult<Credential>;
}

/// Serves a fixed token with a nominal lifetime.
pub struct StaticTokenSource {
    token: String,
    lifetime: Duration,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            token: token.into(),
            lifetime,
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> AuthResult<Credential> {
        Ok(Credential::new(self.token.clone(), self.lifetime))
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Fetches service-account tokens from the GCE metadata server.
pub struct MetadataServerTokenSource {
    client: reqwest::Client,
    url: String,
}

impl MetadataServerTokenSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataServerTokenSource {
    fn name(&self) -> &'static str {
        "metadata_server"
    }

    async fn fetch(&self) -> AuthResult<Credential> {
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| AuthError::refresh(format!("metadata server unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::refresh(format!(
                "metadata server returned {status}"
            )));
        }

        let body: MetadataToken = response
            .json()
            .await
            .map_err(|e| AuthError::invalid_response(e.to_string()))?;

        if body.access_token.is_empty() {
            return Err(AuthError::invalid_response("empty access_token"));
        }

        Ok(Credential::new(
            body.access_token,
            Duration::from_secs(body.expires_in),
        ))
    }
}

/// Shells out to `gcloud auth print-access-token`.
pub struct GcloudTokenSource {
    lifetime: Duration,
}

impl GcloudTokenSource {
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }
}

#[async_trait]
impl TokenSource for GcloudTokenSource {
    fn name(&self) -> &'static str {
        "gcloud"
    }

    async fn fetch(&self) -> AuthResult<Credential> {
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AuthError::refresh(format!("failed to run gcloud: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::refresh(format!(
                "gcloud exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8(output.stdout)
            .map_err(|e| AuthError::invalid_response(e.to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::invalid_response("gcloud printed no token"));
        }

        Ok(Credential::new(token, self.lifetime))
    }
}

/// Shared, single-flight bearer token cache.
pub struct CredentialManager {
    source: Option<Arc<dyn TokenSource>>,
    refresh_margin: Duration,
    current: RwLock<Option<Credential>>,
    refresh_lock: Mutex<()>,
    /// Bumped after every successful refresh.
    generation: AtomicU64,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn TokenSource>, refresh_margin: Duration) -> Self {
        Self {
            source: Some(source),
            refresh_margin,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// A manager that fails every request with `NoCredentialSource`.
    pub fn without_source() -> Self {
        Self {
            source: None,
            refresh_margin: Duration::ZERO,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Builds the manager for the configured source.
    pub fn from_settings(settings: &AuthSettings, http: reqwest::Client) -> Self {
        let source: Arc<dyn TokenSource> = match settings.source {
            AuthSource::None => return Self::without_source(),
            AuthSource::Static => Arc::new(StaticTokenSource::new(
                settings.token.clone().unwrap_or_default(),
                settings.token_lifetime,
            )),
            AuthSource::MetadataServer => Arc::new(MetadataServerTokenSource::new(
                http,
                settings.metadata_url.clone(),
            )),
            AuthSource::Gcloud => Arc::new(GcloudTokenSource::new(settings.token_lifetime)),
        };
        Self::new(source, settings.refresh_margin)
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Number of successful refreshes so far.
    pub fn refresh_count(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns a valid token, refreshing when within the safety margin of expiry.
    pub async fn token(&self) -> AuthResult<String> {
        let source = self.source.as_ref().ok_or(AuthError::NoCredentialSource)?;

        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        self.refresh_locked(source.as_ref()).await
    }

    /// Refreshes after the service rejected `rejected`.
    ///
    /// If a peer already replaced that token, the replacement is returned
    /// without another fetch.
    pub async fn force_refresh(&self, rejected: &str) -> AuthResult<String> {
        let source = self.source.as_ref().ok_or(AuthError::NoCredentialSource)?;

        let _guard = self.refresh_lock.lock().await;
        let current = self.current.read().as_ref().map(|c| c.token.clone());
        match current {
            Some(token) if token != rejected => Ok(token),
            _ => self.refresh_locked(source.as_ref()).await,
        }
    }

    fn fresh_token(&self) -> Option<String> {
        let current = self.current.read();
        let credential = current.as_ref()?;
        (Instant::now() + self.refresh_margin < credential.expires_at)
            .then(|| credential.token.clone())
    }

    async fn refresh_locked(&self, source: &dyn TokenSource) -> AuthResult<String> {
        let credential = match tokio::time::timeout(FETCH_TIMEOUT, source.fetch()).await {
            Ok(Ok(credential)) => credential,
            Ok(Err(e)) => {
                tracing::warn!(source = source.name(), error = %e, "token refresh failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(source = source.name(), "token refresh timed out");
                return Err(AuthError::refresh(format!(
                    "{} token fetch timed out after {:?}",
                    source.name(),
                    FETCH_TIMEOUT
                )));
            }
        };

        let token = credential.token.clone();
        let valid_for = credential
            .expires_at
            .saturating_duration_since(Instant::now());
        *self.current.write() = Some(credential);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::debug!(
            source = source.name(),
            generation,
            valid_for_secs = valid_for.as_secs(),
            "refreshed bearer token"
        );
        Ok(token)
    }
}
