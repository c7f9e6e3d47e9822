//! Process-wide client state shared by every virtual user.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RunConfig;
use crate::credentials::CredentialManager;
use crate::error::{LoadError, LoadResult};
use crate::events::EventSink;
use crate::pool::ChannelPool;

/// Configuration plus the shared credential manager, channel pool, HTTP
/// client and event sink. Cloning is cheap.
#[derive(Clone)]
pub struct ClientContext {
    config: Arc<RunConfig>,
    credentials: Arc<CredentialManager>,
    channels: Arc<ChannelPool>,
    sink: Arc<dyn EventSink>,
    http: reqwest::Client,
}

impl ClientContext {
    /// Builds the shared clients for a validated configuration.
    pub fn new(config: RunConfig, sink: Arc<dyn EventSink>) -> LoadResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.users.max(1))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| LoadError::HttpClient(e.to_string()))?;

        let credentials = Arc::new(CredentialManager::from_settings(&config.auth, http.clone()));
        let needs_token = config.protocol.uses_http()
            || (config.protocol.uses_grpc() && config.grpc_secure());
        if needs_token && !credentials.has_source() {
            tracing::warn!("no credential source configured; authenticated calls will fail");
        }

        let channels = Arc::new(ChannelPool::new(
            Arc::clone(&credentials),
            config.connect_timeout,
            config.request_timeout,
        ));

        Ok(Self::with_parts(config, credentials, channels, sink, http))
    }

    /// Assembles a context from prebuilt parts.
    pub fn with_parts(
        config: RunConfig,
        credentials: Arc<CredentialManager>,
        channels: Arc<ChannelPool>,
        sink: Arc<dyn EventSink>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config: Arc::new(config),
            credentials,
            channels,
            sink,
            http,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn channels(&self) -> &Arc<ChannelPool> {
        &self.channels
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }
}
