//! Long-lived gRPC channels shared by all virtual users.
//!
//! Channels are keyed by `(address, secure)` and live for the process
//! lifetime. Lookups take a read lock only; creation is serialized so two
//! users racing on a cold key build a single channel.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::credentials::CredentialManager;
use crate::error::{LoadError, LoadResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub address: String,
    pub secure: bool,
}

/// A connection handle plus the key it was created for.
#[derive(Debug)]
pub struct PooledChannel {
    key: ChannelKey,
    channel: Channel,
}

impl PooledChannel {
    /// Cheap handle clone; all clones share one HTTP/2 connection.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn address(&self) -> &str {
        &self.key.address
    }

    pub fn is_secure(&self) -> bool {
        self.key.secure
    }
}

pub struct ChannelPool {
    channels: RwLock<HashMap<ChannelKey, Arc<PooledChannel>>>,
    create_lock: Mutex<()>,
    credentials: Arc<CredentialManager>,
    cache: bool,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ChannelPool {
    pub fn new(
        credentials: Arc<CredentialManager>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            credentials,
            cache: true,
            connect_timeout,
            request_timeout,
        }
    }

    /// A pool that builds a fresh channel on every request.
    pub fn uncached(
        credentials: Arc<CredentialManager>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache: false,
            ..Self::new(credentials, connect_timeout, request_timeout)
        }
    }

    /// Number of cached channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the channel for `(address, secure)`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Secure channels require a credential up front and fail with
    /// `LoadError::Auth` when none can be obtained. A malformed address or
    /// TLS setup fails with `LoadError::Channel`.
    pub async fn get_channel(&self, address: &str, secure: bool) -> LoadResult<Arc<PooledChannel>> {
        let key = ChannelKey {
            address: address.to_string(),
            secure,
        };

        if !self.cache {
            return self.create(key).await.map(Arc::new);
        }

        let cached = self.channels.read().get(&key).cloned();
        if let Some(channel) = cached {
            return Ok(channel);
        }

        let _guard = self.create_lock.lock().await;
        let cached = self.channels.read().get(&key).cloned();
        if let Some(channel) = cached {
            return Ok(channel);
        }

        let channel = Arc::new(self.create(key.clone()).await?);
        self.channels.write().insert(key, Arc::clone(&channel));
        Ok(channel)
    }

    async fn create(&self, key: ChannelKey) -> LoadResult<PooledChannel> {
        if key.secure {
            // Public endpoints are unusable without a token; fail before dialing.
            self.credentials.token().await?;
        }

        let uri = if key.address.contains("://") {
            key.address.clone()
        } else if key.secure {
            format!("https://{}", key.address)
        } else {
            format!("http://{}", key.address)
        };

        let channel_error = |message: String| LoadError::Channel {
            address: key.address.clone(),
            message,
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| channel_error(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_while_idle(true);

        if key.secure {
            let tls = ClientTlsConfig::new().domain_name(host_of(&key.address));
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| channel_error(e.to_string()))?;
        }

        let channel = endpoint.connect_lazy();
        tracing::info!(
            address = %key.address,
            secure = key.secure,
            cached = self.cache,
            "created grpc channel"
        );

        Ok(PooledChannel { key, channel })
    }
}

/// Host part of `host:port` or `scheme://host:port`.
fn host_of(address: &str) -> &str {
    let without_scheme = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    without_scheme
        .rsplit_once(':')
        .map_or(without_scheme, |(host, _)| host)
}
