//! Fakes shared by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::{Credential, CredentialManager, StaticTokenSource, TokenSource};
use crate::error::AuthResult;
use crate::events::{EventSink, MetricEvent};

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<MetricEvent>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for Recorder {
    fn emit(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}

pub(crate) fn static_credentials(token: &str) -> Arc<CredentialManager> {
    Arc::new(CredentialManager::new(
        Arc::new(StaticTokenSource::new(token, Duration::from_secs(3600))),
        Duration::from_secs(120),
    ))
}

/// Yields `token-1`, `token-2`, ... one per fetch.
#[derive(Default)]
pub(crate) struct SequenceSource {
    fetches: AtomicUsize,
}

impl SequenceSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for SequenceSource {
    fn name(&self) -> &'static str {
        "sequence"
    }

    async fn fetch(&self) -> AuthResult<Credential> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new(format!("token-{n}"), Duration::from_secs(3600)))
    }
}

/// Serves `app` on an ephemeral local port.
pub(crate) async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}
