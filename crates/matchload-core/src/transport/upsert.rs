use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::http::{JsonEndpoint, WireDatapoint};
use super::{DatapointWriter, ResponseSummary};
use crate::context::ClientContext;
use crate::credentials::CredentialManager;
use crate::error::{CallResult, ConfigError, LoadResult};
use crate::events::{EventSink, Protocol};
use crate::payload::UpsertEnvelope;

const OPERATION: &str = "upsertDatapoints";

/// JSON over HTTPS against `{base}/v1/{index}:upsertDatapoints`.
pub struct HttpUpsertTransport {
    endpoint: JsonEndpoint,
}

impl HttpUpsertTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        index: &str,
        credentials: Arc<CredentialManager>,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: JsonEndpoint::new(
                client,
                base_url,
                index,
                OPERATION,
                credentials,
                sink,
                timeout,
            ),
        }
    }

    pub fn from_context(ctx: &ClientContext) -> LoadResult<Self> {
        let config = ctx.config();
        let base_url = config.http_base_url().ok_or_else(|| {
            ConfigError::invalid("HTTP traffic requires target.endpoint_host")
        })?;
        let index = config
            .index
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("upserts require target.index"))?;
        Ok(Self::new(
            ctx.http_client().clone(),
            &base_url,
            index,
            Arc::clone(ctx.credentials()),
            Arc::clone(ctx.sink()),
            config.request_timeout,
        ))
    }

    pub fn url(&self) -> &str {
        self.endpoint.url()
    }
}

#[async_trait]
impl DatapointWriter for HttpUpsertTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn upsert_datapoints(&self, envelope: &UpsertEnvelope) -> CallResult<ResponseSummary> {
        // The service answers `{}`; only the status matters.
        self.endpoint
            .call(&WireUpsertRequest::from(envelope), |_| Ok(0))
            .await
    }
}

#[derive(Debug, Serialize)]
struct WireUpsertRequest<'a> {
    datapoints: Vec<WireDatapoint<'a>>,
}

impl<'a> From<&'a UpsertEnvelope> for WireUpsertRequest<'a> {
    fn from(envelope: &'a UpsertEnvelope) -> Self {
        Self {
            datapoints: envelope.datapoints.iter().map(WireDatapoint::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, CallError};
    use crate::payload::{QueryVector, SparseVector};
    use crate::testing::{serve, static_credentials, Recorder};
    use axum::extract::OriginalUri;
    use axum::http::StatusCode;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    const INDEX: &str = "projects/1/locations/us-central1/indexes/3";

    fn envelope() -> UpsertEnvelope {
        UpsertEnvelope {
            index: INDEX.to_string(),
            datapoints: vec![
                QueryVector {
                    id: "3f1c2a52-4a43-4b0b-8d3e-2b8d7c0e9a11".to_string(),
                    dense: vec![0.25, 0.5],
                    sparse: None,
                },
                QueryVector {
                    id: "9b0e5d7e-21c4-4f5f-a6c8-7f04c1d2e3b4".to_string(),
                    dense: vec![0.75, 0.125],
                    sparse: Some(SparseVector {
                        dimensions: vec![4, 8],
                        values: vec![-0.5, 0.5],
                    }),
                },
            ],
        }
    }

    fn transport(base_url: &str, recorder: &Arc<Recorder>) -> HttpUpsertTransport {
        HttpUpsertTransport::new(
            reqwest::Client::new(),
            base_url,
            INDEX,
            static_credentials("secret"),
            recorder.clone(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_url() {
        let recorder = Recorder::new();
        let t = transport("https://1234.us-central1-5678.vdb.vertexai.goog", &recorder);
        assert_eq!(
            t.url(),
            "https://1234.us-central1-5678.vdb.vertexai.goog/v1/projects/1/locations/us-central1/indexes/3:upsertDatapoints"
        );
    }

    #[tokio::test]
    async fn test_upsert_posts_datapoints() {
        let captured: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        let seen = Arc::clone(&captured);
        let app = Router::new().fallback(move |uri: OriginalUri, Json(body): Json<Value>| {
            seen.lock().push((uri.path().to_string(), body));
            async { Json(json!({})) }
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(&format!("http://{addr}"), &recorder);
        let summary = t.upsert_datapoints(&envelope()).await.unwrap();
        assert_eq!(summary.neighbor_count, 0);
        assert_eq!(summary.response_bytes, 2);

        let requests = captured.lock();
        assert_eq!(requests.len(), 1);
        let (path, body) = &requests[0];
        assert_eq!(path, &format!("/v1/{INDEX}:upsertDatapoints"));
        assert_eq!(
            body,
            &json!({
                "datapoints": [
                    {
                        "datapointId": "3f1c2a52-4a43-4b0b-8d3e-2b8d7c0e9a11",
                        "featureVector": [0.25, 0.5],
                    },
                    {
                        "datapointId": "9b0e5d7e-21c4-4f5f-a6c8-7f04c1d2e3b4",
                        "featureVector": [0.75, 0.125],
                        "sparseEmbedding": {"values": [-0.5, 0.5], "dimensions": [4, 8]},
                    },
                ],
            })
        );

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
        assert_eq!(events[0].protocol, Protocol::Http);
        assert_eq!(events[0].operation, "upsertDatapoints");
    }

    #[tokio::test]
    async fn test_upsert_unauthorized_is_one_auth_failure() {
        let app = Router::new().fallback(|| async { (StatusCode::UNAUTHORIZED, "expired") });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(&format!("http://{addr}"), &recorder);
        let err = t.upsert_datapoints(&envelope()).await.unwrap_err();
        assert!(matches!(err, CallError::Auth(AuthError::Rejected { .. })));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert_eq!(events[0].operation, "upsertDatapoints");
    }
}
