use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{NeighborSearch, ResponseSummary};
use crate::context::ClientContext;
use crate::credentials::CredentialManager;
use crate::error::{AuthError, CallError, CallResult, ConfigError, LoadResult};
use crate::events::{EventSink, MetricEvent, Protocol};
use crate::payload::{QueryVector, RequestEnvelope};

const OPERATION: &str = "findNeighbors";

/// Error bodies beyond this many bytes are truncated in failure details.
const MAX_ERROR_BODY: usize = 512;

/// One authenticated JSON POST endpoint.
///
/// Fetches the bearer token, times the exchange and emits exactly one event.
/// Only `200 OK` counts as success.
pub(super) struct JsonEndpoint {
    client: reqwest::Client,
    url: String,
    operation: &'static str,
    credentials: Arc<CredentialManager>,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl JsonEndpoint {
    pub(super) fn new(
        client: reqwest::Client,
        base_url: &str,
        resource: &str,
        operation: &'static str,
        credentials: Arc<CredentialManager>,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        let url = format!(
            "{}/v1/{}:{operation}",
            base_url.trim_end_matches('/'),
            resource.trim_start_matches('/')
        );
        Self {
            client,
            url,
            operation,
            credentials,
            sink,
            timeout,
        }
    }

    pub(super) fn url(&self) -> &str {
        &self.url
    }

    /// Posts `body` and summarizes the response with `parse`, which returns
    /// the neighbor count.
    pub(super) async fn call<B, P>(&self, body: &B, parse: P) -> CallResult<ResponseSummary>
    where
        B: Serialize + Sync,
        P: FnOnce(&[u8]) -> Result<usize, String>,
    {
        let token = match self.credentials.token().await {
            Ok(token) => token,
            Err(e) => return Err(self.fail(Duration::ZERO, 0, e.into())),
        };

        let start = Instant::now();
        let (result, response_bytes) = self.send(body, &token, parse).await;
        let latency = start.elapsed();

        match result {
            Ok(neighbor_count) => {
                self.sink.emit(MetricEvent::success(
                    Protocol::Http,
                    self.operation,
                    latency,
                    response_bytes,
                ));
                Ok(ResponseSummary {
                    latency,
                    response_bytes,
                    neighbor_count,
                })
            }
            Err(error) => {
                if matches!(error, CallError::Auth(AuthError::Rejected { .. })) {
                    // The next iteration picks up the new token.
                    if let Err(e) = self.credentials.force_refresh(&token).await {
                        tracing::warn!(error = %e, "token refresh after 401 failed");
                    }
                }
                Err(self.fail(latency, response_bytes, error))
            }
        }
    }

    /// Sends one request. Returns the parsed result and the body size.
    async fn send<B, P>(&self, body: &B, token: &str, parse: P) -> (CallResult<usize>, usize)
    where
        B: Serialize + Sync,
        P: FnOnce(&[u8]) -> Result<usize, String>,
    {
        let response = match self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return (Err(request_error(e)), 0),
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return (Err(request_error(e)), 0),
        };
        let size = body.len();

        if status == StatusCode::UNAUTHORIZED {
            let message = format!("HTTP 401: {}", snippet(&body));
            return (Err(AuthError::rejected(message).into()), size);
        }
        if status != StatusCode::OK {
            let message = format!("HTTP {}: {}", status.as_u16(), snippet(&body));
            return (Err(CallError::protocol(Some(status.as_u16()), message)), size);
        }

        match parse(&body) {
            Ok(neighbor_count) => (Ok(neighbor_count), size),
            Err(e) => (Err(CallError::protocol(Some(status.as_u16()), e)), size),
        }
    }

    fn fail(&self, latency: Duration, response_bytes: usize, error: CallError) -> CallError {
        tracing::debug!(
            url = %self.url,
            kind = error.kind().as_str(),
            error = %error,
            "http call failed"
        );
        self.sink.emit(MetricEvent::failure(
            Protocol::Http,
            self.operation,
            latency,
            response_bytes,
            error.to_string(),
        ));
        error
    }
}

/// JSON over HTTPS against `{base}/v1/{index_endpoint}:findNeighbors`.
pub struct HttpTransport {
    endpoint: JsonEndpoint,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        index_endpoint: &str,
        credentials: Arc<CredentialManager>,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: JsonEndpoint::new(
                client,
                base_url,
                index_endpoint,
                OPERATION,
                credentials,
                sink,
                timeout,
            ),
        }
    }

    /// Builds the transport from the shared context.
    pub fn from_context(ctx: &ClientContext) -> LoadResult<Self> {
        let config = ctx.config();
        let base_url = config.http_base_url().ok_or_else(|| {
            ConfigError::invalid("HTTP traffic requires target.endpoint_host")
        })?;
        Ok(Self::new(
            ctx.http_client().clone(),
            &base_url,
            &config.index_endpoint,
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
impl NeighborSearch for HttpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn find_neighbors(&self, envelope: &RequestEnvelope) -> CallResult<ResponseSummary> {
        self.endpoint
            .call(&WireRequest::from(envelope), |body| {
                serde_json::from_slice::<WireResponse>(body)
                    .map(|parsed| parsed.neighbor_count())
                    .map_err(|e| format!("malformed response body: {e}"))
            })
            .await
    }
}

fn request_error(e: reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::timeout(e.to_string())
    } else {
        CallError::transport(e.to_string())
    }
}

fn snippet(body: &[u8]) -> String {
    let end = body.len().min(MAX_ERROR_BODY);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    deployed_index_id: &'a str,
    queries: Vec<WireQuery<'a>>,
    return_full_datapoint: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireQuery<'a> {
    datapoint: WireDatapoint<'a>,
    neighbor_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    fraction_leaf_nodes_to_search_override: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rrf: Option<WireRrf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WireDatapoint<'a> {
    datapoint_id: &'a str,
    #[serde(skip_serializing_if = "<[f32]>::is_empty")]
    feature_vector: &'a [f32],
    #[serde(skip_serializing_if = "Option::is_none")]
    sparse_embedding: Option<WireSparseEmbedding<'a>>,
}

#[derive(Debug, Serialize)]
struct WireSparseEmbedding<'a> {
    values: &'a [f32],
    dimensions: &'a [u64],
}

#[derive(Debug, Serialize)]
struct WireRrf {
    alpha: f32,
}

impl<'a> From<&'a QueryVector> for WireDatapoint<'a> {
    fn from(vector: &'a QueryVector) -> Self {
        Self {
            datapoint_id: &vector.id,
            feature_vector: &vector.dense,
            sparse_embedding: vector.sparse.as_ref().map(|s| WireSparseEmbedding {
                values: &s.values,
                dimensions: &s.dimensions,
            }),
        }
    }
}

impl<'a> From<&'a RequestEnvelope> for WireRequest<'a> {
    fn from(envelope: &'a RequestEnvelope) -> Self {
        let query = |vector: &'a QueryVector| WireQuery {
            datapoint: WireDatapoint::from(vector),
            neighbor_count: envelope.neighbor_count,
            fraction_leaf_nodes_to_search_override: envelope
                .fraction_leaf_nodes_to_search_override,
            rrf: envelope.rrf_alpha.map(|alpha| WireRrf { alpha }),
        };

        Self {
            deployed_index_id: &envelope.deployed_index_id,
            queries: envelope.queries.iter().map(query).collect(),
            return_full_datapoint: envelope.return_full_datapoint,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    nearest_neighbors: Vec<WireNearestNeighbors>,
}

#[derive(Debug, Deserialize)]
struct WireNearestNeighbors {
    #[serde(default)]
    neighbors: Vec<IgnoredAny>,
}

impl WireResponse {
    fn neighbor_count(&self) -> usize {
        self.nearest_neighbors.iter().map(|n| n.neighbors.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialManager;
    use crate::error::FailureKind;
    use crate::payload::SparseVector;
    use crate::testing::{serve, static_credentials, Recorder};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INDEX_ENDPOINT: &str = "projects/1/locations/us-central1/indexEndpoints/2";

    fn envelope() -> RequestEnvelope {
        RequestEnvelope {
            index_endpoint: INDEX_ENDPOINT.to_string(),
            deployed_index_id: "deployed".to_string(),
            queries: vec![QueryVector {
                id: "0".to_string(),
                dense: vec![1.0, 2.0, 3.0],
                sparse: None,
            }],
            neighbor_count: 20,
            fraction_leaf_nodes_to_search_override: None,
            return_full_datapoint: false,
            rrf_alpha: None,
        }
    }

    fn transport(
        base_url: &str,
        credentials: Arc<CredentialManager>,
        recorder: &Arc<Recorder>,
        timeout: Duration,
    ) -> HttpTransport {
        HttpTransport::new(
            reqwest::Client::new(),
            base_url,
            INDEX_ENDPOINT,
            credentials,
            recorder.clone(),
            timeout,
        )
    }

    #[test]
    fn test_url() {
        let recorder = Recorder::new();
        let t = transport(
            "https://1234.us-central1-5678.vdb.vertexai.goog/",
            static_credentials("t"),
            &recorder,
            Duration::from_secs(1),
        );
        assert_eq!(
            t.url(),
            "https://1234.us-central1-5678.vdb.vertexai.goog/v1/projects/1/locations/us-central1/indexEndpoints/2:findNeighbors"
        );
    }

    #[test]
    fn test_dense_wire_shape() {
        let env = envelope();
        let value = serde_json::to_value(WireRequest::from(&env)).unwrap();
        assert_eq!(
            value,
            json!({
                "deployedIndexId": "deployed",
                "returnFullDatapoint": false,
                "queries": [{
                    "datapoint": {
                        "datapointId": "0",
                        "featureVector": [1.0, 2.0, 3.0],
                    },
                    "neighborCount": 20,
                }],
            })
        );
    }

    #[test]
    fn test_sparse_hybrid_wire_shape() {
        let mut env = envelope();
        env.queries[0].dense.clear();
        env.queries[0].sparse = Some(SparseVector {
            dimensions: vec![3, 17],
            values: vec![0.5, -0.25],
        });
        env.rrf_alpha = Some(0.5);
        env.fraction_leaf_nodes_to_search_override = Some(0.1);

        let value = serde_json::to_value(WireRequest::from(&env)).unwrap();
        let query = &value["queries"][0];
        assert!(query["datapoint"].get("featureVector").is_none());
        assert_eq!(query["datapoint"]["sparseEmbedding"]["dimensions"], json!([3, 17]));
        assert_eq!(query["datapoint"]["sparseEmbedding"]["values"], json!([0.5, -0.25]));
        assert_eq!(query["rrf"]["alpha"], json!(0.5));
        assert_eq!(query["fractionLeafNodesToSearchOverride"], json!(0.1));
    }

    #[tokio::test]
    async fn test_success_emits_one_event() {
        let body = json!({
            "nearestNeighbors": [{
                "id": "0",
                "neighbors": [
                    {"datapoint": {"datapointId": "a"}, "distance": 0.1},
                    {"datapoint": {"datapointId": "b"}, "distance": 0.2},
                ],
            }],
        });
        let expected_size = serde_json::to_vec(&body).unwrap().len();

        let app = Router::new().fallback(move |headers: HeaderMap, Json(request): Json<Value>| {
            let body = body.clone();
            async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer secret");
                if !authorized || request["deployedIndexId"] != "deployed" {
                    return AxumStatus::BAD_REQUEST.into_response();
                }
                Json(body).into_response()
            }
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(
            &format!("http://{addr}"),
            static_credentials("secret"),
            &recorder,
            Duration::from_secs(5),
        );
        let summary = t.find_neighbors(&envelope()).await.unwrap();

        assert_eq!(summary.neighbor_count, 2);
        assert_eq!(summary.response_bytes, expected_size);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
        assert_eq!(events[0].protocol, Protocol::Http);
        assert_eq!(events[0].operation, "findNeighbors");
        assert_eq!(events[0].response_bytes, expected_size);
    }

    #[tokio::test]
    async fn test_unauthorized_forces_one_refresh() {
        let app = Router::new().fallback(|| async {
            (AxumStatus::UNAUTHORIZED, "Request had invalid authentication credentials.")
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let credentials = static_credentials("stale");
        let t = transport(
            &format!("http://{addr}"),
            Arc::clone(&credentials),
            &recorder,
            Duration::from_secs(5),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Auth);
        // One initial fetch plus exactly one forced refresh.
        assert_eq!(credentials.refresh_count(), 2);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert!(events[0].failure.as_deref().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_server_error_truncates_body() {
        let app = Router::new().fallback(|| async {
            (AxumStatus::INTERNAL_SERVER_ERROR, "e".repeat(4096))
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(
            &format!("http://{addr}"),
            static_credentials("secret"),
            &recorder,
            Duration::from_secs(5),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Protocol {
                status: Some(500),
                ..
            }
        ));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].response_bytes, 4096);
        let detail = events[0].failure.as_deref().unwrap();
        assert!(detail.contains("HTTP 500"));
        assert!(detail.len() < 600);
    }

    #[tokio::test]
    async fn test_non_200_success_status_is_failure() {
        let app = Router::new().fallback(|| async {
            (AxumStatus::ACCEPTED, Json(json!({"nearestNeighbors": []})))
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(
            &format!("http://{addr}"),
            static_credentials("secret"),
            &recorder,
            Duration::from_secs(5),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Protocol {
                status: Some(202),
                ..
            }
        ));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert!(events[0].failure.as_deref().unwrap().contains("HTTP 202"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let app = Router::new().fallback(|| async { "not json" });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(
            &format!("http://{addr}"),
            static_credentials("secret"),
            &recorder,
            Duration::from_secs(5),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_never_sends() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().fallback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Json(json!({})) }
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(
            &format!("http://{addr}"),
            Arc::new(CredentialManager::without_source()),
            &recorder,
            Duration::from_secs(5),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert!(matches!(err, CallError::Auth(AuthError::NoCredentialSource)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let recorder = Recorder::new();
        let t = transport(
            "http://127.0.0.1:1",
            static_credentials("secret"),
            &recorder,
            Duration::from_secs(5),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transport);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].response_bytes, 0);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let app = Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(json!({}))
        });
        let addr = serve(app).await;

        let recorder = Recorder::new();
        let t = transport(
            &format!("http://{addr}"),
            static_credentials("secret"),
            &recorder,
            Duration::from_millis(100),
        );

        let err = t.find_neighbors(&envelope()).await.unwrap_err();
        assert!(matches!(err, CallError::Transport { timed_out: true, .. }));
        assert_eq!(recorder.events().len(), 1);
    }
}
