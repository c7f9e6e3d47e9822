use async_trait::async_trait;
use matchload_proto::find_neighbors_request::{query, Query};
use matchload_proto::{
    FindNeighborsRequest, IndexDatapoint, MatchServiceClient, SparseEmbedding,
    FIND_NEIGHBORS_PATH,
};
use std::sync::Arc;
use tonic::metadata::MetadataValue;

use super::{NeighborSearch, ResponseSummary};
use crate::context::ClientContext;
use crate::credentials::CredentialManager;
use crate::error::{AuthError, CallError, CallResult, ConfigError, LoadResult};
use crate::events::{EventSink, Protocol};
use crate::interceptor::Instrumented;
use crate::payload::{QueryVector, RequestEnvelope};
use crate::pool::PooledChannel;

/// Responses with full datapoints can be large.
const MAX_DECODING_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Protobuf over a pooled gRPC channel.
pub struct GrpcTransport {
    channel: Arc<PooledChannel>,
    credentials: Arc<CredentialManager>,
    interceptor: Instrumented,
    bearer_auth: bool,
}

impl GrpcTransport {
    pub fn new(
        channel: Arc<PooledChannel>,
        credentials: Arc<CredentialManager>,
        sink: Arc<dyn EventSink>,
        timeout: std::time::Duration,
    ) -> Self {
        let bearer_auth = channel.is_secure();
        Self {
            channel,
            credentials,
            interceptor: Instrumented::new(sink, timeout),
            bearer_auth,
        }
    }

    /// Overrides whether calls carry a bearer token. Defaults to the
    /// channel's TLS setting.
    #[must_use]
    pub fn with_bearer_auth(mut self, enabled: bool) -> Self {
        self.bearer_auth = enabled;
        self
    }

    /// Acquires the shared channel for the configured address.
    pub async fn from_context(ctx: &ClientContext) -> LoadResult<Self> {
        let config = ctx.config();
        let address = config.grpc_address.as_deref().ok_or_else(|| {
            ConfigError::invalid("gRPC traffic requires target.grpc_address")
        })?;
        let channel = ctx
            .channels()
            .get_channel(address, config.grpc_secure())
            .await?;
        Ok(Self::new(
            channel,
            Arc::clone(ctx.credentials()),
            Arc::clone(ctx.sink()),
            config.request_timeout,
        ))
    }

    /// Attaches a bearer token and returns it.
    async fn authorize(
        &self,
        request: &mut tonic::Request<FindNeighborsRequest>,
    ) -> CallResult<String> {
        let token = self.credentials.token().await?;
        let value = MetadataValue::try_from(format!("Bearer {token}"))
            .map_err(|_| AuthError::invalid_response("token is not a valid header value"))?;
        request.metadata_mut().insert("authorization", value);
        Ok(token)
    }
}

#[async_trait]
impl NeighborSearch for GrpcTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    async fn find_neighbors(&self, envelope: &RequestEnvelope) -> CallResult<ResponseSummary> {
        let mut request = tonic::Request::new(to_proto(envelope));
        let mut sent_token = None;
        if self.bearer_auth {
            match self.authorize(&mut request).await {
                Ok(token) => sent_token = Some(token),
                Err(e) => return Err(self.interceptor.reject(FIND_NEIGHBORS_PATH, e)),
            }
        }

        let mut client = MatchServiceClient::new(self.channel.channel())
            .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE);
        let result = self
            .interceptor
            .unary(FIND_NEIGHBORS_PATH, client.find_neighbors(request))
            .await;

        match result {
            Ok(outcome) => Ok(ResponseSummary {
                latency: outcome.latency,
                response_bytes: outcome.response_bytes,
                neighbor_count: outcome.message.neighbor_count(),
            }),
            Err(error) => {
                if let Some(token) = sent_token
                    .as_deref()
                    .filter(|_| matches!(error, CallError::Auth(AuthError::Rejected { .. })))
                {
                    if let Err(e) = self.credentials.force_refresh(token).await {
                        tracing::warn!(error = %e, "token refresh after UNAUTHENTICATED failed");
                    }
                }
                Err(error)
            }
        }
    }
}

fn to_proto(envelope: &RequestEnvelope) -> FindNeighborsRequest {
    let neighbor_count = i32::try_from(envelope.neighbor_count).unwrap_or(i32::MAX);
    let to_query = |vector: &QueryVector| Query {
        datapoint: Some(IndexDatapoint {
            datapoint_id: vector.id.clone(),
            feature_vector: vector.dense.clone(),
            sparse_embedding: vector.sparse.as_ref().map(|s| SparseEmbedding {
                values: s.values.clone(),
                dimensions: s.dimensions.iter().map(|&d| d as i64).collect(),
            }),
            ..Default::default()
        }),
        neighbor_count,
        fraction_leaf_nodes_to_search_override: envelope
            .fraction_leaf_nodes_to_search_override
            .unwrap_or_default(),
        ranking: envelope
            .rrf_alpha
            .map(|alpha| query::Ranking::Rrf(query::Rrf { alpha })),
        ..Default::default()
    };

    FindNeighborsRequest {
        index_endpoint: envelope.index_endpoint.clone(),
        deployed_index_id: envelope.deployed_index_id.clone(),
        queries: envelope.queries.iter().map(to_query).collect(),
        return_full_datapoint: envelope.return_full_datapoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialManager;
    use crate::payload::SparseVector;
    use crate::pool::ChannelPool;
    use crate::testing::{static_credentials, Recorder, SequenceSource};
    use matchload_proto::find_neighbors_response::{NearestNeighbors, Neighbor};
    use matchload_proto::match_service_server::{MatchService, MatchServiceServer};
    use matchload_proto::FindNeighborsResponse;
    use parking_lot::Mutex;
    use prost::Message;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tonic::{Request, Response, Status};

    /// Answers every query with `response`; rejects `Bearer token-1`.
    struct FakeMatchService {
        response: FindNeighborsResponse,
        authorizations: Arc<Mutex<Vec<String>>>,
    }

    #[tonic::async_trait]
    impl MatchService for FakeMatchService {
        async fn find_neighbors(
            &self,
            request: Request<FindNeighborsRequest>,
        ) -> Result<Response<FindNeighborsResponse>, Status> {
            let authorization = request
                .metadata()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            self.authorizations.lock().push(authorization.clone());

            if authorization == "Bearer token-1" {
                return Err(Status::unauthenticated("token expired"));
            }
            if request.get_ref().deployed_index_id != "deployed" {
                return Err(Status::invalid_argument("unknown deployed index"));
            }
            Ok(Response::new(self.response.clone()))
        }
    }

    fn neighbors_response() -> FindNeighborsResponse {
        let neighbor = |id: &str, distance| Neighbor {
            datapoint: Some(IndexDatapoint {
                datapoint_id: id.to_string(),
                ..Default::default()
            }),
            distance,
            ..Default::default()
        };
        FindNeighborsResponse {
            nearest_neighbors: vec![NearestNeighbors {
                id: "0".to_string(),
                neighbors: vec![neighbor("a", 0.1), neighbor("b", 0.2), neighbor("c", 0.3)],
            }],
        }
    }

    /// Serves a fake `MatchService` on an ephemeral local port.
    async fn serve_match_service(service: FakeMatchService) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = futures::stream::unfold(listener, |listener| async move {
            let conn = listener.accept().await.map(|(stream, _)| stream);
            Some((conn, listener))
        });
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(MatchServiceServer::new(service))
                .serve_with_incoming(Box::pin(incoming)),
        );
        addr
    }

    async fn plaintext_transport(
        addr: SocketAddr,
        credentials: Arc<CredentialManager>,
        recorder: &Arc<Recorder>,
    ) -> GrpcTransport {
        let pool = ChannelPool::new(
            Arc::clone(&credentials),
            Duration::from_secs(2),
            Duration::from_secs(5),
        );
        let channel = pool.get_channel(&addr.to_string(), false).await.unwrap();
        GrpcTransport::new(channel, credentials, recorder.clone(), Duration::from_secs(5))
            .with_bearer_auth(true)
    }

    fn envelope() -> RequestEnvelope {
        RequestEnvelope {
            index_endpoint: "projects/1/locations/us-central1/indexEndpoints/2".to_string(),
            deployed_index_id: "deployed".to_string(),
            queries: vec![QueryVector {
                id: "0".to_string(),
                dense: vec![0.25; 4],
                sparse: Some(SparseVector {
                    dimensions: vec![1, 9],
                    values: vec![0.5, -0.5],
                }),
            }],
            neighbor_count: 20,
            fraction_leaf_nodes_to_search_override: None,
            return_full_datapoint: true,
            rrf_alpha: Some(0.7),
        }
    }

    #[test]
    fn test_to_proto() {
        let request = to_proto(&envelope());

        assert_eq!(request.deployed_index_id, "deployed");
        assert!(request.return_full_datapoint);
        let first = &request.queries[0];
        assert_eq!(first.neighbor_count, 20);
        assert_eq!(first.fraction_leaf_nodes_to_search_override, 0.0);
        assert_eq!(
            first.ranking,
            Some(query::Ranking::Rrf(query::Rrf { alpha: 0.7 }))
        );

        let datapoint = first.datapoint.as_ref().unwrap();
        assert_eq!(datapoint.feature_vector.len(), 4);
        assert_eq!(
            datapoint.sparse_embedding.as_ref().unwrap().dimensions,
            vec![1, 9]
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_emits_one_failure() {
        let credentials = Arc::new(CredentialManager::without_source());
        let pool = ChannelPool::new(
            Arc::clone(&credentials),
            Duration::from_millis(500),
            Duration::from_secs(2),
        );
        let channel = pool.get_channel("127.0.0.1:1", false).await.unwrap();

        let recorder = Recorder::new();
        let transport = GrpcTransport::new(
            channel,
            credentials,
            recorder.clone(),
            Duration::from_secs(2),
        );

        assert!(transport.find_neighbors(&envelope()).await.is_err());

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert_eq!(events[0].protocol, Protocol::Grpc);
        assert_eq!(events[0].operation, FIND_NEIGHBORS_PATH);
        assert_eq!(events[0].response_bytes, 0);
    }

    #[tokio::test]
    async fn test_secure_call_without_token_is_rejected_before_dispatch() {
        let pool = ChannelPool::new(
            static_credentials("t"),
            Duration::from_millis(500),
            Duration::from_secs(2),
        );
        let channel = pool.get_channel("127.0.0.1:1", true).await.unwrap();

        // The channel exists but this transport's manager cannot mint tokens.
        let recorder = Recorder::new();
        let transport = GrpcTransport::new(
            channel,
            Arc::new(CredentialManager::without_source()),
            recorder.clone(),
            Duration::from_secs(2),
        );

        let err = transport.find_neighbors(&envelope()).await.unwrap_err();
        assert!(matches!(err, CallError::Auth(AuthError::NoCredentialSource)));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].latency, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_success_reports_encoded_size() {
        let authorizations = Arc::new(Mutex::new(Vec::new()));
        let addr = serve_match_service(FakeMatchService {
            response: neighbors_response(),
            authorizations: Arc::clone(&authorizations),
        })
        .await;

        let recorder = Recorder::new();
        let transport = plaintext_transport(addr, static_credentials("secret"), &recorder).await;
        let summary = transport.find_neighbors(&envelope()).await.unwrap();

        let expected = neighbors_response().encoded_len();
        assert_eq!(summary.neighbor_count, 3);
        assert_eq!(summary.response_bytes, expected);
        assert_eq!(*authorizations.lock(), ["Bearer secret"]);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].success);
        assert_eq!(events[0].protocol, Protocol::Grpc);
        assert_eq!(events[0].operation, FIND_NEIGHBORS_PATH);
        assert_eq!(events[0].response_bytes, expected);
    }

    #[tokio::test]
    async fn test_unauthenticated_refreshes_once() {
        let authorizations = Arc::new(Mutex::new(Vec::new()));
        let addr = serve_match_service(FakeMatchService {
            response: neighbors_response(),
            authorizations: Arc::clone(&authorizations),
        })
        .await;

        let source = SequenceSource::new();
        let credentials = Arc::new(CredentialManager::new(
            source.clone(),
            Duration::from_secs(60),
        ));
        let recorder = Recorder::new();
        let transport = plaintext_transport(addr, Arc::clone(&credentials), &recorder).await;

        let err = transport.find_neighbors(&envelope()).await.unwrap_err();
        assert!(matches!(err, CallError::Auth(AuthError::Rejected { .. })));
        // One initial fetch plus exactly one forced refresh.
        assert_eq!(credentials.refresh_count(), 2);
        assert_eq!(source.fetches(), 2);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert_eq!(events[0].response_bytes, 0);

        assert!(transport.find_neighbors(&envelope()).await.is_ok());
        assert_eq!(source.fetches(), 2);
        assert_eq!(*authorizations.lock(), ["Bearer token-1", "Bearer token-2"]);
        assert_eq!(recorder.events().len(), 2);
    }

    #[tokio::test]
    async fn test_plaintext_channel_sends_no_token_by_default() {
        let authorizations = Arc::new(Mutex::new(Vec::new()));
        let addr = serve_match_service(FakeMatchService {
            response: neighbors_response(),
            authorizations: Arc::clone(&authorizations),
        })
        .await;

        let credentials = Arc::new(CredentialManager::without_source());
        let pool = ChannelPool::new(
            Arc::clone(&credentials),
            Duration::from_secs(2),
            Duration::from_secs(5),
        );
        let channel = pool.get_channel(&addr.to_string(), false).await.unwrap();
        let recorder = Recorder::new();
        let transport =
            GrpcTransport::new(channel, credentials, recorder.clone(), Duration::from_secs(5));

        assert!(transport.find_neighbors(&envelope()).await.is_ok());
        assert_eq!(*authorizations.lock(), [""]);
    }
}
