//! Protobuf definitions for the Vertex AI `MatchService` gRPC API.
//!
//! Only the subset needed to issue `FindNeighbors` queries is compiled. Field
//! numbers follow the published `google.cloud.aiplatform.v1` package so the
//! messages interoperate with the real service.

pub mod google {
    pub mod cloud {
        pub mod aiplatform {
            pub mod v1 {
                tonic::include_proto!("google.cloud.aiplatform.v1");

                impl FindNeighborsResponse {
                    /// Total neighbors across all queries.
                    pub fn neighbor_count(&self) -> usize {
                        self.nearest_neighbors
                            .iter()
                            .map(|nn| nn.neighbors.len())
                            .sum()
                    }
                }
            }
        }
    }
}

pub use google::cloud::aiplatform::v1::match_service_client::MatchServiceClient;
pub use google::cloud::aiplatform::v1::match_service_server;
pub use google::cloud::aiplatform::v1::*;

/// Full method path of `MatchService.FindNeighbors`.
pub const FIND_NEIGHBORS_PATH: &str = "/google.cloud.aiplatform.v1.MatchService/FindNeighbors";
