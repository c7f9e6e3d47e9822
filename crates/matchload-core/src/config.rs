//! Configuration management for load runs.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables (highest priority)
//! 2. TOML configuration file
//! 3. Default values (lowest priority)
//!
//! A [`Config`] is validated and then resolved into a [`RunConfig`], the
//! immutable view shared read-only by every virtual user.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::rate::{Pacing, MAX_INTERVAL};

/// Main configuration structure for a load run.
///
/// Can be loaded from TOML file or constructed with defaults.
/// Environment variables override TOML settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service under test
    #[serde(default)]
    pub target: TargetConfig,

    /// Query payload shape
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Per-request query parameters
    #[serde(default)]
    pub query: QueryConfig,

    /// Users, pacing and timeouts
    #[serde(default)]
    pub load: LoadConfig,

    /// Bearer credential source
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the target is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Internet-routed endpoint; TLS and a bearer token are mandatory.
    #[default]
    Public,
    /// Private service connect address; plaintext gRPC, no credential.
    Private,
}

/// Which wire protocol(s) each virtual user drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    Http,
    Grpc,
    Both,
}

impl ProtocolMode {
    pub fn uses_http(&self) -> bool {
        matches!(self, Self::Http | Self::Both)
    }

    pub fn uses_grpc(&self) -> bool {
        matches!(self, Self::Grpc | Self::Both)
    }
}

impl std::str::FromStr for ProtocolMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "grpc" => Ok(Self::Grpc),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::invalid(format!(
                "protocol must be one of: http, grpc, both (got {other})"
            ))),
        }
    }
}

/// Which API call each virtual user issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Query an index endpoint.
    #[default]
    FindNeighbors,
    /// Write fresh datapoints into an index. HTTP only.
    UpsertDatapoints,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindNeighbors => "findNeighbors",
            Self::UpsertDatapoints => "upsertDatapoints",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "").as_str() {
            "findneighbors" => Ok(Self::FindNeighbors),
            "upsertdatapoints" | "upsert" => Ok(Self::UpsertDatapoints),
            other => Err(ConfigError::invalid(format!(
                "operation must be find_neighbors or upsert_datapoints (got {other})"
            ))),
        }
    }
}

/// Shape of the synthesized query embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    Dense,
    Sparse,
    Hybrid,
}

impl EmbeddingKind {
    pub fn has_dense(&self) -> bool {
        matches!(self, Self::Dense | Self::Hybrid)
    }

    pub fn has_sparse(&self) -> bool {
        matches!(self, Self::Sparse | Self::Hybrid)
    }
}

/// Range dense feature values are drawn from. Must match the index schema.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DenseValueRange {
    /// Whole numbers in `[min, max]`, sent as integral floats.
    Integer { min: i32, max: i32 },
    /// Uniform floats in `[min, max)`.
    Float { min: f32, max: f32 },
}

impl Default for DenseValueRange {
    fn default() -> Self {
        Self::Integer {
            min: -1_000_000,
            max: 1_000_000,
        }
    }
}

/// Target service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Public HTTP endpoint host, without scheme (e.g. `123.us-central1-456.vdb.vertexai.goog`)
    #[serde(default)]
    pub endpoint_host: Option<String>,

    /// gRPC address as `host:port`; a private IP when `network = "private"`
    #[serde(default)]
    pub grpc_address: Option<String>,

    /// Index endpoint resource name (`projects/../locations/../indexEndpoints/..`)
    #[serde(default)]
    pub index_endpoint: String,

    /// Deployed index id
    #[serde(default)]
    pub deployed_index_id: String,

    /// Index resource name (`projects/../locations/../indexes/..`), the upsert target
    #[serde(default)]
    pub index: Option<String>,

    /// Call to issue (default: find_neighbors)
    #[serde(default)]
    pub operation: Operation,

    /// Network mode (default: public)
    #[serde(default)]
    pub network: NetworkMode,

    /// Protocol mode (default: grpc on a private network, http otherwise)
    #[serde(default)]
    pub protocol: Option<ProtocolMode>,
}

/// Query embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding kind (default: sparse when sparse dimensions are set, dense otherwise)
    #[serde(default)]
    pub kind: Option<EmbeddingKind>,

    /// Dense dimensionality (default: 768)
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Dense value range (default: integers in [-1000000, 1000000])
    #[serde(default)]
    pub dense_values: DenseValueRange,

    /// Sparse dimension space size (default: 0, disabled)
    #[serde(default)]
    pub sparse_dimensions: usize,

    /// Non-zero sparse dimensions per query (default: 0)
    #[serde(default)]
    pub sparse_active: usize,

    /// Lower bound of sparse values (default: -1.0)
    #[serde(default = "default_sparse_min")]
    pub sparse_value_min: f32,

    /// Upper bound of sparse values (default: 1.0)
    #[serde(default = "default_sparse_max")]
    pub sparse_value_max: f32,
}

/// Query parameter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Neighbors requested per query (default: 20)
    #[serde(default = "default_neighbor_count")]
    pub neighbor_count: u32,

    /// Fraction of leaf nodes to search, in (0, 1]; 0 keeps the index default
    #[serde(default)]
    pub fraction_leaf_nodes_to_search_override: f64,

    /// Return full datapoints in the response (default: false)
    #[serde(default)]
    pub return_full_datapoint: bool,

    /// Query embeddings per request (default: 1)
    #[serde(default = "default_embeddings_per_request")]
    pub embeddings_per_request: usize,

    /// RRF alpha for hybrid queries, in [0, 1]
    #[serde(default)]
    pub rrf_alpha: Option<f32>,
}

/// Load shape configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Concurrent virtual users (default: 1)
    #[serde(default = "default_users")]
    pub users: usize,

    /// Target QPS per user; 0 falls back to think time (default: 10)
    #[serde(default = "default_qps_per_user")]
    pub qps_per_user: f64,

    /// Minimum think time in milliseconds when no QPS target is set (default: 1000)
    #[serde(default = "default_think_min_ms")]
    pub think_time_min_ms: u64,

    /// Maximum think time in milliseconds when no QPS target is set (default: 2000)
    #[serde(default = "default_think_max_ms")]
    pub think_time_max_ms: u64,

    /// Run duration in seconds; unset runs until stopped
    #[serde(default)]
    pub duration_seconds: Option<u64>,

    /// Per-call timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// gRPC connect timeout in seconds (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

/// Where bearer tokens come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    /// No credential; only valid for private gRPC targets.
    #[default]
    None,
    /// A fixed token from `auth.token` or `MATCHLOAD_ACCESS_TOKEN`.
    Static,
    /// The GCE metadata server of the host running the load.
    MetadataServer,
    /// `gcloud auth print-access-token`.
    Gcloud,
}

/// Credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token source (default: none)
    #[serde(default)]
    pub source: AuthSource,

    /// Token for the static source
    #[serde(default)]
    pub token: Option<String>,

    /// Assumed lifetime of static and gcloud tokens in seconds (default: 3600)
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_seconds: u64,

    /// Refresh this many seconds before expiry (default: 120)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: u64,

    /// Metadata server token URL
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_dimensions() -> usize {
    768
}

fn default_sparse_min() -> f32 {
    -1.0
}

fn default_sparse_max() -> f32 {
    1.0
}

fn default_neighbor_count() -> u32 {
    20
}

fn default_embeddings_per_request() -> usize {
    1
}

fn default_users() -> usize {
    1
}

fn default_qps_per_user() -> f64 {
    10.0
}

fn default_think_min_ms() -> u64 {
    1000
}

fn default_think_max_ms() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_token_lifetime() -> u64 {
    3600
}

fn default_refresh_margin() -> u64 {
    120
}

fn default_metadata_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: None,
            dimensions: default_dimensions(),
            dense_values: DenseValueRange::default(),
            sparse_dimensions: 0,
            sparse_active: 0,
            sparse_value_min: default_sparse_min(),
            sparse_value_max: default_sparse_max(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            neighbor_count: default_neighbor_count(),
            fraction_leaf_nodes_to_search_override: 0.0,
            return_full_datapoint: false,
            embeddings_per_request: default_embeddings_per_request(),
            rrf_alpha: None,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            users: default_users(),
            qps_per_user: default_qps_per_user(),
            think_time_min_ms: default_think_min_ms(),
            think_time_max_ms: default_think_max_ms(),
            duration_seconds: None,
            request_timeout_seconds: default_request_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            source: AuthSource::default(),
            token: None,
            token_lifetime_seconds: default_token_lifetime(),
            refresh_margin_seconds: default_refresh_margin(),
            metadata_url: default_metadata_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file doesn't exist or has invalid TOML syntax.
    pub fn from_file(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::TomlError { path, source: e })
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Loads `path` if given, else `matchload.toml` if it exists, else defaults.
    pub fn load(path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if std::path::Path::new("matchload.toml").exists() => {
                Self::from_file("matchload.toml")?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Apply `MATCHLOAD_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Supported keys:
    /// - `MATCHLOAD_ENDPOINT_HOST`, `MATCHLOAD_GRPC_ADDRESS`
    /// - `MATCHLOAD_INDEX_ENDPOINT`, `MATCHLOAD_DEPLOYED_INDEX_ID`
    /// - `MATCHLOAD_INDEX`, `MATCHLOAD_OPERATION`
    /// - `MATCHLOAD_NETWORK` (`public` / `private`), `MATCHLOAD_PROTOCOL`
    /// - `MATCHLOAD_DIMENSIONS`, `MATCHLOAD_SPARSE_DIMENSIONS`, `MATCHLOAD_SPARSE_ACTIVE`
    /// - `MATCHLOAD_NEIGHBOR_COUNT`, `MATCHLOAD_QPS_PER_USER`, `MATCHLOAD_USERS`
    /// - `MATCHLOAD_ACCESS_TOKEN` (selects the static source when none is set)
    /// - `MATCHLOAD_LOG_LEVEL`, `MATCHLOAD_LOG_FORMAT`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(host) = lookup("MATCHLOAD_ENDPOINT_HOST") {
            self.target.endpoint_host = Some(host);
        }

        if let Some(address) = lookup("MATCHLOAD_GRPC_ADDRESS") {
            self.target.grpc_address = Some(address);
        }

        if let Some(endpoint) = lookup("MATCHLOAD_INDEX_ENDPOINT") {
            self.target.index_endpoint = endpoint;
        }

        if let Some(id) = lookup("MATCHLOAD_DEPLOYED_INDEX_ID") {
            self.target.deployed_index_id = id;
        }

        if let Some(index) = lookup("MATCHLOAD_INDEX") {
            self.target.index = Some(index);
        }

        if let Some(operation) = lookup("MATCHLOAD_OPERATION") {
            self.target.operation = operation.parse()?;
        }

        if let Some(network) = lookup("MATCHLOAD_NETWORK") {
            self.target.network = match network.to_ascii_lowercase().as_str() {
                "public" => NetworkMode::Public,
                "private" | "psc" => NetworkMode::Private,
                other => {
                    return Err(ConfigError::invalid(format!(
                        "MATCHLOAD_NETWORK must be public or private (got {other})"
                    )))
                }
            };
        }

        if let Some(protocol) = lookup("MATCHLOAD_PROTOCOL") {
            self.target.protocol = Some(protocol.parse()?);
        }

        if let Some(dims) = parse_var(&lookup, "MATCHLOAD_DIMENSIONS")? {
            self.embedding.dimensions = dims;
        }

        if let Some(dims) = parse_var(&lookup, "MATCHLOAD_SPARSE_DIMENSIONS")? {
            self.embedding.sparse_dimensions = dims;
        }

        if let Some(active) = parse_var(&lookup, "MATCHLOAD_SPARSE_ACTIVE")? {
            self.embedding.sparse_active = active;
        }

        if let Some(count) = parse_var(&lookup, "MATCHLOAD_NEIGHBOR_COUNT")? {
            self.query.neighbor_count = count;
        }

        if let Some(qps) = parse_var(&lookup, "MATCHLOAD_QPS_PER_USER")? {
            self.load.qps_per_user = qps;
        }

        if let Some(users) = parse_var(&lookup, "MATCHLOAD_USERS")? {
            self.load.users = users;
        }

        if let Some(token) = lookup("MATCHLOAD_ACCESS_TOKEN") {
            self.auth.token = Some(token);
            if self.auth.source == AuthSource::None {
                self.auth.source = AuthSource::Static;
            }
        }

        if let Some(level) = lookup("MATCHLOAD_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("MATCHLOAD_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Protocol mode after applying the network default.
    pub fn protocol_mode(&self) -> ProtocolMode {
        self.target.protocol.unwrap_or(match self.target.network {
            NetworkMode::Private => ProtocolMode::Grpc,
            NetworkMode::Public => ProtocolMode::Http,
        })
    }

    /// Embedding kind after applying the sparse default.
    pub fn embedding_kind(&self) -> EmbeddingKind {
        self.embedding.kind.unwrap_or(
            if self.embedding.sparse_dimensions > 0 && self.embedding.sparse_active > 0 {
                EmbeddingKind::Sparse
            } else {
                EmbeddingKind::Dense
            },
        )
    }

    /// Validate the configuration.
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        let protocol = self.protocol_mode();

        match self.target.operation {
            Operation::FindNeighbors => {
                if self.target.index_endpoint.trim().is_empty() {
                    return Err(ConfigError::invalid("target.index_endpoint cannot be empty"));
                }

                if self.target.deployed_index_id.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        "target.deployed_index_id cannot be empty",
                    ));
                }
            }
            Operation::UpsertDatapoints => {
                if is_blank(&self.target.index) {
                    return Err(ConfigError::invalid(
                        "target.index is required for upsert_datapoints",
                    ));
                }

                if protocol != ProtocolMode::Http {
                    return Err(ConfigError::invalid(
                        "upsert_datapoints is only available over http",
                    ));
                }

                if self.embedding.dimensions == 0 {
                    return Err(ConfigError::invalid(
                        "embedding.dimensions must be > 0 for upsert_datapoints",
                    ));
                }
            }
        }

        if protocol.uses_http() && is_blank(&self.target.endpoint_host) {
            return Err(ConfigError::invalid(
                "target.endpoint_host is required for http traffic",
            ));
        }

        if protocol.uses_grpc() && is_blank(&self.target.grpc_address) {
            return Err(ConfigError::invalid(
                "target.grpc_address is required for grpc traffic",
            ));
        }

        if let Some(host) = &self.target.endpoint_host {
            if host.contains("://") {
                return Err(ConfigError::invalid(
                    "target.endpoint_host must not include a scheme",
                ));
            }
        }

        self.validate_embedding()?;

        // Query parameters
        if self.query.neighbor_count == 0 {
            return Err(ConfigError::invalid("query.neighbor_count must be > 0"));
        }

        if self.query.embeddings_per_request == 0 {
            return Err(ConfigError::invalid(
                "query.embeddings_per_request must be > 0",
            ));
        }

        let fraction = self.query.fraction_leaf_nodes_to_search_override;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::invalid(
                "query.fraction_leaf_nodes_to_search_override must be between 0.0 and 1.0",
            ));
        }

        if let Some(alpha) = self.query.rrf_alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(ConfigError::invalid(
                    "query.rrf_alpha must be between 0.0 and 1.0",
                ));
            }
            if self.embedding_kind() != EmbeddingKind::Hybrid {
                return Err(ConfigError::invalid(
                    "query.rrf_alpha only applies to hybrid embeddings",
                ));
            }
        }

        // Load shape
        if self.load.users == 0 {
            return Err(ConfigError::invalid("load.users must be > 0"));
        }

        let qps = self.load.qps_per_user;
        if !qps.is_finite() || qps < 0.0 {
            return Err(ConfigError::invalid("load.qps_per_user must be >= 0"));
        }

        if qps > 0.0 && qps < 1.0 / MAX_INTERVAL.as_secs_f64() {
            return Err(ConfigError::invalid(format!(
                "load.qps_per_user must be 0 or at least one call per {}s",
                MAX_INTERVAL.as_secs()
            )));
        }

        if self.load.think_time_min_ms > self.load.think_time_max_ms {
            return Err(ConfigError::invalid(
                "load.think_time_min_ms must be <= load.think_time_max_ms",
            ));
        }

        if self.load.request_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "load.request_timeout_seconds must be > 0",
            ));
        }

        if self.load.connect_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "load.connect_timeout_seconds must be > 0",
            ));
        }

        // Credentials
        if self.auth.source == AuthSource::Static && is_blank(&self.auth.token) {
            return Err(ConfigError::invalid(
                "auth.token is required for the static credential source",
            ));
        }

        if self.auth.refresh_margin_seconds >= self.auth.token_lifetime_seconds {
            return Err(ConfigError::invalid(
                "auth.refresh_margin_seconds must be smaller than auth.token_lifetime_seconds",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::invalid(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        // Validate log format
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }

    fn validate_embedding(&self) -> ConfigResult<()> {
        let kind = self.embedding_kind();
        let embedding = &self.embedding;

        if kind.has_dense() {
            if embedding.dimensions == 0 {
                return Err(ConfigError::invalid(
                    "embedding.dimensions must be > 0 for dense and hybrid queries",
                ));
            }

            match embedding.dense_values {
                DenseValueRange::Integer { min, max } if min > max => {
                    return Err(ConfigError::invalid(
                        "embedding.dense_values min must be <= max",
                    ));
                }
                DenseValueRange::Float { min, max }
                    if !(min.is_finite() && max.is_finite() && min < max) =>
                {
                    return Err(ConfigError::invalid(
                        "embedding.dense_values must be a finite range with min < max",
                    ));
                }
                _ => {}
            }
        }

        if kind.has_sparse() {
            if embedding.sparse_dimensions == 0 || embedding.sparse_active == 0 {
                return Err(ConfigError::invalid(
                    "embedding.sparse_dimensions and embedding.sparse_active must be > 0 for sparse and hybrid queries",
                ));
            }

            if embedding.sparse_active > embedding.sparse_dimensions {
                return Err(ConfigError::invalid(format!(
                    "embedding.sparse_active ({}) must be <= embedding.sparse_dimensions ({})",
                    embedding.sparse_active, embedding.sparse_dimensions
                )));
            }

            let (min, max) = (embedding.sparse_value_min, embedding.sparse_value_max);
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(ConfigError::invalid(
                    "embedding.sparse_value_min must be < embedding.sparse_value_max",
                ));
            }
        }

        Ok(())
    }

    /// Validate and freeze into the shared run configuration.
    pub fn resolve(&self) -> ConfigResult<RunConfig> {
        self.validate()?;

        let kind = self.embedding_kind();
        let pacing = if self.load.qps_per_user > 0.0 {
            Pacing::ConstantThroughput {
                qps: self.load.qps_per_user,
            }
        } else {
            Pacing::ThinkTime {
                min: Duration::from_millis(self.load.think_time_min_ms),
                max: Duration::from_millis(self.load.think_time_max_ms),
            }
        };

        let fraction = self.query.fraction_leaf_nodes_to_search_override;

        Ok(RunConfig {
            endpoint_host: self.target.endpoint_host.clone(),
            grpc_address: self.target.grpc_address.clone(),
            index_endpoint: self.target.index_endpoint.clone(),
            deployed_index_id: self.target.deployed_index_id.clone(),
            index: self.target.index.clone(),
            operation: self.target.operation,
            network: self.target.network,
            protocol: self.protocol_mode(),
            embedding: EmbeddingSpec {
                kind,
                dimensions: self.embedding.dimensions,
                dense_values: self.embedding.dense_values,
                sparse_dimensions: self.embedding.sparse_dimensions,
                sparse_active: self.embedding.sparse_active,
                sparse_values: (
                    self.embedding.sparse_value_min,
                    self.embedding.sparse_value_max,
                ),
            },
            neighbor_count: self.query.neighbor_count,
            fraction_leaf_nodes_to_search_override: (fraction > 0.0).then_some(fraction),
            return_full_datapoint: self.query.return_full_datapoint,
            embeddings_per_request: self.query.embeddings_per_request,
            rrf_alpha: self.query.rrf_alpha,
            users: self.load.users,
            pacing,
            run_duration: self.load.duration_seconds.map(Duration::from_secs),
            request_timeout: Duration::from_secs(self.load.request_timeout_seconds),
            connect_timeout: Duration::from_secs(self.load.connect_timeout_seconds),
            auth: AuthSettings {
                source: self.auth.source,
                token: self.auth.token.clone(),
                token_lifetime: Duration::from_secs(self.auth.token_lifetime_seconds),
                refresh_margin: Duration::from_secs(self.auth.refresh_margin_seconds),
                metadata_url: self.auth.metadata_url.clone(),
            },
        })
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> ConfigResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(format!("{key} has an invalid value: {raw}"))),
    }
}

/// Resolved payload shape.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSpec {
    pub kind: EmbeddingKind,
    pub dimensions: usize,
    pub dense_values: DenseValueRange,
    pub sparse_dimensions: usize,
    pub sparse_active: usize,
    pub sparse_values: (f32, f32),
}

/// Resolved credential settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub source: AuthSource,
    pub token: Option<String>,
    pub token_lifetime: Duration,
    pub refresh_margin: Duration,
    pub metadata_url: String,
}

/// Validated, immutable configuration shared by all virtual users.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub endpoint_host: Option<String>,
    pub grpc_address: Option<String>,
    pub index_endpoint: String,
    pub deployed_index_id: String,
    pub index: Option<String>,
    pub operation: Operation,
    pub network: NetworkMode,
    pub protocol: ProtocolMode,
    pub embedding: EmbeddingSpec,
    pub neighbor_count: u32,
    pub fraction_leaf_nodes_to_search_override: Option<f64>,
    pub return_full_datapoint: bool,
    pub embeddings_per_request: usize,
    pub rrf_alpha: Option<f32>,
    pub users: usize,
    pub pacing: Pacing,
    pub run_duration: Option<Duration>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub auth: AuthSettings,
}

impl RunConfig {
    /// gRPC requires TLS and a bearer token unless the target is private.
    pub fn grpc_secure(&self) -> bool {
        self.network == NetworkMode::Public
    }

    /// Base URL for HTTP traffic, e.g. `https://host`.
    pub fn http_base_url(&self) -> Option<String> {
        self.endpoint_host
            .as_deref()
            .map(|host| format!("https://{}", host.trim_end_matches('/')))
    }
}
