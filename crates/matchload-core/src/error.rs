use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors. Always fatal: no traffic is generated.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse TOML in {path:?}: {source}")]
    TomlError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

/// Credential acquisition errors.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No token source is configured for a path that needs a bearer token.
    #[error("no credential source configured")]
    NoCredentialSource,

    /// The token source failed to produce a token.
    #[error("credential refresh failed: {message}")]
    Refresh {
        /// Human-readable failure details.
        message: String,
    },

    /// The token source answered with something that is not a token.
    #[error("invalid credential response: {message}")]
    InvalidResponse {
        /// Human-readable failure details.
        message: String,
    },

    /// The service rejected the bearer token we sent.
    #[error("credential rejected: {message}")]
    Rejected { message: String },
}

impl AuthError {
    /// Creates a `Refresh` variant.
    #[must_use]
    pub fn refresh(message: impl Into<String>) -> Self {
        Self::Refresh {
            message: message.into(),
        }
    }

    /// Creates an `InvalidResponse` variant.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Creates a `Rejected` variant.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Coarse failure classification carried in logs and metric events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Transport,
    Protocol,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
        }
    }
}

/// Outcome of a single failed query call. Never fatal to a virtual user.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Missing or rejected credentials.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Connection refused, DNS failure or timeout.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// Set when the per-call deadline elapsed.
        timed_out: bool,
    },

    /// Non-success status or a response that could not be decoded.
    #[error("protocol error: {message}")]
    Protocol {
        /// HTTP status code, or the numeric gRPC status code.
        status: Option<u16>,
        message: String,
    },
}

impl CallError {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timed_out: false,
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timed_out: true,
        }
    }

    #[must_use]
    pub fn protocol(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Auth(_) => FailureKind::Auth,
            Self::Transport { .. } => FailureKind::Transport,
            Self::Protocol { .. } => FailureKind::Protocol,
        }
    }
}

impl From<tonic::Status> for CallError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        let message = format!("{:?}: {}", status.code(), status.message());
        match status.code() {
            Code::Unavailable | Code::Cancelled => Self::transport(message),
            Code::DeadlineExceeded => Self::timeout(message),
            Code::Unauthenticated => Self::Auth(AuthError::rejected(message)),
            code => Self::protocol(Some(code as u16), message),
        }
    }
}

/// Errors raised while bringing up a context or a virtual user.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A gRPC channel could not be built for the configured address.
    #[error("failed to create channel to {address}: {message}")]
    Channel { address: String, message: String },

    /// The shared HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type AuthResult<T> = Result<T, AuthError>;
pub type CallResult<T> = Result<T, CallError>;
pub type LoadResult<T> = Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = CallError::from(tonic::Status::unavailable("connection refused"));
        assert_eq!(err.kind(), FailureKind::Transport);

        let err = CallError::from(tonic::Status::deadline_exceeded("slow"));
        assert!(matches!(err, CallError::Transport { timed_out: true, .. }));

        let err = CallError::from(tonic::Status::unauthenticated("expired"));
        assert!(matches!(err, CallError::Auth(AuthError::Rejected { .. })));
        assert_eq!(err.kind(), FailureKind::Auth);

        let err = CallError::from(tonic::Status::invalid_argument("bad dims"));
        assert!(matches!(
            err,
            CallError::Protocol {
                status: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn test_auth_error_display() {
        assert_eq!(
            AuthError::NoCredentialSource.to_string(),
            "no credential source configured"
        );
        let err = CallError::from(AuthError::refresh("metadata server down"));
        assert_eq!(
            err.to_string(),
            "credential refresh failed: metadata server down"
        );
    }
}
