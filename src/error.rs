//! Error taxonomy for deployments, builds and proxy reconfiguration

use thiserror::Error;

/// Errors surfaced by the orchestration engine
#[derive(Debug, Error)]
pub enum DeployError {
    /// Descriptor or configuration is missing a required field
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The build engine reported an error event or the build could not run
    #[error("build failed: {0}")]
    Build(String),

    /// The proxy Data Plane API did not answer the liveness probe
    #[error("proxy is not reachable: {0}")]
    ProxyUnreachable(String),

    /// Commit rejected because the transaction was based on a stale version
    #[error("transaction {transaction_id} conflicts with a newer configuration version: {message}")]
    TransactionConflict {
        transaction_id: String,
        message: String,
    },

    /// `docker compose up` or `docker volume create` exited non-zero
    #[error("compose apply failed: {0}")]
    ComposeApply(String),

    /// A container runtime command (proxy start, network connect) failed
    #[error("container runtime command failed: {0}")]
    Runtime(String),

    /// The proxy API answered with a non-success status
    #[error("proxy API {method} {path} returned {status}: {body}")]
    ProxyApi {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// Transport error talking to the proxy API
    #[error("proxy API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Error returned by the container engine API
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DeployError {
    /// Short machine-readable code, used as a structured logging field
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::Configuration(_) => "CONFIGURATION_ERROR",
            DeployError::Build(_) => "BUILD_FAILURE",
            DeployError::ProxyUnreachable(_) => "PROXY_UNREACHABLE",
            DeployError::TransactionConflict { .. } => "TRANSACTION_CONFLICT",
            DeployError::ComposeApply(_) => "COMPOSE_APPLY_FAILURE",
            DeployError::Runtime(_) => "RUNTIME_ERROR",
            DeployError::ProxyApi { .. } => "PROXY_API_ERROR",
            DeployError::Http(_) => "PROXY_HTTP_ERROR",
            DeployError::Engine(_) => "ENGINE_ERROR",
            DeployError::Io(_) => "IO_ERROR",
            DeployError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the proxy API answered 404 for the requested resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeployError::ProxyApi { status: 404, .. })
    }
}

impl From<serde_json::Error> for DeployError {
    fn from(e: serde_json::Error) -> Self {
        DeployError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for DeployError {
    fn from(e: serde_yaml::Error) -> Self {
        DeployError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
