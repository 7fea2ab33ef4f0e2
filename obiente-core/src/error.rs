use std::fmt;

/// Error taxonomy for the orchestrator engine.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// Placement filter produced no eligible node.
    NoEligibleNode(String),
    /// Container engine or hypervisor unreachable.
    BackendUnavailable(String),
    /// Engine reported the entity name as already taken.
    NameInUse(String),
    /// Clustered update failed and was rolled back; carries captured task logs.
    RolledBack(String),
    /// Destructive path hit an entity without the managed label. Never recovered.
    UnmanagedEntity(String),
    /// One container's stats read failed; retried next cycle.
    TransientStats(String),
    /// Batch insert into the time-series store failed.
    PersistenceFailure(String),
    /// Circuit breaker rejected the call without invoking the backend.
    CircuitOpen,
    /// Operation deliberately left unimplemented.
    NotImplemented(String),
    /// Call was cancelled or exceeded its deadline.
    Cancelled(String),
    /// Relational store errors.
    Database(String),
    /// Configuration errors.
    Config(String),
    /// Hypervisor controller errors.
    Hypervisor(String),
    /// General internal errors.
    Internal(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::NoEligibleNode(msg) => write!(f, "no eligible node: {}", msg),
            OrchestratorError::BackendUnavailable(msg) => write!(f, "backend unavailable: {}", msg),
            OrchestratorError::NameInUse(msg) => write!(f, "name in use: {}", msg),
            OrchestratorError::RolledBack(msg) => write!(f, "update rolled back: {}", msg),
            OrchestratorError::UnmanagedEntity(msg) => write!(f, "unmanaged entity: {}", msg),
            OrchestratorError::TransientStats(msg) => write!(f, "transient stats failure: {}", msg),
            OrchestratorError::PersistenceFailure(msg) => write!(f, "persistence failure: {}", msg),
            OrchestratorError::CircuitOpen => write!(f, "circuit breaker open"),
            OrchestratorError::NotImplemented(msg) => write!(f, "not implemented: {}", msg),
            OrchestratorError::Cancelled(msg) => write!(f, "cancelled: {}", msg),
            OrchestratorError::Database(msg) => write!(f, "database error: {}", msg),
            OrchestratorError::Config(msg) => write!(f, "configuration error: {}", msg),
            OrchestratorError::Hypervisor(msg) => write!(f, "hypervisor error: {}", msg),
            OrchestratorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl OrchestratorError {
    /// Errors that must not advance the circuit breaker's failure count.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, OrchestratorError::Cancelled(_))
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Database(err.to_string())
    }
}

impl From<bollard::errors::Error> for OrchestratorError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ref message,
            } => OrchestratorError::NameInUse(message.clone()),
            other => OrchestratorError::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OrchestratorError::Cancelled(err.to_string())
        } else {
            OrchestratorError::Hypervisor(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        OrchestratorError::Internal(format!("YAML error: {}", err))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Internal(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for OrchestratorError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        OrchestratorError::Cancelled(err.to_string())
    }
}

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
