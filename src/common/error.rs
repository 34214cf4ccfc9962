//! Error types for stateplane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },

    // === Metadata Errors ===
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Service Errors ===
    #[error("Service exists: {0}")]
    ServiceExists(String),

    #[error("Service is being deleted: {0}")]
    ServiceDeleting(String),

    #[error("Config file mismatch: {file_id}")]
    ConfigMismatch { file_id: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // === Ownership Errors ===
    #[error("No idle member for service {0}")]
    NoIdleMember(String),

    #[error("Volume {volume_id} in incorrect state: {state}")]
    IncorrectVolumeState { volume_id: String, state: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config load error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConditionFailed(_)
                | Error::IncorrectVolumeState { .. }
                | Error::NoIdleMember(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Error::ConditionFailed(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ConditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::AlreadyExists(_) | Error::ServiceExists(_) => StatusCode::CONFLICT,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::NoIdleMember(_) | Error::ResourceExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}
