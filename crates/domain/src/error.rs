use thiserror::Error;

/// Failures raised by a datastore backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Datastore backend error: {0}")]
    Backend(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),

    #[error("Conditional write lost for key: {key}")]
    Conflict { key: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Error kinds surfaced by both evaluators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Unauthorized: {0}")]
    Authentication(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Datastore(#[from] StoreError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
