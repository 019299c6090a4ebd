use thiserror::Error;

use crate::kv::KvError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("Target for job {job} is held by another machine")]
    TargetContention { job: String },

    #[error("Malformed record at {key}: {source}")]
    BadRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Signature tag mismatch: expected {expected}, got {actual}")]
    SignatureMismatch { expected: String, actual: String },

    #[error("Lease on {0} lost")]
    LeaseLost(String),

    #[error("Serialization error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
