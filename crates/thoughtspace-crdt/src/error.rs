//! Error types for the document primitives.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CrdtError {
    #[error("Failed to encode update: {0}")]
    Encode(String),

    #[error("Failed to decode update: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for CrdtError {
    fn from(err: serde_json::Error) -> Self {
        CrdtError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CrdtError>;
