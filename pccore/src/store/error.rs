use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("relay is offline")]
    Offline,

    #[error("relay rejected credential: {0}")]
    Unauthorized(String),

    #[error("not authenticated with relay")]
    NotAuthenticated,

    #[error("serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("relay backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
