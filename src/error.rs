//! Error types shared by the local store, the sync engine and checkout.

use thiserror::Error;

/// Failure talking to the remote backend.
///
/// Every variant is treated as transient by the write paths: the operation is
/// kept locally and retried by the reconciler.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote backend unreachable")]
    Offline,

    #[error("Remote backend error (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Network error communicating with remote backend: {0}")]
    Transport(String),

    #[error("Invalid response from remote backend: {0}")]
    Decode(String),

    #[error("Remote record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            return RemoteError::Offline;
        }
        if err.is_decode() {
            return RemoteError::Decode(err.to_string());
        }
        RemoteError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PosError {
    #[error("Local store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Table {0} was occupied by another order")]
    TableOccupied(String),

    #[error("Image processing failed: {0}")]
    Image(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Local store lock poisoned")]
    Lock,
}

impl From<image::ImageError> for PosError {
    fn from(err: image::ImageError) -> Self {
        PosError::Image(err.to_string())
    }
}

pub type Result<T, E = PosError> = std::result::Result<T, E>;
