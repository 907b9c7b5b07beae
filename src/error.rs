//! Errors reported by the stamping core and the signing workflow.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while signing a document.
///
/// Every variant is a caller input error or an environment error. None of them
/// are retried internally.
#[derive(Error, Debug)]
pub enum SignError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Invalid page number {index}. Document has {count} pages.")]
    InvalidPage { index: usize, count: usize },

    #[error("Invalid viewer dimensions {width}x{height}: width and height must be positive numbers")]
    InvalidViewport { width: f64, height: f64 },

    #[error("Invalid signature position ({x}, {y}): coordinates must be finite numbers")]
    InvalidPosition { x: f64, y: f64 },

    #[error("Please provide either signature text or a signature image")]
    MissingPayload,

    #[error("Signature image too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Invalid signature image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("Invalid signature data: {0}")]
    InvalidSignatureData(String),

    #[error("Invalid file path: {0} resolves outside the uploads directory")]
    PathTraversal(String),

    #[error("Document {0} is already finalized")]
    AlreadyFinalized(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Invalid or expired signing token")]
    InvalidToken,

    #[error("Signing token expired")]
    TokenExpired,

    #[error("{0} has already signed this document")]
    AlreadySigned(String),

    #[error("Not authorized to sign this document")]
    NotAuthorized,

    #[error("Document {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to save PDF: {0}")]
    SaveFailed(String),
}

impl Serialize for SignError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<std::io::Error> for SignError {
    fn from(err: std::io::Error) -> Self {
        SignError::Storage(err.to_string())
    }
}

pub type SignResult<T> = Result<T, SignError>;
