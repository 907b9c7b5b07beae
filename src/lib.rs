// Signet - PDF Signature Stamping Engine
//
// This crate places a visual signature (typed text or a drawn image) on a
// page of an existing PDF so that it appears exactly where the signer put it
// on screen, whatever the page's rotation, and writes the result as a new
// immutable file.

pub mod config;
pub mod error;
pub mod pdf;
pub mod service;
pub mod stamper;
pub mod storage;

use std::path::Path;

pub use config::{ConfigError, SigningConfig, StampConfig};
pub use error::{SignError, SignResult};
pub use service::{
    Account, AuditAction, AuditSink, DocumentLocks, DocumentRecord, DocumentStore,
    InMemoryDocumentStore, Invitee, MemoryAuditSink, RecipientRecord, RecipientRole, SignOutcome,
    SignRequest, SignatureEvent, Signer, SignerCredential, SignerKind, SigningService,
    SigningStatus, TracingAuditSink,
};
pub use stamper::{
    AppliedStamp, RenderedStamp, SignaturePayload, SignatureStamper, StampRequest, StampResult,
    TextSignature,
};
pub use storage::UploadsRoot;

/// Check if a path string names a PDF (extension check only).
fn looks_like_pdf(path: &str) -> bool {
    path.to_lowercase().ends_with(".pdf")
}

/// Turn a document argument into a plain path string.
///
/// Accepts plain paths, `file://` URLs and percent-encoded paths (spaces as
/// `%20`). An argument is returned unchanged when no decoding applies.
pub fn document_path_from_arg(arg: &str) -> String {
    // Handle file:// URLs
    if arg.starts_with("file://") {
        if let Some(path) = url::Url::parse(arg)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .and_then(|p| p.to_str().map(|s| s.to_string()))
        {
            return path;
        }
    }

    // Handle URL-encoded paths, but only when the decoded form exists or is
    // still a PDF name; a literal '%' in a real file name must survive.
    if let Ok(decoded) = urlencoding::decode(arg) {
        let decoded = decoded.to_string();
        if decoded != arg && !Path::new(arg).exists() && looks_like_pdf(&decoded) {
            return decoded;
        }
    }

    arg.to_string()
}
