//! Signing workflow around the stamper.
//!
//! Tracks who may sign a document, serializes stamping per document so no
//! signature is lost between concurrent signers, advances the document's
//! status and reports every change to an audit sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SigningConfig;
use crate::error::{SignError, SignResult};
use crate::pdf::{PdfPoint, Viewport, VisualPoint};
use crate::stamper::{SignaturePayload, SignatureStamper, StampRequest};
use crate::storage::UploadsRoot;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerKind {
    AccountHolder,
    Recipient,
}

/// Whoever is putting their signature on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signer {
    AccountHolder {
        user_id: String,
        name: String,
        email: String,
    },
    Recipient {
        name: String,
        email: String,
        token: String,
    },
}

impl Signer {
    pub fn name(&self) -> &str {
        match self {
            Signer::AccountHolder { name, .. } | Signer::Recipient { name, .. } => name,
        }
    }

    pub fn email(&self) -> &str {
        match self {
            Signer::AccountHolder { email, .. } | Signer::Recipient { email, .. } => email,
        }
    }

    /// Recipients sign without an account.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Signer::AccountHolder { user_id, .. } => Some(user_id),
            Signer::Recipient { .. } => None,
        }
    }

    pub fn kind(&self) -> SignerKind {
        match self {
            Signer::AccountHolder { .. } => SignerKind::AccountHolder,
            Signer::Recipient { .. } => SignerKind::Recipient,
        }
    }
}

impl From<&Account> for Signer {
    fn from(account: &Account) -> Self {
        Signer::AccountHolder {
            user_id: account.user_id.clone(),
            name: account.name.clone(),
            email: account.email.clone(),
        }
    }
}

/// How a caller proves who they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerCredential {
    /// An authenticated session for this user id.
    Account(String),
    /// A recipient's signing token.
    Token(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    Pending,
    Signed,
    Rejected,
}

impl SigningStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, SigningStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Signer,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub name: String,
    pub email: String,
    pub role: RecipientRole,
    pub status: SigningStatus,
    pub token: String,
    pub token_expires_at: DateTime<Utc>,
    pub signed_at: Option<DateTime<Utc>>,
}

/// Someone the owner wants to sign or view a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    pub name: String,
    pub email: String,
    pub role: RecipientRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub original_name: String,
    /// Stored path of the current artifact. Advances with every signature.
    pub file_path: String,
    pub owner: Account,
    pub status: SigningStatus,
    pub signed_file_path: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub recipients: Vec<RecipientRecord>,
    /// Bumped by the store on every successful replace.
    pub version: u64,
}

impl DocumentRecord {
    pub fn new(owner: Account, original_name: &str, file_path: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original_name: original_name.to_string(),
            file_path: file_path.to_string(),
            owner,
            status: SigningStatus::Pending,
            signed_file_path: None,
            signed_at: None,
            rejection_reason: None,
            recipients: Vec::new(),
            version: 0,
        }
    }

    fn recipient_by_token(&self, token: &str) -> SignResult<usize> {
        self.recipients
            .iter()
            .position(|r| r.token == token)
            .ok_or(SignError::InvalidToken)
    }

    /// True once every recipient asked to sign has signed.
    fn all_signers_done(&self) -> bool {
        self.recipients
            .iter()
            .filter(|r| r.role == RecipientRole::Signer)
            .all(|r| r.status == SigningStatus::Signed)
    }
}

/// Persistence for document records.
pub trait DocumentStore: Send + Sync {
    fn load(&self, id: &str) -> SignResult<DocumentRecord>;

    fn insert(&self, record: DocumentRecord) -> SignResult<()>;

    /// Replace the stored record if its version still equals
    /// `expected_version`, and return the stored copy with the bumped version.
    /// Fails with [`SignError::ConcurrentModification`] otherwise.
    fn replace(&self, record: DocumentRecord, expected_version: u64) -> SignResult<DocumentRecord>;
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<HashMap<String, DocumentRecord>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> SignResult<std::sync::MutexGuard<'_, HashMap<String, DocumentRecord>>> {
        self.documents
            .lock()
            .map_err(|_| SignError::Storage("document store lock poisoned".to_string()))
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn load(&self, id: &str) -> SignResult<DocumentRecord> {
        self.documents()?
            .get(id)
            .cloned()
            .ok_or_else(|| SignError::DocumentNotFound(id.to_string()))
    }

    fn insert(&self, record: DocumentRecord) -> SignResult<()> {
        self.documents()?.insert(record.id.clone(), record);
        Ok(())
    }

    fn replace(&self, mut record: DocumentRecord, expected_version: u64) -> SignResult<DocumentRecord> {
        let mut docs = self.documents()?;
        let stored = docs
            .get_mut(&record.id)
            .ok_or_else(|| SignError::DocumentNotFound(record.id.clone()))?;
        if stored.version != expected_version {
            return Err(SignError::ConcurrentModification(record.id));
        }
        record.version = expected_version + 1;
        *stored = record.clone();
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Invited,
    Signed,
    Rejected,
}

/// Audit record of a workflow change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEvent {
    pub document_id: String,
    pub action: AuditAction,
    pub signer_name: String,
    pub signer_email: String,
    pub signer_kind: SignerKind,
    pub account_id: Option<String>,
    pub page_index: Option<usize>,
    pub visual_point: Option<VisualPoint>,
    pub viewport: Option<Viewport>,
    pub pdf_center: Option<PdfPoint>,
    pub file_path: Option<String>,
    pub at: DateTime<Utc>,
}

impl SignatureEvent {
    fn new(document_id: &str, action: AuditAction, signer: &Signer) -> Self {
        Self {
            document_id: document_id.to_string(),
            action,
            signer_name: signer.name().to_string(),
            signer_email: signer.email().to_string(),
            signer_kind: signer.kind(),
            account_id: signer.account_id().map(str::to_string),
            page_index: None,
            visual_point: None,
            viewport: None,
            pdf_center: None,
            file_path: None,
            at: Utc::now(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &SignatureEvent);
}

/// Writes audit events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &SignatureEvent) {
        info!(
            target: "signet::audit",
            document = %event.document_id,
            action = ?event.action,
            signer = %event.signer_name,
            email = %event.signer_email,
            kind = ?event.signer_kind,
            account = ?event.account_id,
            page = ?event.page_index,
            file = ?event.file_path,
            "signature event"
        );
    }
}

/// Keeps audit events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<SignatureEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SignatureEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &SignatureEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// One async mutex per document id.
#[derive(Debug, Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `document_id`. Access ends when the
    /// guard is dropped.
    pub async fn acquire(&self, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Nobody outside the map holds these.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(document_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of documents with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A signing attempt as it arrives from the service layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignRequest {
    pub document_id: String,
    pub credential: SignerCredential,
    pub page_index: usize,
    pub viewport: Viewport,
    pub center: VisualPoint,
    pub signature_text: Option<String>,
    /// `data:image/<png|jpeg>;base64,...`
    pub signature_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub document: DocumentRecord,
    pub new_file_path: String,
    pub pdf_bytes: Vec<u8>,
    pub event: SignatureEvent,
}

pub struct SigningService<S = InMemoryDocumentStore, A = TracingAuditSink> {
    stamper: Arc<SignatureStamper>,
    store: Arc<S>,
    audit: Arc<A>,
    locks: DocumentLocks,
    token_ttl: TimeDelta,
}

impl SigningService<InMemoryDocumentStore, TracingAuditSink> {
    /// In-memory records with audit events going to the log.
    pub fn from_config(config: &SigningConfig) -> SignResult<Self> {
        Self::new(
            config,
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(TracingAuditSink),
        )
    }
}

impl<S: DocumentStore, A: AuditSink> SigningService<S, A> {
    pub fn new(config: &SigningConfig, store: Arc<S>, audit: Arc<A>) -> SignResult<Self> {
        let uploads = UploadsRoot::open(&config.uploads_root)?;
        let token_ttl = TimeDelta::try_days(config.recipient_token_ttl_days).ok_or_else(|| {
            SignError::Storage(format!(
                "token lifetime of {} days is out of range",
                config.recipient_token_ttl_days
            ))
        })?;

        Ok(Self {
            stamper: Arc::new(SignatureStamper::new(config.stamp.clone(), uploads)),
            store,
            audit,
            locks: DocumentLocks::new(),
            token_ttl,
        })
    }

    pub fn uploads(&self) -> &UploadsRoot {
        self.stamper.uploads()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn document(&self, document_id: &str) -> SignResult<DocumentRecord> {
        self.store.load(document_id)
    }

    /// Start tracking an uploaded file. `file_path` must resolve inside the
    /// uploads root.
    pub fn register(&self, owner: Account, original_name: &str, file_path: &str) -> SignResult<DocumentRecord> {
        self.uploads().resolve(file_path)?;
        let record = DocumentRecord::new(owner, original_name, file_path);
        self.store.insert(record.clone())?;
        info!(document = %record.id, file = file_path, "registered document");
        Ok(record)
    }

    /// Issue signing tokens. Only the owner may invite, and only while the
    /// document is pending.
    pub async fn invite(
        &self,
        document_id: &str,
        owner_id: &str,
        invitees: Vec<Invitee>,
    ) -> SignResult<Vec<RecipientRecord>> {
        let _guard = self.locks.acquire(document_id).await;
        let record = self.store.load(document_id)?;
        if record.owner.user_id != owner_id {
            return Err(SignError::NotAuthorized);
        }
        if record.status.is_final() {
            return Err(SignError::AlreadyFinalized(record.id));
        }

        let now = Utc::now();
        let expires = now
            .checked_add_signed(self.token_ttl)
            .ok_or_else(|| SignError::Storage("token expiry out of range".to_string()))?;
        let issued: Vec<RecipientRecord> = invitees
            .into_iter()
            .map(|invitee| RecipientRecord {
                name: invitee.name,
                email: invitee.email,
                role: invitee.role,
                status: SigningStatus::Pending,
                token: Uuid::new_v4().to_string(),
                token_expires_at: expires,
                signed_at: None,
            })
            .collect();

        let mut updated = record.clone();
        updated.recipients.extend(issued.iter().cloned());
        self.store.replace(updated, record.version)?;

        for recipient in &issued {
            let signer = Signer::Recipient {
                name: recipient.name.clone(),
                email: recipient.email.clone(),
                token: recipient.token.clone(),
            };
            self.audit
                .record(&SignatureEvent::new(document_id, AuditAction::Invited, &signer));
        }
        debug!(document = document_id, count = issued.len(), "issued signing tokens");
        Ok(issued)
    }

    /// Stamp a signature onto the document's current file and advance its
    /// status. Runs exclusively per document.
    pub async fn sign(&self, request: SignRequest) -> SignResult<SignOutcome> {
        let document_id = request.document_id.clone();
        let _guard = self.locks.acquire(&document_id).await;

        let record = self.store.load(&document_id)?;
        let (signer, recipient) = self.resolve_signer(&record, &request.credential)?;
        if record.status.is_final() {
            return Err(SignError::AlreadyFinalized(record.id));
        }

        let payload = SignaturePayload::from_fields(
            request.signature_text.as_deref(),
            request.signature_image.as_deref(),
            self.stamper.config(),
        )?;
        let stamp_request = StampRequest {
            page_index: request.page_index,
            viewport: request.viewport,
            center: request.center,
            payload,
        };

        let source = record.file_path.clone();
        self.uploads().resolve(&source)?;
        let stamper = Arc::clone(&self.stamper);
        let stamped = tokio::task::spawn_blocking(move || stamper.stamp_stored(&source, &stamp_request))
            .await
            .map_err(|e| SignError::Storage(format!("stamping task failed: {e}")))??;

        let now = Utc::now();
        let mut updated = record.clone();
        updated.file_path = stamped.new_file_path.clone();
        let finished = match recipient {
            Some(index) => {
                updated.recipients[index].status = SigningStatus::Signed;
                updated.recipients[index].signed_at = Some(now);
                updated.all_signers_done()
            }
            None => true,
        };
        if finished {
            updated.status = SigningStatus::Signed;
            updated.signed_file_path = Some(stamped.new_file_path.clone());
            updated.signed_at = Some(now);
        }
        let document = self.store.replace(updated, record.version)?;

        let mut event = SignatureEvent::new(&document_id, AuditAction::Signed, &signer);
        event.page_index = Some(request.page_index);
        event.visual_point = Some(request.center);
        event.viewport = Some(request.viewport);
        event.pdf_center = Some(stamped.applied.placement.center);
        event.file_path = Some(stamped.new_file_path.clone());
        self.audit.record(&event);

        info!(
            document = %document_id,
            signer = signer.name(),
            status = ?document.status,
            "document signed"
        );

        Ok(SignOutcome {
            document,
            new_file_path: stamped.new_file_path,
            pdf_bytes: stamped.pdf_bytes,
            event,
        })
    }

    /// A recipient declines to sign. The whole document becomes rejected.
    pub async fn reject(
        &self,
        document_id: &str,
        token: &str,
        reason: Option<String>,
    ) -> SignResult<DocumentRecord> {
        let _guard = self.locks.acquire(document_id).await;
        let record = self.store.load(document_id)?;
        let (signer, recipient) =
            self.resolve_signer(&record, &SignerCredential::Token(token.to_string()))?;
        if record.status.is_final() {
            return Err(SignError::AlreadyFinalized(record.id));
        }
        let Some(index) = recipient else {
            return Err(SignError::NotAuthorized);
        };

        let mut updated = record.clone();
        updated.recipients[index].status = SigningStatus::Rejected;
        updated.status = SigningStatus::Rejected;
        updated.rejection_reason = reason;
        let document = self.store.replace(updated, record.version)?;

        self.audit
            .record(&SignatureEvent::new(document_id, AuditAction::Rejected, &signer));
        warn!(document = document_id, signer = signer.name(), "document rejected");
        Ok(document)
    }

    /// Work out who is acting and, for recipients, which entry they are.
    fn resolve_signer(
        &self,
        record: &DocumentRecord,
        credential: &SignerCredential,
    ) -> SignResult<(Signer, Option<usize>)> {
        match credential {
            SignerCredential::Account(user_id) => {
                if *user_id != record.owner.user_id {
                    return Err(SignError::NotAuthorized);
                }
                Ok((Signer::from(&record.owner), None))
            }
            SignerCredential::Token(token) => {
                let index = record.recipient_by_token(token)?;
                let recipient = &record.recipients[index];
                if recipient.token_expires_at < Utc::now() {
                    return Err(SignError::TokenExpired);
                }
                if recipient.role != RecipientRole::Signer {
                    return Err(SignError::NotAuthorized);
                }
                match recipient.status {
                    SigningStatus::Pending => {}
                    SigningStatus::Signed => {
                        return Err(SignError::AlreadySigned(recipient.email.clone()))
                    }
                    SigningStatus::Rejected => {
                        return Err(SignError::AlreadyFinalized(record.id.clone()))
                    }
                }
                let signer = Signer::Recipient {
                    name: recipient.name.clone(),
                    email: recipient.email.clone(),
                    token: token.clone(),
                };
                Ok((signer, Some(index)))
            }
        }
    }
}
