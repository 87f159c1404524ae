use serde::{Deserialize, Serialize};

/// Identifier of a deposited account in the directory.
pub type AccountId = i64;
/// Identifier of the operator that owns a deposited account.
pub type OwnerId = i64;
/// Identifier of an operator-facing chat used for notifications.
pub type ChatId = i64;
/// Identifier of a conversation on the monitored account.
pub type ConversationId = i64;
/// Provider-side message identifier, unique within a conversation.
pub type ExternalMessageId = i64;
/// Provider-side handle of one active authorization.
pub type AuthorizationHandle = i64;
/// Opaque session credential, sufficient to resume a transport
/// connection. Encrypted at the storage boundary, not here.
pub type SessionCredential = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// A depositable messaging account as stored by the directory.
///
/// `(owner_id, alias)` and `(owner_id, phone)` are each unique; the
/// directory backend enforces both and surfaces violations as
/// `DepotError::Conflict`.
pub struct Account {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub alias: String,
    pub phone: String,
    pub credential: SessionCredential,
    pub two_factor_secret: Option<String>,
    /// Whether the pool should hold a live connection for this account.
    pub monitoring: bool,
    /// Whether custody has been withdrawn from the pool.
    pub is_taken: bool,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Input shape for creating a directory record; the backend assigns the
/// id and both timestamps.
pub struct NewAccount {
    pub owner_id: OwnerId,
    pub alias: String,
    pub phone: String,
    pub credential: SessionCredential,
    pub two_factor_secret: Option<String>,
    pub monitoring: bool,
    pub is_taken: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Partial update applied through the directory. `None` leaves a field
/// untouched; the nested option on `two_factor_secret` distinguishes
/// "clear" from "keep".
pub struct AccountUpdate {
    pub credential: Option<SessionCredential>,
    pub two_factor_secret: Option<Option<String>>,
    pub monitoring: Option<bool>,
    pub is_taken: Option<bool>,
}

impl AccountUpdate {
    pub fn is_empty(&self) -> bool {
        self.credential.is_none()
            && self.two_factor_secret.is_none()
            && self.monitoring.is_none()
            && self.is_taken.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Media classification for archived traffic.
pub enum MediaKind {
    Photo,
    Voice,
    Video,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "photo" => Some(Self::Photo),
            "voice" => Some(Self::Voice),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    /// Text stored in place of the media payload.
    pub fn placeholder(self) -> &'static str {
        match self {
            Self::Photo => "[photo]",
            Self::Voice => "[voice]",
            Self::Video => "[video]",
            Self::Document => "[document]",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One archived message row. Unique per
/// `(account_id, conversation_id, external_id)`; the store upserts on
/// redelivery so the invariant holds without caller cooperation.
pub struct ArchivedMessage {
    pub account_id: AccountId,
    pub conversation_id: ConversationId,
    pub external_id: ExternalMessageId,
    pub sender_id: Option<i64>,
    pub text: String,
    /// Reference into the media archive (the forwarded copy's message
    /// id), present only for media messages.
    pub media_ref: Option<ExternalMessageId>,
    pub media_kind: Option<MediaKind>,
    pub sent_unix_ms: u64,
    pub deleted_unix_ms: Option<u64>,
}
