use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::account_types::{
    AuthorizationHandle, ConversationId, ExternalMessageId, MediaKind, SessionCredential,
};
use crate::error::DepotError;

/// Buffer depth for per-subscription event channels. A slow archiver
/// backpressures the transport rather than growing without bound.
pub const TRANSPORT_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Event classes a caller can subscribe to on one connection.
pub enum TransportEventKind {
    Messages,
    Deletions,
    ServiceNotifications,
}

impl TransportEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Deletions => "deletions",
            Self::ServiceNotifications => "service_notifications",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One inbound message observed on a live connection.
pub struct InboundMessage {
    pub conversation_id: ConversationId,
    pub external_id: ExternalMessageId,
    pub sender_id: Option<i64>,
    pub text: String,
    pub media_kind: Option<MediaKind>,
    pub sent_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Tagged event variants delivered on a subscription channel.
pub enum TransportEvent {
    Message(InboundMessage),
    MessagesDeleted { external_ids: Vec<ExternalMessageId> },
    ServiceNotification { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One active authorization on the account, as reported by the
/// provider. `is_current` marks the authorization backing the
/// connection that issued the listing.
pub struct Authorization {
    pub handle: AuthorizationHandle,
    pub is_current: bool,
    pub device_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Provider-issued challenge handle for a pending verification code.
pub struct CodeChallenge {
    pub challenge_id: String,
}

#[async_trait]
/// One live protocol connection bound to a single account. All calls
/// on one connection are serialized by ownership; the core never
/// shares a connection across tasks.
pub trait TransportConnection: Send {
    async fn is_connected(&self) -> bool;

    /// Whether the provider considers this connection signed in.
    async fn is_authorized(&self) -> Result<bool, DepotError>;

    /// Requests a verification code for `phone` on an unauthenticated
    /// connection.
    async fn send_code(&mut self, phone: &str) -> Result<CodeChallenge, DepotError>;

    /// Completes code sign-in. Fails with `TwoFactorRequired` when the
    /// account carries a second factor, `CodeExpired` when the code or
    /// challenge is no longer valid.
    async fn sign_in_with_code(
        &mut self,
        phone: &str,
        code: &str,
        challenge: &CodeChallenge,
    ) -> Result<(), DepotError>;

    /// Completes second-factor sign-in after `TwoFactorRequired`.
    async fn sign_in_with_password(&mut self, secret: &str) -> Result<(), DepotError>;

    /// Subscribes to one event class; events arrive on the returned
    /// channel until the connection is disconnected.
    async fn subscribe(
        &mut self,
        kind: TransportEventKind,
    ) -> Result<mpsc::Receiver<TransportEvent>, DepotError>;

    /// Forwards an existing message into `target_conversation`,
    /// returning the forwarded copy's id.
    async fn forward_message(
        &mut self,
        conversation_id: ConversationId,
        external_id: ExternalMessageId,
        target_conversation: ConversationId,
    ) -> Result<ExternalMessageId, DepotError>;

    async fn list_authorizations(&mut self) -> Result<Vec<Authorization>, DepotError>;

    /// Revokes one authorization. Revoking an already-revoked handle
    /// is a no-op.
    async fn revoke_authorization(
        &mut self,
        handle: AuthorizationHandle,
    ) -> Result<(), DepotError>;

    /// Exports the opaque credential that resumes this connection
    /// later. Valid on suspended (pre-sign-in) connections too.
    async fn export_credential(&self) -> Result<SessionCredential, DepotError>;

    async fn disconnect(&mut self);
}

#[async_trait]
/// Connection factory for the messaging network. Implementations wrap
/// whatever client library talks to the provider; the core treats the
/// result as an opaque capability.
pub trait Transport: Send + Sync {
    /// Opens a fresh unauthenticated connection for a give flow.
    async fn begin_login(&self) -> Result<Box<dyn TransportConnection>, DepotError>;

    /// Resumes a connection from a stored credential. Resuming
    /// succeeds even when the credential is no longer authorized;
    /// callers check `is_authorized` or observe `AuthInvalid` on the
    /// first authenticated call.
    async fn resume(&self, credential: &str) -> Result<Box<dyn TransportConnection>, DepotError>;
}

#[async_trait]
/// Outbound operator messaging used for watcher outcomes and relayed
/// verification codes.
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: crate::account_types::ChatId, text: &str)
        -> Result<(), DepotError>;
}
