use async_trait::async_trait;

use crate::account_types::{
    Account, AccountId, AccountUpdate, ArchivedMessage, ConversationId, ExternalMessageId,
    NewAccount, OwnerId,
};
use crate::error::DepotError;

#[async_trait]
/// Source of truth for persistent account state. The directory is the
/// single writer-of-record: every mutation of custody, monitoring, or
/// credentials goes through it rather than through cached copies.
pub trait AccountDirectory: Send + Sync {
    /// All accounts with monitoring enabled, the pool's desired set.
    async fn list_monitored(&self) -> Result<Vec<Account>, DepotError>;

    async fn get(&self, id: AccountId) -> Result<Option<Account>, DepotError>;

    async fn get_by_alias(
        &self,
        owner_id: OwnerId,
        alias: &str,
    ) -> Result<Option<Account>, DepotError>;

    async fn get_by_phone(
        &self,
        owner_id: OwnerId,
        phone: &str,
    ) -> Result<Option<Account>, DepotError>;

    /// Creates a record, failing with `Conflict` when `(owner, alias)`
    /// or `(owner, phone)` already exists.
    async fn create(&self, account: NewAccount) -> Result<Account, DepotError>;

    /// Applies a partial update, failing with `NotFound` for unknown
    /// ids. Bumps `updated_unix_ms`.
    async fn update(&self, id: AccountId, update: AccountUpdate) -> Result<Account, DepotError>;

    /// Removes a record; returns whether anything was deleted.
    async fn delete(&self, id: AccountId) -> Result<bool, DepotError>;
}

#[async_trait]
/// Archive for monitored traffic. Implementations enforce row
/// uniqueness per `(account, conversation, external id)` so event
/// redelivery never duplicates.
pub trait MessageStore: Send + Sync {
    async fn upsert_message(&self, message: &ArchivedMessage) -> Result<(), DepotError>;

    /// Marks the listed messages deleted at `now`. Unknown ids and
    /// rows already marked are left untouched; returns the number of
    /// rows newly marked. Applying the same batch twice is a no-op
    /// after the first application.
    async fn mark_deleted(
        &self,
        account_id: AccountId,
        external_ids: &[ExternalMessageId],
    ) -> Result<u64, DepotError>;

    async fn list_conversations(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ConversationId>, DepotError>;

    async fn list_messages(
        &self,
        account_id: AccountId,
        conversation_id: ConversationId,
    ) -> Result<Vec<ArchivedMessage>, DepotError>;
}
