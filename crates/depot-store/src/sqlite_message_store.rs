use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use depot_contract::{
    AccountId, ArchivedMessage, ConversationId, DepotError, ExternalMessageId, MediaKind,
    MessageStore,
};
use depot_core::current_unix_timestamp_ms;
use rusqlite::{params, Connection, Row};
use tracing::debug;

/// `MessageStore` over a SQLite database. Row identity is
/// `(account_id, conversation_id, external_id)`; redelivered events
/// update the existing row instead of inserting a duplicate, and a
/// redelivery never resurrects a message already marked deleted.
pub struct SqliteMessageStore {
    connection: Mutex<Connection>,
}

impl SqliteMessageStore {
    pub fn open(path: &Path) -> Result<Self, DepotError> {
        Ok(Self {
            connection: Mutex::new(crate::sqlite_backend::open_depot_database(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, DepotError> {
        Ok(Self {
            connection: Mutex::new(crate::sqlite_backend::open_depot_database_in_memory()?),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DepotError> {
        self.connection
            .lock()
            .map_err(|_| DepotError::Storage("message store connection mutex poisoned".to_string()))
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ArchivedMessage> {
    let media_kind: Option<String> = row.get(6)?;
    Ok(ArchivedMessage {
        account_id: row.get(0)?,
        conversation_id: row.get(1)?,
        external_id: row.get(2)?,
        sender_id: row.get(3)?,
        text: row.get(4)?,
        media_ref: row.get(5)?,
        media_kind: media_kind.as_deref().and_then(MediaKind::parse),
        sent_unix_ms: row.get::<_, i64>(7)? as u64,
        deleted_unix_ms: row.get::<_, Option<i64>>(8)?.map(|value| value as u64),
    })
}

const MESSAGE_COLUMNS: &str = "account_id, conversation_id, external_id, sender_id, text, \
     media_ref, media_kind, sent_unix_ms, deleted_unix_ms";

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn upsert_message(&self, message: &ArchivedMessage) -> Result<(), DepotError> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO archived_messages (account_id, conversation_id, external_id, \
                 sender_id, text, media_ref, media_kind, sent_unix_ms, deleted_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(account_id, conversation_id, external_id) DO UPDATE SET \
                 sender_id = excluded.sender_id, text = excluded.text, \
                 media_ref = excluded.media_ref, media_kind = excluded.media_kind, \
                 sent_unix_ms = excluded.sent_unix_ms",
                params![
                    message.account_id,
                    message.conversation_id,
                    message.external_id,
                    message.sender_id,
                    message.text,
                    message.media_ref,
                    message.media_kind.map(MediaKind::as_str),
                    message.sent_unix_ms as i64,
                    message.deleted_unix_ms.map(|value| value as i64),
                ],
            )
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("upsert message", error))?;
        Ok(())
    }

    async fn mark_deleted(
        &self,
        account_id: AccountId,
        external_ids: &[ExternalMessageId],
    ) -> Result<u64, DepotError> {
        let now_unix_ms = current_unix_timestamp_ms() as i64;
        let connection = self.lock()?;
        let mut marked = 0u64;
        for external_id in external_ids {
            let changed = connection
                .execute(
                    "UPDATE archived_messages SET deleted_unix_ms = ?1 \
                     WHERE account_id = ?2 AND external_id = ?3 AND deleted_unix_ms IS NULL",
                    params![now_unix_ms, account_id, external_id],
                )
                .map_err(|error| {
                    crate::sqlite_backend::map_sqlite_error("mark message deleted", error)
                })?;
            marked = marked.saturating_add(changed as u64);
        }
        if marked > 0 {
            debug!(account_id, marked, "deletion batch applied");
        }
        Ok(marked)
    }

    async fn list_conversations(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ConversationId>, DepotError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT DISTINCT conversation_id FROM archived_messages \
                 WHERE account_id = ?1 ORDER BY conversation_id",
            )
            .map_err(|error| {
                crate::sqlite_backend::map_sqlite_error("prepare list_conversations", error)
            })?;
        let rows = statement
            .query_map(params![account_id], |row| row.get::<_, i64>(0))
            .map_err(|error| {
                crate::sqlite_backend::map_sqlite_error("query list_conversations", error)
            })?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row.map_err(|error| {
                crate::sqlite_backend::map_sqlite_error("read conversation row", error)
            })?);
        }
        Ok(conversations)
    }

    async fn list_messages(
        &self,
        account_id: AccountId,
        conversation_id: ConversationId,
    ) -> Result<Vec<ArchivedMessage>, DepotError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM archived_messages \
                 WHERE account_id = ?1 AND conversation_id = ?2 ORDER BY external_id"
            ))
            .map_err(|error| {
                crate::sqlite_backend::map_sqlite_error("prepare list_messages", error)
            })?;
        let rows = statement
            .query_map(params![account_id, conversation_id], message_from_row)
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("query list_messages", error))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(|error| {
                crate::sqlite_backend::map_sqlite_error("read message row", error)
            })?);
        }
        Ok(messages)
    }
}
