use std::path::Path;

use depot_contract::DepotError;
use rusqlite::Connection;

/// Opens a database file and bootstraps the depot schema.
pub(crate) fn open_depot_database(path: &Path) -> Result<Connection, DepotError> {
    let connection = Connection::open(path)
        .map_err(|error| DepotError::Storage(format!("failed to open {}: {error}", path.display())))?;
    bootstrap_schema(&connection)?;
    Ok(connection)
}

/// Opens a private in-memory database, used by tests and embedders
/// that do not need persistence across restarts.
pub(crate) fn open_depot_database_in_memory() -> Result<Connection, DepotError> {
    let connection = Connection::open_in_memory()
        .map_err(|error| DepotError::Storage(format!("failed to open in-memory database: {error}")))?;
    bootstrap_schema(&connection)?;
    Ok(connection)
}

fn bootstrap_schema(connection: &Connection) -> Result<(), DepotError> {
    connection
        .execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            owner_id INTEGER NOT NULL,
            alias TEXT NOT NULL,
            phone TEXT NOT NULL,
            credential TEXT NOT NULL,
            two_factor_secret TEXT NULL,
            monitoring INTEGER NOT NULL DEFAULT 0,
            is_taken INTEGER NOT NULL DEFAULT 0,
            created_unix_ms INTEGER NOT NULL,
            updated_unix_ms INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_owner_alias
            ON accounts(owner_id, alias);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_owner_phone
            ON accounts(owner_id, phone);

        CREATE TABLE IF NOT EXISTS archived_messages (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            conversation_id INTEGER NOT NULL,
            external_id INTEGER NOT NULL,
            sender_id INTEGER NULL,
            text TEXT NOT NULL,
            media_ref INTEGER NULL,
            media_kind TEXT NULL,
            sent_unix_ms INTEGER NOT NULL,
            deleted_unix_ms INTEGER NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_archived_messages_identity
            ON archived_messages(account_id, conversation_id, external_id);
        CREATE INDEX IF NOT EXISTS idx_archived_messages_account_external
            ON archived_messages(account_id, external_id);
        "#,
        )
        .map_err(|error| DepotError::Storage(format!("failed to bootstrap schema: {error}")))
}

/// Maps a rusqlite failure onto the depot taxonomy; uniqueness
/// violations become `Conflict`, everything else `Storage`.
pub(crate) fn map_sqlite_error(context: &str, error: rusqlite::Error) -> DepotError {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = error {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            let detail = message.clone().unwrap_or_else(|| "constraint violation".to_string());
            return DepotError::Conflict(detail);
        }
    }
    DepotError::Storage(format!("{context}: {error}"))
}
