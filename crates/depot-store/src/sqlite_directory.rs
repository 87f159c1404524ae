use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use depot_contract::{
    Account, AccountDirectory, AccountId, AccountUpdate, DepotError, NewAccount, OwnerId,
};
use depot_core::current_unix_timestamp_ms;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

/// `AccountDirectory` over a SQLite database. The connection sits
/// behind a mutex; directory calls are short single-statement
/// operations and never hold the lock across an await point.
pub struct SqliteAccountDirectory {
    connection: Mutex<Connection>,
}

impl SqliteAccountDirectory {
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
            .map_err(|_| DepotError::Storage("directory connection mutex poisoned".to_string()))
    }
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        alias: row.get(2)?,
        phone: row.get(3)?,
        credential: row.get(4)?,
        two_factor_secret: row.get(5)?,
        monitoring: row.get::<_, i64>(6)? != 0,
        is_taken: row.get::<_, i64>(7)? != 0,
        created_unix_ms: row.get::<_, i64>(8)? as u64,
        updated_unix_ms: row.get::<_, i64>(9)? as u64,
    })
}

const ACCOUNT_COLUMNS: &str = "id, owner_id, alias, phone, credential, two_factor_secret, \
     monitoring, is_taken, created_unix_ms, updated_unix_ms";

#[async_trait]
impl AccountDirectory for SqliteAccountDirectory {
    async fn list_monitored(&self) -> Result<Vec<Account>, DepotError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE monitoring = 1 ORDER BY id"
            ))
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("prepare list_monitored", error))?;
        let rows = statement
            .query_map([], account_from_row)
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("query list_monitored", error))?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row.map_err(|error| {
                crate::sqlite_backend::map_sqlite_error("read list_monitored row", error)
            })?);
        }
        Ok(accounts)
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>, DepotError> {
        let connection = self.lock()?;
        connection
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("query account by id", error))
    }

    async fn get_by_alias(
        &self,
        owner_id: OwnerId,
        alias: &str,
    ) -> Result<Option<Account>, DepotError> {
        let connection = self.lock()?;
        connection
            .query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = ?1 AND alias = ?2"
                ),
                params![owner_id, alias],
                account_from_row,
            )
            .optional()
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("query account by alias", error))
    }

    async fn get_by_phone(
        &self,
        owner_id: OwnerId,
        phone: &str,
    ) -> Result<Option<Account>, DepotError> {
        let connection = self.lock()?;
        connection
            .query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = ?1 AND phone = ?2"
                ),
                params![owner_id, phone],
                account_from_row,
            )
            .optional()
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("query account by phone", error))
    }

    async fn create(&self, account: NewAccount) -> Result<Account, DepotError> {
        let now_unix_ms = current_unix_timestamp_ms() as i64;
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO accounts (owner_id, alias, phone, credential, two_factor_secret, \
                 monitoring, is_taken, created_unix_ms, updated_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    account.owner_id,
                    account.alias,
                    account.phone,
                    account.credential,
                    account.two_factor_secret,
                    account.monitoring as i64,
                    account.is_taken as i64,
                    now_unix_ms,
                ],
            )
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("insert account", error))?;
        let id = connection.last_insert_rowid();
        debug!(account_id = id, owner_id = account.owner_id, "account created");
        Ok(Account {
            id,
            owner_id: account.owner_id,
            alias: account.alias,
            phone: account.phone,
            credential: account.credential,
            two_factor_secret: account.two_factor_secret,
            monitoring: account.monitoring,
            is_taken: account.is_taken,
            created_unix_ms: now_unix_ms as u64,
            updated_unix_ms: now_unix_ms as u64,
        })
    }

    async fn update(&self, id: AccountId, update: AccountUpdate) -> Result<Account, DepotError> {
        // Read and write under one guard so concurrent updates cannot
        // interleave between the lookup and the write.
        let connection = self.lock()?;
        let existing = connection
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("query account by id", error))?
            .ok_or_else(|| DepotError::NotFound(format!("account id {id}")))?;
        if update.is_empty() {
            return Ok(existing);
        }
        let credential = update.credential.unwrap_or(existing.credential);
        let two_factor_secret = match update.two_factor_secret {
            Some(value) => value,
            None => existing.two_factor_secret,
        };
        let monitoring = update.monitoring.unwrap_or(existing.monitoring);
        let is_taken = update.is_taken.unwrap_or(existing.is_taken);
        let now_unix_ms = current_unix_timestamp_ms() as i64;

        connection
            .execute(
                "UPDATE accounts SET credential = ?1, two_factor_secret = ?2, monitoring = ?3, \
                 is_taken = ?4, updated_unix_ms = ?5 WHERE id = ?6",
                params![
                    credential,
                    two_factor_secret,
                    monitoring as i64,
                    is_taken as i64,
                    now_unix_ms,
                    id,
                ],
            )
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("update account", error))?;
        Ok(Account {
            credential,
            two_factor_secret,
            monitoring,
            is_taken,
            updated_unix_ms: now_unix_ms as u64,
            ..existing
        })
    }

    async fn delete(&self, id: AccountId) -> Result<bool, DepotError> {
        let connection = self.lock()?;
        let removed = connection
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(|error| crate::sqlite_backend::map_sqlite_error("delete account", error))?;
        Ok(removed > 0)
    }
}
