//! SQLite reference backend for the depot directory and message store.
//!
//! Implements `AccountDirectory` and `MessageStore` over rusqlite. The
//! schema carries the uniqueness invariants the contracts promise:
//! `(owner, alias)` and `(owner, phone)` on accounts, and
//! `(account, conversation, external id)` on archived messages, the
//! latter satisfied with an upsert so event redelivery never
//! duplicates rows.

mod sqlite_backend;
mod sqlite_directory;
mod sqlite_message_store;

pub use sqlite_directory::SqliteAccountDirectory;
pub use sqlite_message_store::SqliteMessageStore;
