//! Shared contracts for the depot custody pool.
//!
//! Defines the persistent entity shapes (accounts, archived messages),
//! the error taxonomy every depot crate branches on, and the
//! collaborator seams the core depends on: the account directory, the
//! message store, the opaque per-account transport, and the operator
//! notifier. Storage and network technology choices live behind these
//! traits, never in the core.

pub mod account_types;
pub mod directory_contract;
pub mod error;
pub mod transport_contract;

pub use account_types::*;
pub use directory_contract::*;
pub use error::*;
pub use transport_contract::*;
