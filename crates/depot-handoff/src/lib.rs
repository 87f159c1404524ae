//! Custody handoff for deposited accounts.
//!
//! The give flow walks an operator through depositing an account
//! (phone, verification code, optional second factor, alias) as an
//! explicit state machine whose continuation is a suspended transport
//! connection. The take flow hands the account back and races the
//! operator's manual re-login with a bounded `CustodyWatcher` that
//! polls the account's authorization count and relays verification
//! codes.

pub mod custody_watcher;
pub mod handoff_coordinator;

pub use custody_watcher::{CustodyWatcherConfig, WatcherOutcome, WatcherRegistry};
pub use handoff_coordinator::{
    GivePhase, HandoffConfig, HandoffCoordinator, TakeDisplay,
};
