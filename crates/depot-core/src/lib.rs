//! Foundational low-level utilities shared across depot crates.
//!
//! Provides time utilities used by account timestamps and handoff
//! expiry, plus redaction helpers that keep phone numbers out of
//! operational logs.

pub mod redact;
pub mod time_utils;

pub use redact::redact_phone;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix};
