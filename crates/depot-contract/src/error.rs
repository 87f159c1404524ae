use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
/// Error taxonomy shared by every depot crate. Callers branch on the
/// class, not the message: transient classes are retried on the next
/// cycle or poll, fatal classes abort the flow that raised them, and
/// validation classes re-prompt without consuming flow state.
pub enum DepotError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("session credential is invalid or has been revoked")]
    AuthInvalid,
    #[error("rate limited, wait {wait_seconds}s before retrying")]
    RateLimited { wait_seconds: u64 },
    #[error("second factor required to complete sign-in")]
    TwoFactorRequired,
    #[error("verification code expired or was revoked")]
    CodeExpired,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not valid for the current flow state: {0}")]
    FlowState(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl DepotError {
    /// Stable machine-readable code for reports and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient_network",
            Self::AuthInvalid => "auth_invalid",
            Self::RateLimited { .. } => "rate_limited",
            Self::TwoFactorRequired => "two_factor_required",
            Self::CodeExpired => "code_expired",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::FlowState(_) => "flow_state",
            Self::Storage(_) => "storage",
        }
    }

    /// True for failures worth retrying on the next cycle without any
    /// state change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::RateLimited { .. }
        )
    }

    /// Mandated back-off, when the failure carries one.
    pub fn wait_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { wait_seconds } => Some(*wait_seconds),
            _ => None,
        }
    }
}
