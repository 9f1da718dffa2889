use crate::events::Rejection;

/// Failure taxonomy for every client-initiated operation.
///
/// Validation and authorization variants are resolved locally and reported
/// only to the caller. `SyncFailed` and `Store` mean the operation was
/// aborted and local state is exactly as it was before the call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("not found: {0}")]
    NotFound(String),

    // Conflicts
    #[error("truck {truck_id} is already held by {holder}")]
    AlreadyHeld { truck_id: i64, holder: String },
    #[error("forbidden: {0}")]
    Forbidden(String),

    // Infrastructure
    #[error("authority sync failed: {0}")]
    SyncFailed(String),
    #[error("store unavailable: {0}")]
    Store(String),
}

impl RelayError {
    /// Stable machine-checkable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyHeld { .. } => "ALREADY_HELD",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::SyncFailed(_) => "SYNC_FAILED",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyHeld { .. } | Self::Forbidden(_))
    }

    /// Infrastructure failures are surfaced generically; the detail is
    /// for logs only.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::SyncFailed(_) | Self::Store(_))
    }

    pub fn to_rejection(&self, event: &str) -> Rejection {
        let message = match self {
            Self::Store(_) => "temporary failure, please retry".to_string(),
            Self::SyncFailed(_) => "could not reach reservation service".to_string(),
            other => other.to_string(),
        };
        Rejection {
            code: self.code().to_string(),
            message,
            event: Some(event.to_string()),
        }
    }
}
