use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Bulletin operations
pub type BulletinResult<T> = Result<T, BulletinError>;

/// Errors that can occur while syncing announcements
#[derive(Error, Debug)]
pub enum BulletinError {
    #[error("Fetch failed: {message}")]
    FetchFailed { message: String },

    #[error("Failed to decode feed event: {message}")]
    DecodeFailed { message: String },

    #[error("Persistence unavailable: {message}")]
    PersistenceUnavailable { message: String },

    #[error("Subscription lost: {message}")]
    SubscriptionLost { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BulletinError {
    /// Which fault class this error is reported as on a `SyncState`
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::FetchFailed { .. } => FaultKind::Fetch,
            Self::DecodeFailed { .. } | Self::Protocol { .. } | Self::Serialization(_) => {
                FaultKind::Decode
            }
            Self::PersistenceUnavailable { .. } | Self::Io(_) => FaultKind::Persistence,
            Self::SubscriptionLost { .. } => FaultKind::Subscription,
            Self::Internal(_) => FaultKind::Internal,
        }
    }
}

/// Fault classes recorded alongside the last good state
///
/// Each class is tracked separately. Declaration order is reporting
/// priority: `SyncState::fault` returns the first open one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Fetch,
    Persistence,
    Subscription,
    Decode,
    Internal,
}

/// A recorded failure, carried on `SyncState` instead of being returned as `Err`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFault {
    pub kind: FaultKind,
    pub message: String,
}

impl From<&BulletinError> for SyncFault {
    fn from(err: &BulletinError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
