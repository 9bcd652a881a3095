//! Error taxonomy shared by the transfer engine and its adapters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("{context}")]
    LocalIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} was not found")]
    RemoteNotFound { what: String },

    #[error("{what} already exists")]
    Conflict { what: String },

    /// Retryable statuses exhausted the attempt budget.
    #[error("the service is experiencing technical difficulties, try again later (status {last_status} after {attempts} attempts)")]
    Transient { attempts: u32, last_status: u16 },

    #[error("request failed with status {status}: {message}")]
    Permanent { status: u16, message: String },

    /// Transport failure with no status from the server; never retried.
    #[error("network error: {message}")]
    Network { message: String },

    #[error("Cannot get asset {path} ({status})")]
    CannotGetAsset { path: String, status: u16 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Body(String),
}

impl SyncError {
    /// The HTTP status that produced this error, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Transient { last_status, .. } => Some(*last_status),
            SyncError::Permanent { status, .. } => Some(*status),
            SyncError::CannotGetAsset { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::RemoteNotFound { .. })
            || self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. }) || self.status() == Some(409)
    }
}

/// Terminal outcome of one item in a bulk run.
#[derive(Debug)]
pub struct ItemFailure {
    pub path: String,
    pub error: SyncError,
    /// Set when the push filter asked the driver to schedule a later pass.
    pub retry: bool,
}

impl ItemFailure {
    pub fn new(path: impl Into<String>, error: SyncError) -> Self {
        Self {
            path: path.into(),
            error,
            retry: false,
        }
    }

    pub fn retryable(path: impl Into<String>, error: SyncError) -> Self {
        Self {
            path: path.into(),
            error,
            retry: true,
        }
    }
}
