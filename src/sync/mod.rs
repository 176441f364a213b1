//! Synchronization engine for hierarchical, multi-master replicated repos.
//!
//! This module implements the core synchronization logic on top of the
//! abstract document store. It provides:
//! - Pointer-propagation writes that keep ancestor indexes consistent
//! - Incremental diffs that only walk pointers newer than a baseline
//! - Deterministic resolution of replication conflicts
//! - Checkpoint/version sync with self-verifying sums
//! - A bounded retry driver around optimistic-concurrency conflicts

pub mod checkpoint;
pub mod diff;
pub mod document;
pub mod paths;
pub mod resolver;
pub mod retry;
pub mod server;
pub mod writer;

pub use server::{SyncServer, SyncServerConfig};

use std::collections::BTreeMap;
use thiserror::Error;

use crate::storage::StorageError;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Per-repo file version number
pub type Version = u64;

/// Client-supplied mutation: path -> new content, `None` deletes the path
pub type ChangeSet = BTreeMap<String, Option<Vec<u8>>>;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Category of a client-facing error, mirroring its HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Unprocessable,
}

impl ClientErrorKind {
    pub fn status(self) -> u16 {
        match self {
            ClientErrorKind::BadRequest => 400,
            ClientErrorKind::NotFound => 404,
            ClientErrorKind::Conflict => 409,
            ClientErrorKind::Unprocessable => 422,
        }
    }
}

/// An error caused by the request itself. Surfaced verbatim, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Conflict, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Unprocessable, message)
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }
}

/// Errors that can occur during synchronization
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Optimistic-concurrency signal from the store; recovered by the retry driver
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("failed to resolve conflicts after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// A document had a shape the data model does not allow at that key
    #[error("structural error: {0}")]
    Structural(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// The client error carried by this error, if any
    pub fn client(&self) -> Option<&ClientError> {
        match self {
            SyncError::Client(err) => Some(err),
            _ => None,
        }
    }
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
