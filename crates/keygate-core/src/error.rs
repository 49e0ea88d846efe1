//! Operation errors.

use crate::storage::StorageError;

/// Errors from the four broker operations.
///
/// The validation variants render exactly the text sent back to clients in
/// an error reply. Storage failures are not validation problems and must
/// never reach a client; they terminate the process instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A required field was absent from the request.
    #[error("missing {0} field")]
    MissingField(&'static str),

    /// Lookup or commit addressed a key with no session.
    #[error("no such record")]
    NoSuchRecord,

    /// Create addressed a key whose session is still active.
    #[error("record already exists")]
    RecordExists,

    /// Transfer named a source key with no session.
    #[error("no such source record")]
    NoSuchSource,

    /// Transfer named a destination key with no session.
    #[error("no such destination record")]
    NoSuchDestination,

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// True for errors caused by the request itself. These become error
    /// replies and leave the connection open; everything else is fatal.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}
