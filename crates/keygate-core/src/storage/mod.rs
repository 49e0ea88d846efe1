//! Storage abstraction for sessions.
//!
//! Trait-based abstraction over a volatile in-memory map and a durable redb
//! database. Methods are async (`async-trait`, no runtime dependency) so the
//! registry can treat every backend call as a suspension point.

mod error;
mod memory;
mod redb;

pub use error::StorageError;
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;
use crate::record::Session;

/// Storage abstraction for sessions.
///
/// Must be Clone (one handle per task), Send + Sync. Implementations share
/// internal state via Arc, so clones access the same underlying store.
///
/// Backends that key record rows by reference assign `stored_ref` through
/// the session's record handle on first persist; `set` with an existing ref
/// updates in place. Two sessions carrying the same ref is the durable form
/// of transfer aliasing, not a conflict.
#[async_trait::async_trait]
pub trait Storage: Clone + Send + Sync + 'static {
    /// Validates the backend before the server accepts traffic.
    async fn ready(&self) -> Result<(), StorageError>;

    /// Loads the session stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Session>, StorageError>;

    /// Upserts `session` under `key`.
    async fn set(&self, key: &str, session: &Session) -> Result<(), StorageError>;

    /// Removes the session stored under `key`. Removing an absent key is a
    /// no-op.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Calls `visit` once per stored session, in no particular order.
    async fn each(&self, visit: &mut (dyn for<'a> FnMut(&'a Session) + Send)) -> Result<(), StorageError>;

    /// Reclaims rows no session references.
    ///
    /// Default no-op: backends whose records die with their last session
    /// have nothing to reclaim.
    async fn cleanup(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
