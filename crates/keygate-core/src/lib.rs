//! Session model, registry, and storage for the keygate broker.
//!
//! A [`Session`] binds a client-supplied key to a [`SharedRecord`] holding
//! identity fields. The [`SessionRegistry`] implements the four broker
//! operations and the periodic expiration sweep on top of a pluggable
//! [`Storage`] backend.

pub mod error;
pub mod record;
pub mod registry;
pub mod storage;

pub use error::SessionError;
pub use record::{Record, Session, SharedRecord, unix_now};
pub use registry::{SessionRegistry, SweepStats};
pub use storage::{MemoryStorage, RedbStorage, Storage, StorageError};
