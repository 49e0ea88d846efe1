//! In-memory storage implementation.
//!
//! Sessions are stored live: the map holds `Session` values whose record
//! handles are the very handles the registry mutates, so transfer aliasing
//! is shared in place and nothing is ever serialized. All state is lost on
//! restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Storage, StorageError};
use crate::record::Session;

/// Volatile storage backed by a `HashMap`.
///
/// Thread-safe via internal mutex. Clone is cheap (Arc) and clones share
/// the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock).
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("Mutex poisoned").len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn ready(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    async fn get(&self, key: &str) -> Result<Option<Session>, StorageError> {
        let sessions = self.sessions.lock().expect("Mutex poisoned");
        Ok(sessions.get(key).cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    async fn set(&self, key: &str, session: &Session) -> Result<(), StorageError> {
        let mut sessions = self.sessions.lock().expect("Mutex poisoned");
        sessions.insert(key.to_owned(), session.clone());
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut sessions = self.sessions.lock().expect("Mutex poisoned");
        sessions.remove(key);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    async fn each(&self, visit: &mut (dyn for<'a> FnMut(&'a Session) + Send)) -> Result<(), StorageError> {
        let sessions = self.sessions.lock().expect("Mutex poisoned");
        for session in sessions.values() {
            visit(session);
        }
        Ok(())
    }
}
