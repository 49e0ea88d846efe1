//! The session registry: one entry point per operation, plus the sweep.
//!
//! The registry owns nothing but a storage handle; all session state lives
//! in storage and is fetched per operation. Callers are expected to
//! serialize access (the server holds the registry behind one async mutex),
//! which closes the read-modify-write race between concurrent operations on
//! the same key.

use keygate_proto::{FieldSet, Message, Op, Reply};

use crate::error::SessionError;
use crate::record::{Session, unix_now};
use crate::storage::{Storage, StorageError};

/// Outcome of one sweep cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStats {
    /// Sessions granted a grace cycle (`expire` raised from <= 0 to 1).
    pub extended: usize,
    /// Sessions deleted.
    pub deleted: usize,
}

/// Implements the four broker operations and the expiration sweep over a
/// storage backend.
#[derive(Debug, Clone)]
pub struct SessionRegistry<S: Storage> {
    storage: S,
}

impl<S: Storage> SessionRegistry<S> {
    /// Creates a registry over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The underlying storage handle.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Routes a decoded message to its operation.
    ///
    /// # Errors
    ///
    /// Validation errors ([`SessionError::is_validation`]) should become
    /// error replies; storage errors are fatal.
    pub async fn dispatch(&mut self, message: &Message) -> Result<Reply, SessionError> {
        match message.op {
            Op::Lookup => self.lookup(&message.fields).await,
            Op::Commit => self.commit(&message.fields).await,
            Op::Create => self.create(&message.fields).await,
            Op::Transfer => self.transfer(&message.fields).await,
        }
    }

    /// Fetches a session and returns its serialized form.
    ///
    /// Runs the lazy expiration check first; the purge is persisted only
    /// when it changed something, so an expired lookup costs one write and
    /// a fresh one costs none.
    pub async fn lookup(&mut self, fields: &FieldSet) -> Result<Reply, SessionError> {
        let key = require(fields.key.as_deref(), "key")?;
        let Some(mut session) = self.storage.get(key).await? else {
            return Err(SessionError::NoSuchRecord);
        };

        let now = unix_now();
        if session.check(now) {
            tracing::debug!(key, "lookup purged expired identity");
            self.storage.set(key, &session).await?;
        }

        Ok(Reply::Record(session.wire(now)))
    }

    /// Applies fields to an existing session and persists it.
    pub async fn commit(&mut self, fields: &FieldSet) -> Result<Reply, SessionError> {
        let key = require(fields.key.as_deref(), "key")?;
        let Some(mut session) = self.storage.get(key).await? else {
            return Err(SessionError::NoSuchRecord);
        };

        session.apply(fields, unix_now());
        self.storage.set(key, &session).await?;

        Ok(Reply::Message("record committed".into()))
    }

    /// Creates a session under a key, reclaiming an inactive one in place.
    ///
    /// An inactive existing session is purged and reused rather than
    /// replaced, which keeps its `stored_ref` and therefore its stored row.
    pub async fn create(&mut self, fields: &FieldSet) -> Result<Reply, SessionError> {
        let key = require(fields.key.as_deref(), "key")?;
        let now = unix_now();

        let mut session = match self.storage.get(key).await? {
            Some(existing) if existing.is_active(now) => {
                return Err(SessionError::RecordExists);
            },
            Some(existing) => existing,
            None => Session::new(key),
        };

        session.purge();
        session.apply(fields, now);
        self.storage.set(key, &session).await?;
        tracing::debug!(key, "session created");

        Ok(Reply::Message("record created".into()))
    }

    /// Aliases the destination session's record to the source's.
    ///
    /// After a transfer both keys resolve to one record; a commit through
    /// either is visible through both. Transferring a key onto itself is a
    /// successful no-op.
    pub async fn transfer(&mut self, fields: &FieldSet) -> Result<Reply, SessionError> {
        let src = require(fields.src.as_deref(), "src")?;
        let dst = require(fields.dst.as_deref(), "dst")?;

        let Some(src_session) = self.storage.get(src).await? else {
            return Err(SessionError::NoSuchSource);
        };
        let Some(mut dst_session) = self.storage.get(dst).await? else {
            return Err(SessionError::NoSuchDestination);
        };

        if src != dst {
            dst_session.record = src_session.record.clone();
            self.storage.set(dst, &dst_session).await?;
            tracing::debug!(src, dst, "session transferred");
        }

        Ok(Reply::Message("record transferred".into()))
    }

    /// One expiration sweep cycle.
    ///
    /// Classifies every stored session, then applies all extensions, then
    /// all deletions, then reclaims orphaned rows once. A session that
    /// expired with `expire <= 0` (a purged row, typically) gets one grace
    /// cycle at `expire = 1` before the next sweep deletes it.
    pub async fn sweep(&mut self) -> Result<SweepStats, StorageError> {
        let now = unix_now();
        let mut extends: Vec<Session> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();

        self.storage
            .each(&mut |session| {
                if session.is_active(now) {
                    return;
                }
                if session.record.with(|record| record.expire) <= 0 {
                    extends.push(session.clone());
                } else {
                    deletes.push(session.key.clone());
                }
            })
            .await?;

        for session in &extends {
            session.record.with(|record| record.expire = 1);
            self.storage.set(&session.key, session).await?;
        }
        for key in &deletes {
            self.storage.delete(key).await?;
        }
        self.storage.cleanup().await?;

        let stats = SweepStats { extended: extends.len(), deleted: deletes.len() };
        tracing::info!(extended = stats.extended, deleted = stats.deleted, "sweep complete");
        Ok(stats)
    }
}

fn require<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, SessionError> {
    value.ok_or(SessionError::MissingField(name))
}
