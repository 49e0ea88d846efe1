//! Redb-backed durable storage implementation.
//!
//! Uses redb's ACID transactions with copy-on-write for crash safety. All
//! state survives server restarts.
//!
//! Sessions and records live in separate tables joined by a record
//! reference, so transfer aliasing survives durably: two session rows
//! pointing at one record row is the stored form of a shared handle.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{Storage, StorageError};
use crate::record::{Record, Session, SharedRecord};

/// Table: sessions
/// Key: session key (UTF-8)
/// Value: CBOR-encoded `SessionRow`
const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Table: records
/// Key: record reference
/// Value: CBOR-encoded `RecordRow`
const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// Table: meta
/// Key: counter name
/// Value: next value to hand out
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Record references count up from 1 and are never reused, so a deleted
/// reference cannot be resurrected by a later insert.
const NEXT_RECORD_REF: &str = "next_record_ref";

#[derive(Debug, Serialize, Deserialize)]
struct SessionRow {
    record_ref: u64,
    redirect: Option<String>,
    tag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordRow {
    uid: i32,
    user: String,
    display: String,
    expire: i64,
    lifetime: i32,
}

/// Durable storage backed by redb.
///
/// Thread-safe through redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a redb database at the given path.
    ///
    /// Creates tables if they don't exist (SESSIONS, RECORDS, META).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Hand out the next record reference and advance the counter.
    fn alloc_record_ref(&self, txn: &WriteTransaction) -> Result<u64, StorageError> {
        let mut meta = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;

        let next = match meta.get(NEXT_RECORD_REF).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => value.value(),
            None => 1,
        };
        meta.insert(NEXT_RECORD_REF, next + 1).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(next)
    }
}

/// Rebuild a session from its row, resolving the record reference.
fn decode_session<T: ReadableTable<u64, &'static [u8]>>(
    key: &str,
    row_bytes: &[u8],
    records: &T,
) -> Result<Session, StorageError> {
    let row: SessionRow = ciborium::from_reader(row_bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let Some(value) =
        records.get(row.record_ref).map_err(|e| StorageError::Io(e.to_string()))?
    else {
        return Err(StorageError::Corrupt(format!(
            "session '{key}' references missing record {}",
            row.record_ref
        )));
    };
    let record: RecordRow = ciborium::from_reader(value.value())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(Session {
        key: key.to_owned(),
        record: SharedRecord::new(Record {
            uid: record.uid,
            user: record.user,
            display: record.display,
            expire: record.expire,
            lifetime: record.lifetime,
            stored_ref: Some(row.record_ref),
        }),
        redirect: row.redirect,
        tag: row.tag,
    })
}

#[async_trait::async_trait]
impl Storage for RedbStorage {
    async fn ready(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let _ = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        let _ = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
        let _ = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Session>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let sessions = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        let records = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

        match sessions.get(key).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode_session(key, value.value(), &records)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, session: &Session) -> Result<(), StorageError> {
        let snapshot = session.record.snapshot();
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        // Reference assigned during this persist, written back to the shared
        // handle only after the transaction commits.
        let mut assigned = None;

        {
            let record_ref = match snapshot.stored_ref {
                Some(record_ref) => record_ref,
                None => {
                    let record_ref = self.alloc_record_ref(&txn)?;
                    assigned = Some(record_ref);
                    record_ref
                },
            };

            let mut records =
                txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
            let row = RecordRow {
                uid: snapshot.uid,
                user: snapshot.user,
                display: snapshot.display,
                expire: snapshot.expire,
                lifetime: snapshot.lifetime,
            };
            let mut bytes = Vec::new();
            ciborium::into_writer(&row, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            records
                .insert(record_ref, bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;

            let mut sessions =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let row = SessionRow {
                record_ref,
                redirect: session.redirect.clone(),
                tag: session.tag.clone(),
            };
            let mut bytes = Vec::new();
            ciborium::into_writer(&row, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            sessions
                .insert(key, bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        if let Some(record_ref) = assigned {
            session.record.with(|record| record.stored_ref = Some(record_ref));
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut sessions =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            sessions.remove(key).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    async fn each(&self, visit: &mut (dyn for<'a> FnMut(&'a Session) + Send)) -> Result<(), StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let sessions = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        let records = txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;

        for result in sessions.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let session = decode_session(key.value(), value.value(), &records)?;
            visit(&session);
        }

        Ok(())
    }

    /// Deletes record rows referenced by zero session rows.
    async fn cleanup(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let sessions =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut live = HashSet::new();
            for result in sessions.iter().map_err(|e| StorageError::Io(e.to_string()))? {
                let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                let row: SessionRow = ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                live.insert(row.record_ref);
            }

            let mut records =
                txn.open_table(RECORDS).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut orphans = Vec::new();
            for result in records.iter().map_err(|e| StorageError::Io(e.to_string()))? {
                let (record_ref, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                if !live.contains(&record_ref.value()) {
                    orphans.push(record_ref.value());
                }
            }
            for record_ref in orphans {
                records.remove(record_ref).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keygate_proto::FieldSet;
    use tempfile::tempdir;

    use super::*;
    use crate::record::unix_now;

    fn active_session(key: &str, uid: i32) -> Session {
        let mut session = Session::new(key);
        session.apply(
            &FieldSet {
                uid: Some(uid),
                user: Some(format!("user-{uid}")),
                display: Some(format!("User {uid}")),
                lifetime: Some(300),
                redirect: Some("/home".into()),
                ..FieldSet::default()
            },
            unix_now(),
        );
        session
    }

    async fn count_records(storage: &RedbStorage) -> usize {
        let txn = storage.db.begin_read().unwrap();
        let records = txn.open_table(RECORDS).unwrap();
        records.iter().unwrap().count()
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        assert!(storage.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_assigns_ref_and_round_trips() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let session = active_session("abc", 7);
        assert!(session.record.with(|r| r.stored_ref.is_none()));
        storage.set("abc", &session).await.unwrap();

        // First persist writes the assigned ref back through the handle.
        let assigned = session.record.with(|r| r.stored_ref);
        assert_eq!(assigned, Some(1));

        let loaded = storage.get("abc").await.unwrap().unwrap();
        assert_eq!(loaded.key, "abc");
        assert_eq!(loaded.redirect.as_deref(), Some("/home"));
        assert_eq!(loaded.record.with(|r| r.uid), 7);
        assert_eq!(loaded.record.with(|r| r.user.clone()), "user-7");
        assert_eq!(loaded.record.with(|r| r.stored_ref), assigned);
    }

    #[tokio::test]
    async fn second_set_updates_in_place() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let session = active_session("abc", 7);
        storage.set("abc", &session).await.unwrap();
        session.record.with(|r| r.display = "Renamed".into());
        storage.set("abc", &session).await.unwrap();

        let loaded = storage.get("abc").await.unwrap().unwrap();
        assert_eq!(loaded.record.with(|r| r.display.clone()), "Renamed");
        assert_eq!(count_records(&storage).await, 1);
    }

    #[tokio::test]
    async fn refs_are_never_reused() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let first = active_session("a", 1);
        storage.set("a", &first).await.unwrap();
        storage.delete("a").await.unwrap();
        storage.cleanup().await.unwrap();

        let second = active_session("b", 2);
        storage.set("b", &second).await.unwrap();
        assert_eq!(second.record.with(|r| r.stored_ref), Some(2));
    }

    #[tokio::test]
    async fn aliased_sessions_share_one_row() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let src = active_session("src", 7);
        storage.set("src", &src).await.unwrap();

        let mut dst = Session::new("dst");
        storage.set("dst", &dst).await.unwrap();

        // Durable transfer: dst adopts src's record handle.
        dst.record = src.record.clone();
        storage.set("dst", &dst).await.unwrap();

        let a = storage.get("src").await.unwrap().unwrap();
        let b = storage.get("dst").await.unwrap().unwrap();
        assert_eq!(a.record.with(|r| r.stored_ref), b.record.with(|r| r.stored_ref));

        // A commit through one key is visible through the other.
        let via_src = storage.get("src").await.unwrap().unwrap();
        via_src.record.with(|r| r.display = "Shared".into());
        storage.set("src", &via_src).await.unwrap();
        let via_dst = storage.get("dst").await.unwrap().unwrap();
        assert_eq!(via_dst.record.with(|r| r.display.clone()), "Shared");
    }

    #[tokio::test]
    async fn cleanup_reclaims_orphans_only() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let src = active_session("src", 7);
        storage.set("src", &src).await.unwrap();
        let mut dst = Session::new("dst");
        dst.record = src.record.clone();
        storage.set("dst", &dst).await.unwrap();

        // dst was aliased before its first persist: both session rows point
        // at the one record row.
        assert_eq!(count_records(&storage).await, 1);

        storage.delete("src").await.unwrap();
        storage.cleanup().await.unwrap();
        // dst still references the record; it must survive.
        assert_eq!(count_records(&storage).await, 1);
        assert!(storage.get("dst").await.unwrap().is_some());

        storage.delete("dst").await.unwrap();
        storage.cleanup().await.unwrap();
        assert_eq!(count_records(&storage).await, 0);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.set("abc", &active_session("abc", 7)).await.unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        storage.ready().await.unwrap();
        let loaded = storage.get("abc").await.unwrap().unwrap();
        assert_eq!(loaded.record.with(|r| r.uid), 7);
    }

    #[tokio::test]
    async fn each_visits_every_session() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        for (key, uid) in [("a", 1), ("b", 2), ("c", 3)] {
            storage.set(key, &active_session(key, uid)).await.unwrap();
        }

        let mut keys = Vec::new();
        storage
            .each(&mut |session| keys.push(session.key.clone()))
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
