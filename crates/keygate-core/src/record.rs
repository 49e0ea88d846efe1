//! Records, sessions, and their pure state transitions.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use keygate_proto::FieldSet;
use keygate_proto::reply::{RecordWire, SessionWire};

/// Current Unix time in seconds.
///
/// Clamps to 0 if the clock reads before the epoch.
pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Identity fields shared by one or more sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// User id; >= 1 names a real user, anything below carries no identity.
    pub uid: i32,
    /// Login name.
    pub user: String,
    /// Display name.
    pub display: String,
    /// Expiration, epoch seconds. The session dies at this instant.
    pub expire: i64,
    /// Lifetime in seconds, used to compute `expire` on commit.
    pub lifetime: i32,
    /// Backend-assigned identifier, `None` until first persisted. Drives
    /// insert-vs-update and lets aliased sessions share one stored row.
    pub stored_ref: Option<u64>,
}

impl Default for Record {
    fn default() -> Self {
        Self { uid: -1, user: String::new(), display: String::new(), expire: 0, lifetime: 0, stored_ref: None }
    }
}

impl Record {
    /// Active means a real user whose expiration has not arrived.
    /// At `now == expire` the record is already inactive.
    pub fn is_active(&self, now: i64) -> bool {
        self.uid >= 1 && now < self.expire
    }

    /// Clears identity fields. `stored_ref` is preserved so the stored row
    /// is reused rather than orphaned.
    pub fn purge(&mut self) {
        self.uid = -1;
        self.user.clear();
        self.display.clear();
        self.expire = 0;
        self.lifetime = 0;
    }
}

/// A reference-counted handle to a [`Record`].
///
/// Transfer aliases two sessions to one handle; a commit through either key
/// is then visible through both. Cloning shares, it never copies.
#[derive(Debug, Clone, Default)]
pub struct SharedRecord(Arc<Mutex<Record>>);

impl SharedRecord {
    /// Wraps a record in a fresh handle.
    pub fn new(record: Record) -> Self {
        Self(Arc::new(Mutex::new(record)))
    }

    /// Runs `f` with the record locked.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned (a thread panicked while holding it).
    /// Lock scopes here are short and never call user code, so poisoning
    /// indicates a bug worth dying for.
    #[allow(clippy::expect_used)]
    pub fn with<R>(&self, f: impl FnOnce(&mut Record) -> R) -> R {
        let mut guard = self.0.lock().expect("record mutex poisoned");
        f(&mut guard)
    }

    /// Copies the current record state out of the handle.
    pub fn snapshot(&self) -> Record {
        self.with(|record| record.clone())
    }

    /// True when both handles point at the same record.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// One client-visible session: a key bound to a record plus two
/// session-scoped annotations.
#[derive(Debug, Clone)]
pub struct Session {
    /// Client-supplied key; the broker never generates keys.
    pub key: String,
    /// Identity handle, possibly shared with other sessions.
    pub record: SharedRecord,
    /// Post-auth redirect target.
    pub redirect: Option<String>,
    /// Opaque client annotation.
    pub tag: Option<String>,
}

impl Session {
    /// Creates an inactive session under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            record: SharedRecord::new(Record::default()),
            redirect: None,
            tag: None,
        }
    }

    /// A session is active exactly when its record is.
    pub fn is_active(&self, now: i64) -> bool {
        self.record.with(|record| record.is_active(now))
    }

    /// Lazy purge: an expired session that still carries an identity is
    /// purged in place. Returns whether anything changed, so callers know
    /// to re-persist.
    pub fn check(&mut self, now: i64) -> bool {
        let stale = self.record.with(|record| record.uid >= 1 && !record.is_active(now));
        if stale {
            self.purge();
        }
        stale
    }

    /// Clears the record and both session-scoped annotations.
    pub fn purge(&mut self) {
        self.record.with(Record::purge);
        self.redirect = None;
        self.tag = None;
    }

    /// Applies request fields: `redirect` and `tag` land on the session,
    /// identity fields on the record. A `lifetime` without an explicit
    /// `expire` computes `expire = now + lifetime`.
    pub fn apply(&mut self, fields: &FieldSet, now: i64) {
        if let Some(redirect) = &fields.redirect {
            self.redirect = Some(redirect.clone());
        }
        if let Some(tag) = &fields.tag {
            self.tag = Some(tag.clone());
        }
        self.record.with(|record| {
            if let Some(uid) = fields.uid {
                record.uid = uid;
            }
            if let Some(user) = &fields.user {
                record.user = user.clone();
            }
            if let Some(display) = &fields.display {
                record.display = display.clone();
            }
            if let Some(lifetime) = fields.lifetime {
                record.lifetime = lifetime;
            }
            match (fields.expire, fields.lifetime) {
                (Some(expire), _) => record.expire = expire,
                (None, Some(lifetime)) => record.expire = now + i64::from(lifetime),
                (None, None) => {},
            }
        });
    }

    /// Snapshot for a record reply. The identity block is included only
    /// while the session is active.
    pub fn wire(&self, now: i64) -> SessionWire {
        let record = self.record.with(|record| {
            record.is_active(now).then(|| RecordWire {
                uid: record.uid,
                user: record.user.clone(),
                display: record.display.clone(),
                expire: record.expire,
                lifetime: record.lifetime,
            })
        });
        SessionWire {
            key: self.key.clone(),
            record,
            redirect: self.redirect.clone(),
            tag: self.tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn active_session() -> Session {
        let mut session = Session::new("abc");
        session.apply(
            &FieldSet {
                uid: Some(7),
                user: Some("bob".into()),
                display: Some("Bob".into()),
                lifetime: Some(60),
                ..FieldSet::default()
            },
            NOW,
        );
        session
    }

    #[test]
    fn new_session_is_inactive() {
        let session = Session::new("abc");
        assert!(!session.is_active(NOW));
        assert!(session.record.with(|r| r.stored_ref.is_none()));
    }

    #[test]
    fn activity_boundary_is_strict() {
        let session = active_session();
        assert!(session.is_active(NOW));
        assert!(session.is_active(NOW + 59));
        // Expiration instant itself is already inactive.
        assert!(!session.is_active(NOW + 60));
    }

    #[test]
    fn nonpositive_uid_is_never_active() {
        let mut session = active_session();
        session.record.with(|r| r.uid = 0);
        assert!(!session.is_active(NOW));
        session.record.with(|r| r.uid = -1);
        assert!(!session.is_active(NOW));
    }

    #[test]
    fn lifetime_without_expire_computes_expire() {
        let session = active_session();
        assert_eq!(session.record.with(|r| r.expire), NOW + 60);
        assert_eq!(session.record.with(|r| r.lifetime), 60);
    }

    #[test]
    fn explicit_expire_wins_over_lifetime() {
        let mut session = Session::new("abc");
        session.apply(
            &FieldSet {
                uid: Some(7),
                expire: Some(NOW + 5),
                lifetime: Some(600),
                ..FieldSet::default()
            },
            NOW,
        );
        assert_eq!(session.record.with(|r| r.expire), NOW + 5);
        assert_eq!(session.record.with(|r| r.lifetime), 600);
    }

    #[test]
    fn purge_clears_identity_but_keeps_stored_ref() {
        let mut session = active_session();
        session.redirect = Some("/home".into());
        session.tag = Some("web".into());
        session.record.with(|r| r.stored_ref = Some(42));

        session.purge();

        session.record.with(|r| {
            assert_eq!(r.uid, -1);
            assert!(r.user.is_empty());
            assert!(r.display.is_empty());
            assert_eq!(r.expire, 0);
            assert_eq!(r.lifetime, 0);
            assert_eq!(r.stored_ref, Some(42));
        });
        assert!(session.redirect.is_none());
        assert!(session.tag.is_none());
    }

    #[test]
    fn check_purges_expired_identity_once() {
        let mut session = active_session();
        assert!(!session.check(NOW), "active session must not purge");
        assert!(session.check(NOW + 60), "expired identity purges");
        assert!(!session.check(NOW + 60), "already purged, nothing to do");
    }

    #[test]
    fn aliased_handles_share_one_record() {
        let src = active_session();
        let mut dst = Session::new("def");
        dst.record = src.record.clone();
        assert!(dst.record.ptr_eq(&src.record));

        dst.record.with(|r| r.display = "Robert".into());
        assert_eq!(src.record.with(|r| r.display.clone()), "Robert");
    }

    #[test]
    fn wire_includes_identity_only_while_active() {
        let mut session = active_session();
        session.tag = Some("web".into());

        let live = session.wire(NOW);
        let record = live.record.unwrap();
        assert_eq!(record.uid, 7);
        assert_eq!(record.expire, NOW + 60);
        assert_eq!(live.tag.as_deref(), Some("web"));

        let dead = session.wire(NOW + 60);
        assert_eq!(dead.key, "abc");
        assert!(dead.record.is_none());
    }
}
