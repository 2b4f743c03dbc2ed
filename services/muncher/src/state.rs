//! Durable local state: per-publisher cursors and the two TTL caches.
//!
//! Cache reads are self-expiring: an entry older than 24 hours is deleted
//! on read and reported as a miss, so no stale-but-valid read is possible.
//! The change watcher force-expires a service entry by rewriting it with
//! `cached_at = 0`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");
const CACHE_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("Encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// A cached identity resolution for a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    pub signing_key: String,
    pub labeler_endpoint: Option<String>,
    pub cached_at: i64,
}

/// The durable state store, safe to share across tasks.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> StateResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StateResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(StateError::IntegrityCheckFailed(check));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cursors
    // -----------------------------------------------------------------------

    /// The last persisted sequence for `did`; 0 means full replay.
    pub fn cursor(&self, did: &str) -> StateResult<i64> {
        let conn = self.conn.lock().unwrap();
        let seq: Option<i64> = conn
            .query_row("SELECT seq FROM cursors WHERE did = ?1", params![did], |row| row.get(0))
            .optional()?;
        Ok(seq.unwrap_or(0))
    }

    /// Upsert the cursor; a regressing sequence is ignored so the stored
    /// cursor never decreases within a run.
    pub fn set_cursor(&self, did: &str, seq: i64) -> StateResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cursors (did, seq) VALUES (?1, ?2)
             ON CONFLICT(did) DO UPDATE SET seq = excluded.seq
             WHERE excluded.seq >= cursors.seq",
            params![did, seq],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Identity cache
    // -----------------------------------------------------------------------

    pub fn identity(&self, did: &str) -> StateResult<Option<CachedIdentity>> {
        self.identity_at(did, now_secs())
    }

    fn identity_at(&self, did: &str, now: i64) -> StateResult<Option<CachedIdentity>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<CachedIdentity> = conn
            .query_row(
                "SELECT signing_key, labeler_endpoint, cached_at FROM identity_cache WHERE did = ?1",
                params![did],
                |row| {
                    Ok(CachedIdentity {
                        signing_key: row.get(0)?,
                        labeler_endpoint: row.get(1)?,
                        cached_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        match row {
            Some(entry) if now - entry.cached_at > CACHE_TTL_SECS => {
                conn.execute("DELETE FROM identity_cache WHERE did = ?1", params![did])?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn set_identity(
        &self,
        did: &str,
        signing_key: &str,
        labeler_endpoint: Option<&str>,
    ) -> StateResult<()> {
        self.set_identity_at(did, signing_key, labeler_endpoint, now_secs())
    }

    fn set_identity_at(
        &self,
        did: &str,
        signing_key: &str,
        labeler_endpoint: Option<&str>,
        cached_at: i64,
    ) -> StateResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO identity_cache (did, signing_key, labeler_endpoint, cached_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![did, signing_key, labeler_endpoint, cached_at],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Service-policy cache
    // -----------------------------------------------------------------------

    /// The publisher's declared label values, if cached and current.
    pub fn service(&self, did: &str) -> StateResult<Option<Vec<String>>> {
        self.service_at(did, now_secs())
    }

    fn service_at(&self, did: &str, now: i64) -> StateResult<Option<Vec<String>>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT label_values, cached_at FROM service_cache WHERE did = ?1",
                params![did],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, cached_at)) if now - cached_at > CACHE_TTL_SECS => {
                conn.execute("DELETE FROM service_cache WHERE did = ?1", params![did])?;
                Ok(None)
            }
            Some((values, _)) => Ok(Some(serde_json::from_str(&values)?)),
            None => Ok(None),
        }
    }

    pub fn set_service(&self, did: &str, label_values: &[String]) -> StateResult<()> {
        self.set_service_at(did, label_values, now_secs())
    }

    fn set_service_at(
        &self,
        did: &str,
        label_values: &[String],
        cached_at: i64,
    ) -> StateResult<()> {
        let encoded = serde_json::to_string(label_values)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO service_cache (did, label_values, cached_at)
             VALUES (?1, ?2, ?3)",
            params![did, encoded, cached_at],
        )?;
        Ok(())
    }

    /// Force-expire the service entry for `did` so the next read misses.
    pub fn invalidate_service(&self, did: &str) -> StateResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE service_cache SET label_values = '[]', cached_at = 0 WHERE did = ?1",
            params![did],
        )?;
        Ok(())
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_defaults_to_zero_and_upserts() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.cursor("did:plc:a").unwrap(), 0);
        store.set_cursor("did:plc:a", 5).unwrap();
        store.set_cursor("did:plc:a", 9).unwrap();
        assert_eq!(store.cursor("did:plc:a").unwrap(), 9);
        assert_eq!(store.cursor("did:plc:other").unwrap(), 0);
    }

    #[test]
    fn cursor_never_regresses() {
        let store = Store::open_in_memory().unwrap();
        store.set_cursor("did:plc:a", 9).unwrap();
        store.set_cursor("did:plc:a", 3).unwrap();
        assert_eq!(store.cursor("did:plc:a").unwrap(), 9);
    }

    #[test]
    fn cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        {
            let store = Store::open(&path).unwrap();
            store.set_cursor("did:plc:a", 42).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.cursor("did:plc:a").unwrap(), 42);
    }

    #[test]
    fn identity_round_trips_within_ttl() {
        let store = Store::open_in_memory().unwrap();
        store.set_identity("did:plc:a", "zKey", Some("https://labeler.example")).unwrap();
        let entry = store.identity("did:plc:a").unwrap().unwrap();
        assert_eq!(entry.signing_key, "zKey");
        assert_eq!(entry.labeler_endpoint.as_deref(), Some("https://labeler.example"));
    }

    #[test]
    fn identity_older_than_ttl_is_deleted_on_read() {
        let store = Store::open_in_memory().unwrap();
        let stale = now_secs() - CACHE_TTL_SECS - 1;
        store.set_identity_at("did:plc:a", "zKey", None, stale).unwrap();
        assert!(store.identity("did:plc:a").unwrap().is_none());
        // The row is gone, not just filtered.
        assert!(store.identity_at("did:plc:a", stale).unwrap().is_none());
    }

    #[test]
    fn identity_exactly_at_ttl_is_still_served() {
        let store = Store::open_in_memory().unwrap();
        let now = now_secs();
        store.set_identity_at("did:plc:a", "zKey", None, now - CACHE_TTL_SECS).unwrap();
        assert!(store.identity_at("did:plc:a", now).unwrap().is_some());
    }

    #[test]
    fn service_round_trips_and_expires() {
        let store = Store::open_in_memory().unwrap();
        store.set_service("did:plc:a", &["spam".to_owned(), "scam".to_owned()]).unwrap();
        assert_eq!(store.service("did:plc:a").unwrap().unwrap(), vec!["spam", "scam"]);

        let stale = now_secs() - CACHE_TTL_SECS - 10;
        store.set_service_at("did:plc:b", &["spam".to_owned()], stale).unwrap();
        assert!(store.service("did:plc:b").unwrap().is_none());
    }

    #[test]
    fn invalidated_service_entry_reads_as_miss() {
        let store = Store::open_in_memory().unwrap();
        store.set_service("did:plc:a", &["spam".to_owned()]).unwrap();
        store.invalidate_service("did:plc:a").unwrap();
        assert!(store.service("did:plc:a").unwrap().is_none());
    }

    #[test]
    fn invalidating_absent_entry_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        store.invalidate_service("did:plc:missing").unwrap();
        assert!(store.service("did:plc:missing").unwrap().is_none());
    }

    #[test]
    fn empty_declared_values_are_distinct_from_miss() {
        let store = Store::open_in_memory().unwrap();
        store.set_service("did:plc:a", &[]).unwrap();
        assert_eq!(store.service("did:plc:a").unwrap().unwrap(), Vec::<String>::new());
    }
}
