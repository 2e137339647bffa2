//! Append-only, hash-chained state store
//!
//! Durable atop a single-file SQLite database. Reads come from an
//! in-memory mirror and run concurrently; commits serialize through the
//! connection lock. Every mutation appends a [`Change`] whose hash
//! chains to its predecessor, which is what lets replicas detect
//! divergence.
//!
//! Subscriber delivery is fan-out with a bounded queue per subscriber;
//! a slow subscriber is dropped with a warning, never the producer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use flywall_common::{Clock, Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::change::{Change, ChangeType, Entry, Snapshot};

/// Current on-disk schema version.
const SCHEMA_VERSION: i64 = 2;

/// Per-subscriber queue depth before the subscriber is dropped.
const SUBSCRIBER_QUEUE: usize = 256;

fn db_err(e: rusqlite::Error) -> Error {
    Error::internal(format!("state store: {e}")).with_attr("source", "sqlite")
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Change>,
}

/// Stream of committed changes, in commit order.
pub struct ChangeStream {
    pub(crate) id: u64,
    rx: mpsc::Receiver<Change>,
}

impl ChangeStream {
    /// Next change, or `None` once the subscription was dropped.
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by synchronous callers.
    pub fn try_recv(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Versioned KV with buckets, change log and snapshots.
pub struct StateStore {
    conn: Mutex<Connection>,
    mirror: DashMap<(String, String), Entry>,
    buckets: DashMap<String, ()>,
    version: AtomicU64,
    head_hash: Mutex<String>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_sub_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    /// Open (and migrate) the store at `path`.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::init(conn, clock)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS buckets (name TEXT PRIMARY KEY);
             CREATE TABLE IF NOT EXISTS entries (
                 bucket TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value TEXT NOT NULL,
                 version INTEGER NOT NULL,
                 PRIMARY KEY (bucket, key)
             );
             CREATE TABLE IF NOT EXISTS changes (
                 version INTEGER PRIMARY KEY,
                 bucket TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value TEXT NOT NULL,
                 change_type TEXT NOT NULL,
                 timestamp INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS snapshots (
                 version INTEGER PRIMARY KEY,
                 timestamp INTEGER NOT NULL,
                 hash TEXT NOT NULL
             );",
        )
        .map_err(db_err)?;

        migrate_hash_column(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            mirror: DashMap::new(),
            buckets: DashMap::new(),
            version: AtomicU64::new(0),
            head_hash: Mutex::new(String::new()),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            clock,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let conn = self.conn.lock();

        {
            let mut stmt = conn
                .prepare("SELECT name FROM buckets")
                .map_err(db_err)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            for name in names {
                self.buckets.insert(name.map_err(db_err)?, ());
            }
        }

        {
            let mut stmt = conn
                .prepare("SELECT bucket, key, value, version FROM entries")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(db_err)?;
            for row in rows {
                let (bucket, key, value, version) = row.map_err(db_err)?;
                self.mirror.insert(
                    (bucket, key),
                    Entry {
                        value,
                        version: version as u64,
                    },
                );
            }
        }

        let change_head: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, hash FROM changes ORDER BY version DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let snapshot_head: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, hash FROM snapshots ORDER BY version DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        let (version, hash) = match (change_head, snapshot_head) {
            (Some((cv, ch)), Some((sv, sh))) => {
                if cv >= sv {
                    (cv, ch)
                } else {
                    (sv, sh)
                }
            }
            (Some((cv, ch)), None) => (cv, ch),
            (None, Some((sv, sh))) => (sv, sh),
            (None, None) => (0, String::new()),
        };
        self.version.store(version as u64, Ordering::SeqCst);
        *self.head_hash.lock() = hash;
        debug!(version, entries = self.mirror.len(), "state store loaded");
        Ok(())
    }

    /// Highest successfully committed version.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Chain hash of the newest change (empty before the first one).
    pub fn head_hash(&self) -> String {
        self.head_hash.lock().clone()
    }

    /// Chain hash recorded for a version, if retained.
    pub fn hash_at(&self, version: u64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT hash FROM changes WHERE version = ?1",
            params![version as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Create a bucket. Idempotent; bucket creation emits no change.
    pub fn create_bucket(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
            params![name],
        )
        .map_err(db_err)?;
        self.buckets.insert(name.to_string(), ());
        Ok(())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Write a value. Appends an Insert or Update change.
    pub fn put(&self, bucket: &str, key: &str, value: &str) -> Result<Change> {
        let change_type = if self
            .mirror
            .contains_key(&(bucket.to_string(), key.to_string()))
        {
            ChangeType::Update
        } else {
            ChangeType::Insert
        };
        self.commit_change(bucket, key, value, change_type)
    }

    /// Read a value with its last-writer version.
    pub fn get(&self, bucket: &str, key: &str) -> Option<Entry> {
        self.mirror
            .get(&(bucket.to_string(), key.to_string()))
            .map(|e| e.value().clone())
    }

    /// Delete a key. Returns `false` (and emits nothing) when absent.
    pub fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        if !self
            .mirror
            .contains_key(&(bucket.to_string(), key.to_string()))
        {
            return Ok(false);
        }
        self.commit_change(bucket, key, "", ChangeType::Delete)?;
        Ok(true)
    }

    /// All entries in a bucket, sorted by key.
    pub fn list(&self, bucket: &str) -> Vec<(String, Entry)> {
        let mut out: Vec<(String, Entry)> = self
            .mirror
            .iter()
            .filter(|e| e.key().0 == bucket)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Write only if the entry's current version matches `expected`
    /// (0 = the key must not exist yet).
    pub fn compare_and_set(
        &self,
        bucket: &str,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<Change> {
        // The conn lock serializes the check against other commits.
        let mut conn = self.conn.lock();
        let actual = self
            .mirror
            .get(&(bucket.to_string(), key.to_string()))
            .map(|e| e.version)
            .unwrap_or(0);
        if actual != expected_version {
            return Err(Error::conflict("version mismatch")
                .with_attr("bucket", bucket)
                .with_attr("key", key)
                .with_attr("expected", expected_version)
                .with_attr("actual", actual));
        }
        let change_type = if expected_version == 0 {
            ChangeType::Insert
        } else {
            ChangeType::Update
        };
        self.commit_change_locked(&mut conn, bucket, key, value, change_type)
    }

    /// Changes strictly greater than `version`, ascending.
    pub fn get_changes_since(&self, version: u64) -> Result<Vec<Change>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT version, bucket, key, value, change_type, timestamp, hash
                 FROM changes WHERE version > ?1 ORDER BY version ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![version as i64], row_to_change)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    /// Subscribe to future changes. Delivery is ordered; a subscriber
    /// whose queue overflows is dropped.
    pub fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push(Subscriber { id, tx });
        debug!(subscriber = id, "change subscriber registered");
        ChangeStream { id, rx }
    }

    /// Drop a subscription registration explicitly.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Materialize the full store at the current version.
    pub fn create_snapshot(&self) -> Result<Snapshot> {
        // Holding the commit lock makes the mirror read consistent.
        let conn = self.conn.lock();
        let mut buckets: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for name in self.buckets.iter() {
            buckets.entry(name.key().clone()).or_default();
        }
        for entry in self.mirror.iter() {
            let (bucket, key) = entry.key();
            buckets
                .entry(bucket.clone())
                .or_default()
                .insert(key.clone(), entry.value().value.clone());
        }
        let snapshot = Snapshot {
            version: self.version.load(Ordering::SeqCst),
            buckets,
            timestamp_ns: self.clock.now_ns(),
            hash: self.head_hash.lock().clone(),
        };
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (version, timestamp, hash) VALUES (?1, ?2, ?3)",
            params![
                snapshot.version as i64,
                snapshot.timestamp_ns as i64,
                snapshot.hash
            ],
        )
        .map_err(db_err)?;
        Ok(snapshot)
    }

    /// Replace all local state with a snapshot.
    ///
    /// Transactional: on failure the store is unchanged. Restored
    /// entries emit no changes.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM entries", []).map_err(db_err)?;
        tx.execute("DELETE FROM changes", []).map_err(db_err)?;
        tx.execute("DELETE FROM buckets", []).map_err(db_err)?;
        for (bucket, entries) in &snapshot.buckets {
            tx.execute(
                "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
                params![bucket],
            )
            .map_err(db_err)?;
            for (key, value) in entries {
                tx.execute(
                    "INSERT INTO entries (bucket, key, value, version) VALUES (?1, ?2, ?3, ?4)",
                    params![bucket, key, value, snapshot.version as i64],
                )
                .map_err(db_err)?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (version, timestamp, hash) VALUES (?1, ?2, ?3)",
            params![
                snapshot.version as i64,
                snapshot.timestamp_ns as i64,
                snapshot.hash
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        self.mirror.clear();
        self.buckets.clear();
        for (bucket, entries) in &snapshot.buckets {
            self.buckets.insert(bucket.clone(), ());
            for (key, value) in entries {
                self.mirror.insert(
                    (bucket.clone(), key.clone()),
                    Entry {
                        value: value.clone(),
                        version: snapshot.version,
                    },
                );
            }
        }
        self.version.store(snapshot.version, Ordering::SeqCst);
        *self.head_hash.lock() = snapshot.hash.clone();
        info!(version = snapshot.version, "snapshot restored");
        Ok(())
    }

    /// Apply a change committed elsewhere, verifying the hash chain.
    ///
    /// The provided version is persisted as-is. A version gap or hash
    /// mismatch is a [`Divergence`](flywall_common::Kind::Divergence)
    /// error; the caller requests a full snapshot.
    pub fn apply_replicated_change(&self, change: &Change) -> Result<()> {
        let mut conn = self.conn.lock();
        let current = self.version.load(Ordering::SeqCst);
        if change.version <= current {
            debug!(
                version = change.version,
                current, "stale replicated change skipped"
            );
            return Ok(());
        }
        if change.version != current + 1 {
            metrics::counter!("flywall_store_divergence_total").increment(1);
            return Err(Error::divergence("replicated change out of order")
                .with_attr("expected", current + 1)
                .with_attr("actual", change.version));
        }
        let prev_hash = self.head_hash.lock().clone();
        if !change.verifies_against(&prev_hash) {
            metrics::counter!("flywall_store_divergence_total").increment(1);
            return Err(Error::divergence("hash chain mismatch")
                .with_attr("version", change.version)
                .with_attr("expected", change.chain_hash(&prev_hash))
                .with_attr("actual", &change.hash));
        }

        let tx = conn.transaction().map_err(db_err)?;
        persist_change(&tx, change)?;
        tx.commit().map_err(db_err)?;

        self.apply_to_mirror(change);
        self.version.store(change.version, Ordering::SeqCst);
        *self.head_hash.lock() = change.hash.clone();
        self.emit(change);
        Ok(())
    }

    /// Drop retained changes covered by the latest snapshot.
    pub fn compact(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let snapshot_version: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM snapshots", [], |row| row.get(0))
            .optional()
            .map_err(db_err)?
            .flatten();
        let Some(snapshot_version) = snapshot_version else {
            return Ok(0);
        };
        let removed = conn
            .execute(
                "DELETE FROM changes WHERE version <= ?1",
                params![snapshot_version],
            )
            .map_err(db_err)?;
        if removed > 0 {
            debug!(removed, snapshot_version, "change log compacted");
        }
        Ok(removed)
    }

    fn commit_change(
        &self,
        bucket: &str,
        key: &str,
        value: &str,
        change_type: ChangeType,
    ) -> Result<Change> {
        let mut conn = self.conn.lock();
        self.commit_change_locked(&mut conn, bucket, key, value, change_type)
    }

    fn commit_change_locked(
        &self,
        conn: &mut Connection,
        bucket: &str,
        key: &str,
        value: &str,
        change_type: ChangeType,
    ) -> Result<Change> {
        let version = self.version.load(Ordering::SeqCst) + 1;
        let prev_hash = self.head_hash.lock().clone();
        let mut change = Change {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            change_type,
            version,
            timestamp_ns: self.clock.now_ns(),
            hash: String::new(),
        };
        change.hash = change.chain_hash(&prev_hash);

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
            params![bucket],
        )
        .map_err(db_err)?;
        persist_change(&tx, &change)?;
        tx.commit().map_err(db_err)?;

        self.buckets.insert(bucket.to_string(), ());
        self.apply_to_mirror(&change);
        self.version.store(version, Ordering::SeqCst);
        *self.head_hash.lock() = change.hash.clone();
        metrics::counter!("flywall_store_commits_total").increment(1);
        self.emit(&change);
        Ok(change)
    }

    fn apply_to_mirror(&self, change: &Change) {
        let mkey = (change.bucket.clone(), change.key.clone());
        match change.change_type {
            ChangeType::Insert | ChangeType::Update => {
                self.mirror.insert(
                    mkey,
                    Entry {
                        value: change.value.clone(),
                        version: change.version,
                    },
                );
            }
            ChangeType::Delete => {
                self.mirror.remove(&mkey);
            }
        }
        self.buckets.insert(change.bucket.clone(), ());
    }

    fn emit(&self, change: &Change) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(change.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscriber = sub.id,
                    "slow change subscriber dropped after queue overflow"
                );
                metrics::counter!("flywall_store_subscribers_dropped_total").increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn persist_change(tx: &rusqlite::Transaction<'_>, change: &Change) -> Result<()> {
    tx.execute(
        "INSERT INTO changes (version, bucket, key, value, change_type, timestamp, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            change.version as i64,
            change.bucket,
            change.key,
            change.value,
            change.change_type.as_str(),
            change.timestamp_ns as i64,
            change.hash
        ],
    )
    .map_err(db_err)?;
    match change.change_type {
        ChangeType::Insert | ChangeType::Update => {
            tx.execute(
                "INSERT OR REPLACE INTO entries (bucket, key, value, version)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    change.bucket,
                    change.key,
                    change.value,
                    change.version as i64
                ],
            )
            .map_err(db_err)?;
        }
        ChangeType::Delete => {
            tx.execute(
                "DELETE FROM entries WHERE bucket = ?1 AND key = ?2",
                params![change.bucket, change.key],
            )
            .map_err(db_err)?;
        }
    }
    Ok(())
}

fn row_to_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<Change> {
    let change_type: String = row.get(4)?;
    Ok(Change {
        version: row.get::<_, i64>(0)? as u64,
        bucket: row.get(1)?,
        key: row.get(2)?,
        value: row.get(3)?,
        change_type: ChangeType::parse(&change_type).unwrap_or(ChangeType::Update),
        timestamp_ns: row.get::<_, i64>(5)? as u64,
        hash: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
    })
}

/// Add the `hash` column when missing and backfill the chain for rows
/// committed before hashing existed. Safe to run on every open.
fn migrate_hash_column(conn: &Connection) -> Result<()> {
    let mut has_hash = false;
    {
        let mut stmt = conn
            .prepare("PRAGMA table_info(changes)")
            .map_err(db_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(db_err)?;
        for name in names {
            if name.map_err(db_err)? == "hash" {
                has_hash = true;
            }
        }
    }
    if !has_hash {
        info!("state store migration: adding hash column to changes");
        conn.execute("ALTER TABLE changes ADD COLUMN hash TEXT", [])
            .map_err(db_err)?;
    }

    // Backfill missing hashes by walking the chain in version order.
    let mut rows = Vec::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT version, bucket, key, value, change_type, timestamp, hash
                 FROM changes ORDER BY version ASC",
            )
            .map_err(db_err)?;
        let mapped = stmt.query_map([], row_to_change).map_err(db_err)?;
        for row in mapped {
            rows.push(row.map_err(db_err)?);
        }
    }
    let mut prev_hash = String::new();
    let mut backfilled = 0usize;
    for mut change in rows {
        if change.hash.is_empty() {
            change.hash = change.chain_hash(&prev_hash);
            conn.execute(
                "UPDATE changes SET hash = ?1 WHERE version = ?2",
                params![change.hash, change.version as i64],
            )
            .map_err(db_err)?;
            backfilled += 1;
        }
        prev_hash = change.hash;
    }
    if backfilled > 0 {
        info!(backfilled, "state store migration: hash chain backfilled");
    }

    let has_version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_err)?;
    match has_version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .map_err(db_err)?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![SCHEMA_VERSION],
            )
            .map_err(db_err)?;
        }
        Some(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flywall_common::{Kind, Platform};

    fn store() -> StateStore {
        let (platform, _clock) = Platform::test("store-test");
        StateStore::open_in_memory(platform.clock).unwrap()
    }

    #[test]
    fn put_get_delete_round_trip() {
        let s = store();
        s.create_bucket("dhcp_leases").unwrap();
        let c1 = s.put("dhcp_leases", "192.168.1.50", r#"{"mac":"aa:bb"}"#).unwrap();
        assert_eq!(c1.version, 1);
        assert_eq!(c1.change_type, ChangeType::Insert);

        let entry = s.get("dhcp_leases", "192.168.1.50").unwrap();
        assert_eq!(entry.version, 1);

        let c2 = s.put("dhcp_leases", "192.168.1.50", r#"{"mac":"cc:dd"}"#).unwrap();
        assert_eq!(c2.change_type, ChangeType::Update);
        assert_eq!(s.current_version(), 2);

        assert!(s.delete("dhcp_leases", "192.168.1.50").unwrap());
        assert!(s.get("dhcp_leases", "192.168.1.50").is_none());
        assert!(!s.delete("dhcp_leases", "192.168.1.50").unwrap());
        assert_eq!(s.current_version(), 3);
    }

    #[test]
    fn hash_chain_links_every_change() {
        let s = store();
        for i in 0..5 {
            s.put("b", &format!("k{i}"), "v").unwrap();
        }
        let changes = s.get_changes_since(0).unwrap();
        assert_eq!(changes.len(), 5);
        let mut prev = String::new();
        for change in &changes {
            assert!(change.verifies_against(&prev), "chain broken at {}", change.version);
            prev = change.hash.clone();
        }
        assert_eq!(s.head_hash(), prev);
        assert_eq!(s.hash_at(3).unwrap().unwrap(), changes[2].hash);
    }

    #[test]
    fn compare_and_set_detects_conflicts() {
        let s = store();
        let c = s.compare_and_set("b", "k", 0, "v1").unwrap();
        assert_eq!(c.change_type, ChangeType::Insert);

        let err = s.compare_and_set("b", "k", 0, "v2").unwrap_err();
        assert_eq!(err.kind(), Kind::Conflict);
        assert_eq!(err.attr("expected"), Some("0"));

        s.compare_and_set("b", "k", c.version, "v2").unwrap();
        assert_eq!(s.get("b", "k").unwrap().value, "v2");
    }

    #[test]
    fn replicated_change_with_bad_hash_is_divergence() {
        let s = store();
        s.put("b", "k", "v").unwrap();

        let mut forged = Change {
            bucket: "b".into(),
            key: "k2".into(),
            value: "v2".into(),
            change_type: ChangeType::Insert,
            version: 2,
            timestamp_ns: 1,
            hash: "deadbeef".into(),
        };
        let err = s.apply_replicated_change(&forged).unwrap_err();
        assert_eq!(err.kind(), Kind::Divergence);

        // Fixing the hash makes it apply, with the provided version kept.
        forged.hash = forged.chain_hash(&s.head_hash());
        s.apply_replicated_change(&forged).unwrap();
        assert_eq!(s.current_version(), 2);
        assert_eq!(s.get("b", "k2").unwrap().version, 2);
    }

    #[test]
    fn replicated_version_gap_is_divergence() {
        let s = store();
        let c = Change {
            bucket: "b".into(),
            key: "k".into(),
            value: "v".into(),
            change_type: ChangeType::Insert,
            version: 5,
            timestamp_ns: 1,
            hash: String::new(),
        };
        let err = s.apply_replicated_change(&c).unwrap_err();
        assert_eq!(err.kind(), Kind::Divergence);
        assert_eq!(err.attr("expected"), Some("1"));
    }

    #[test]
    fn stale_replicated_change_is_skipped() {
        let s = store();
        let committed = s.put("b", "k", "v").unwrap();
        // Redelivery of an already-known version is a no-op.
        s.apply_replicated_change(&committed).unwrap();
        assert_eq!(s.current_version(), 1);
    }

    #[test]
    fn snapshot_restore_is_idempotent_and_silent() {
        let s = store();
        s.put("a", "k1", "v1").unwrap();
        s.put("b", "k2", "v2").unwrap();
        let snapshot = s.create_snapshot().unwrap();

        let target = store();
        let mut sub = target.subscribe();
        target.put("junk", "x", "y").unwrap();
        assert!(sub.try_recv().is_some());

        target.restore_snapshot(&snapshot).unwrap();
        assert_eq!(target.current_version(), snapshot.version);
        assert_eq!(target.get("a", "k1").unwrap().value, "v1");
        assert!(target.get("junk", "x").is_none());
        // Restores emit nothing.
        assert!(sub.try_recv().is_none());

        // Restoring again changes nothing.
        target.restore_snapshot(&snapshot).unwrap();
        assert_eq!(target.current_version(), snapshot.version);
        assert_eq!(target.list("a").len(), 1);
        assert_eq!(target.head_hash(), snapshot.hash);
    }

    #[test]
    fn restored_replica_keeps_verifying_the_chain() {
        let primary = store();
        primary.put("b", "k1", "v1").unwrap();
        primary.put("b", "k2", "v2").unwrap();
        let snapshot = primary.create_snapshot().unwrap();
        let after = primary.put("b", "k3", "v3").unwrap();

        let replica = store();
        replica.restore_snapshot(&snapshot).unwrap();
        replica.apply_replicated_change(&after).unwrap();
        assert_eq!(replica.current_version(), 3);
        assert_eq!(replica.head_hash(), primary.head_hash());
    }

    #[tokio::test]
    async fn subscribers_receive_in_commit_order() {
        let s = store();
        let mut sub = s.subscribe();
        s.put("b", "k1", "v1").unwrap();
        s.put("b", "k2", "v2").unwrap();
        assert_eq!(sub.recv().await.unwrap().version, 1);
        assert_eq!(sub.recv().await.unwrap().version, 2);
    }

    #[test]
    fn slow_subscriber_is_dropped_not_the_producer() {
        let s = store();
        let mut sub = s.subscribe();
        // Overflow the bounded queue without draining.
        for i in 0..(SUBSCRIBER_QUEUE + 10) {
            s.put("b", &format!("k{i}"), "v").unwrap();
        }
        assert_eq!(s.current_version() as usize, SUBSCRIBER_QUEUE + 10);
        // The subscriber got the first SUBSCRIBER_QUEUE changes, then
        // the stream ends.
        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn compaction_keeps_changes_after_snapshot() {
        let s = store();
        s.put("b", "k1", "v1").unwrap();
        s.put("b", "k2", "v2").unwrap();
        s.create_snapshot().unwrap();
        s.put("b", "k3", "v3").unwrap();

        let removed = s.compact().unwrap();
        assert_eq!(removed, 2);
        let remaining = s.get_changes_since(0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, 3);
    }

    #[test]
    fn migration_backfills_hash_chain() {
        let (platform, _clock) = Platform::test("migration-test");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        // A legacy database: changes table without a hash column.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE buckets (name TEXT PRIMARY KEY);
                 CREATE TABLE entries (
                     bucket TEXT NOT NULL, key TEXT NOT NULL,
                     value TEXT NOT NULL, version INTEGER NOT NULL,
                     PRIMARY KEY (bucket, key));
                 CREATE TABLE changes (
                     version INTEGER PRIMARY KEY, bucket TEXT NOT NULL,
                     key TEXT NOT NULL, value TEXT NOT NULL,
                     change_type TEXT NOT NULL, timestamp INTEGER NOT NULL);
                 INSERT INTO buckets VALUES ('b');
                 INSERT INTO changes VALUES (1, 'b', 'k1', 'v1', 'insert', 100);
                 INSERT INTO changes VALUES (2, 'b', 'k2', 'v2', 'insert', 200);
                 INSERT INTO entries VALUES ('b', 'k1', 'v1', 1);
                 INSERT INTO entries VALUES ('b', 'k2', 'v2', 2);",
            )
            .unwrap();
        }

        let s = StateStore::open(&path, platform.clock.clone()).unwrap();
        let changes = s.get_changes_since(0).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].verifies_against(""));
        assert!(changes[1].verifies_against(&changes[0].hash));
        let head = s.head_hash();
        drop(s);

        // Idempotent: a second open leaves the chain untouched.
        let s = StateStore::open(&path, platform.clock).unwrap();
        assert_eq!(s.head_hash(), head);
        assert_eq!(s.current_version(), 2);
    }

    #[test]
    fn reload_restores_version_and_entries() {
        let (platform, _clock) = Platform::test("reload-test");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let s = StateStore::open(&path, platform.clock.clone()).unwrap();
            s.put("b", "k", "v").unwrap();
            s.put("b", "k", "v2").unwrap();
        }
        let s = StateStore::open(&path, platform.clock).unwrap();
        assert_eq!(s.current_version(), 2);
        assert_eq!(s.get("b", "k").unwrap().value, "v2");
        assert_eq!(s.bucket_names(), vec!["b".to_string()]);
    }
}
