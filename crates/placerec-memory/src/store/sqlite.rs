//! SQLite-backed persistent store.
//!
//! # Storage layout
//!
//! | table            | key                                 | contents                          |
//! |------------------|-------------------------------------|-----------------------------------|
//! | `signatures`     | `id`                                | RFC-3339 timestamp, weight        |
//! | `payloads`       | `signature_id`                      | image BLOB, actions as JSON       |
//! | `words`          | `id`                                | little-endian f32 descriptor BLOB |
//! | `word_citations` | `(word_id, signature_id)`           | which saved signature cites which word |
//! | `neighbor_links` | `(signature_id, neighbor_id)`       | link payload as JSON              |
//! | `loop_links`     | `(signature_id, matched_id, kind)`  | `kind` is `loop` or `child`       |
//! | `keypoints`      | `signature_id`                      | `(word_id, x, y)` per observation |
//! | `sequences`      | `name`                              | high-water marks of id allocation |
//!
//! Word references are derived from `word_citations`, which is written
//! from saved signatures only. The `sequences` table keeps the largest id
//! ever saved so that pruning the newest words never lets an id be reused.
//!
//! With [`SqliteOptions::in_memory`] the database file is copied into RAM
//! on connect and written back on disconnect (or drop).
//!
//! # Example
//!
//! ```rust
//! use placerec_memory::signature::Signature;
//! use placerec_memory::store::{PersistentStore, SqliteStore};
//! use placerec_types::{Keypoint, SensorPayload, SignatureId, WordId};
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! let mut sig = Signature::new(SignatureId(1), chrono::Utc::now(), SensorPayload::default());
//! sig.add_word(WordId(3), Keypoint::new(10.0, 20.0));
//! store.save(&[sig], &[]).unwrap();
//!
//! let back = store.load(SignatureId(1)).unwrap().unwrap();
//! assert!(back.words.contains_key(&WordId(3)));
//! assert_eq!(store.last_signature_id().unwrap(), SignatureId(1));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use placerec_perception::VisualWord;
use placerec_types::{Keypoint, Residency, SensorPayload, SignatureId, WordId};
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::{LinkSets, PersistentStore, StoreError};
use crate::signature::{NeighborLink, Signature};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Connection pragmas applied on every [`connect`][PersistentStore::connect].
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteOptions {
    pub journal_mode: String,
    /// Page cache size, in pages.
    pub cache_size: i64,
    pub synchronous: String,
    pub temp_store: String,
    /// Work on a RAM copy of the database file.
    pub in_memory: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".to_string(),
            cache_size: 10_000,
            synchronous: "NORMAL".to_string(),
            temp_store: "MEMORY".to_string(),
            in_memory: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn descriptor_to_bytes(descriptor: &[f32]) -> Vec<u8> {
    descriptor.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_descriptor(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn weight_from_column(id: SignatureId, weight: i64) -> Result<u32, StoreError> {
    u32::try_from(weight).map_err(|_| StoreError::Corrupt {
        table: "signatures",
        details: format!("signature {id}: weight {weight} out of range"),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS signatures (
        id        INTEGER NOT NULL PRIMARY KEY,
        timestamp TEXT    NOT NULL,
        weight    INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS payloads (
        signature_id INTEGER NOT NULL PRIMARY KEY,
        image        BLOB    NOT NULL,
        actions      TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS words (
        id         INTEGER NOT NULL PRIMARY KEY,
        descriptor BLOB    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS word_citations (
        word_id      INTEGER NOT NULL,
        signature_id INTEGER NOT NULL,
        PRIMARY KEY (word_id, signature_id)
    );
    CREATE INDEX IF NOT EXISTS word_citations_by_signature
        ON word_citations (signature_id);
    CREATE TABLE IF NOT EXISTS neighbor_links (
        signature_id INTEGER NOT NULL,
        neighbor_id  INTEGER NOT NULL,
        payload      TEXT    NOT NULL,
        PRIMARY KEY (signature_id, neighbor_id)
    );
    CREATE TABLE IF NOT EXISTS loop_links (
        signature_id INTEGER NOT NULL,
        matched_id   INTEGER NOT NULL,
        kind         TEXT    NOT NULL CHECK (kind IN ('loop', 'child')),
        PRIMARY KEY (signature_id, matched_id, kind)
    );
    CREATE TABLE IF NOT EXISTS keypoints (
        signature_id INTEGER NOT NULL,
        word_id      INTEGER NOT NULL,
        x            REAL    NOT NULL,
        y            REAL    NOT NULL
    );
    CREATE INDEX IF NOT EXISTS keypoints_by_signature ON keypoints (signature_id);
    CREATE INDEX IF NOT EXISTS keypoints_by_word ON keypoints (word_id);
    CREATE TABLE IF NOT EXISTS sequences (
        name  TEXT    NOT NULL PRIMARY KEY,
        value INTEGER NOT NULL
    );";

/// An open connection, plus the file to write it back to in in-memory mode.
struct Session {
    conn: Connection,
    backing: Option<PathBuf>,
}

impl Session {
    fn open(location: &str, in_memory: bool) -> Result<Self, StoreError> {
        if location == ":memory:" {
            return Ok(Self {
                conn: Connection::open_in_memory()?,
                backing: None,
            });
        }
        if !in_memory {
            return Ok(Self {
                conn: Connection::open(location)?,
                backing: None,
            });
        }
        let mut conn = Connection::open_in_memory()?;
        if Path::new(location).exists() {
            conn.restore(DatabaseName::Main, location, None::<fn(Progress)>)?;
            info!(location, "database loaded into memory");
        }
        Ok(Self {
            conn,
            backing: Some(PathBuf::from(location)),
        })
    }

    fn close(self) -> Result<(), StoreError> {
        if let Some(path) = &self.backing {
            self.conn.backup(DatabaseName::Main, path, None)?;
            info!(location = %path.display(), "in-memory database written back");
        }
        self.conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }
}

/// SQLite-backed [`PersistentStore`].
///
/// The connection lives behind a mutex; a store created with
/// [`SqliteStore::new`] starts disconnected.
pub struct SqliteStore {
    options: SqliteOptions,
    conn: Mutex<Option<Session>>,
}

impl SqliteStore {
    /// A disconnected store that will apply `options` on connect.
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            conn: Mutex::new(None),
        }
    }

    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::open_with(path, SqliteOptions::default())
    }

    /// Open `path` with explicit pragmas.
    pub fn open_with(path: &str, options: SqliteOptions) -> Result<Self, StoreError> {
        let store = Self::new(options);
        store.connect(path)?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(StoreError::NotConnected)?;
        f(&mut session.conn)
    }

    fn apply_pragmas(&self, conn: &Connection) -> Result<(), StoreError> {
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            &self.options.journal_mode,
            |row| row.get(0),
        )?;
        conn.pragma_update(None, "cache_size", self.options.cache_size)?;
        conn.pragma_update(None, "synchronous", &self.options.synchronous)?;
        conn.pragma_update(None, "temp_store", &self.options.temp_store)?;
        debug!(journal_mode = %mode, "sqlite pragmas applied");
        Ok(())
    }
}

fn bump_sequence(conn: &Connection, name: &str, value: u64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
        params![name, value as i64],
    )?;
    Ok(())
}

fn write_signature(conn: &Connection, sig: &Signature) -> Result<(), StoreError> {
    let id = sig.id.0 as i64;
    conn.execute(
        "INSERT INTO signatures (id, timestamp, weight) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET timestamp = excluded.timestamp, weight = excluded.weight",
        params![id, sig.timestamp.to_rfc3339(), sig.weight as i64],
    )?;

    for table in ["payloads", "word_citations", "neighbor_links", "loop_links", "keypoints"] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE signature_id = ?1"),
            params![id],
        )?;
    }

    conn.execute(
        "INSERT INTO payloads (signature_id, image, actions) VALUES (?1, ?2, ?3)",
        params![id, sig.payload.image, serde_json::to_string(&sig.payload.actions)?],
    )?;

    let mut cite = conn.prepare_cached(
        "INSERT OR IGNORE INTO word_citations (word_id, signature_id) VALUES (?1, ?2)",
    )?;
    let mut keypoint = conn.prepare_cached(
        "INSERT INTO keypoints (signature_id, word_id, x, y) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (word, kps) in &sig.words {
        cite.execute(params![word.0 as i64, id])?;
        for kp in kps {
            keypoint.execute(params![id, word.0 as i64, kp.x as f64, kp.y as f64])?;
        }
    }

    let mut neighbor = conn.prepare_cached(
        "INSERT INTO neighbor_links (signature_id, neighbor_id, payload) VALUES (?1, ?2, ?3)",
    )?;
    for (other, link) in &sig.neighbors {
        neighbor.execute(params![id, other.0 as i64, serde_json::to_string(link)?])?;
    }

    let mut looped = conn.prepare_cached(
        "INSERT OR IGNORE INTO loop_links (signature_id, matched_id, kind) VALUES (?1, ?2, ?3)",
    )?;
    for other in &sig.loop_links {
        looped.execute(params![id, other.0 as i64, "loop"])?;
    }
    for other in &sig.child_links {
        looped.execute(params![id, other.0 as i64, "child"])?;
    }
    Ok(())
}

fn read_signature(conn: &Connection, id: SignatureId) -> Result<Option<Signature>, StoreError> {
    let key = id.0 as i64;
    let head: Option<(String, i64)> = conn
        .query_row(
            "SELECT timestamp, weight FROM signatures WHERE id = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((ts, weight)) = head else {
        return Ok(None);
    };
    let timestamp = ts
        .parse::<DateTime<Utc>>()
        .map_err(|e| StoreError::Corrupt {
            table: "signatures",
            details: format!("signature {id}: {e}"),
        })?;

    let payload = conn
        .query_row(
            "SELECT image, actions FROM payloads WHERE signature_id = ?1",
            params![key],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    let payload = match payload {
        Some((image, actions)) => SensorPayload {
            image,
            actions: serde_json::from_str(&actions)?,
        },
        None => SensorPayload::default(),
    };

    let mut sig = Signature::new(id, timestamp, payload);
    sig.weight = weight_from_column(id, weight)?;
    sig.residency = Residency::Persisted;

    let mut stmt = conn.prepare_cached(
        "SELECT word_id, x, y FROM keypoints WHERE signature_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![key], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
    })?;
    for row in rows {
        let (word, x, y) = row?;
        sig.add_word(WordId(word as u64), Keypoint::new(x as f32, y as f32));
    }
    // A citation without keypoints still counts as a word association.
    let mut stmt =
        conn.prepare_cached("SELECT word_id FROM word_citations WHERE signature_id = ?1")?;
    let rows = stmt.query_map(params![key], |row| row.get::<_, i64>(0))?;
    for row in rows {
        sig.words.entry(WordId(row? as u64)).or_default();
    }

    let mut stmt = conn
        .prepare_cached("SELECT neighbor_id, payload FROM neighbor_links WHERE signature_id = ?1")?;
    let rows = stmt.query_map(params![key], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (other, payload) = row?;
        let link: NeighborLink = serde_json::from_str(&payload)?;
        sig.neighbors.insert(SignatureId(other as u64), link);
    }

    let mut stmt =
        conn.prepare_cached("SELECT matched_id, kind FROM loop_links WHERE signature_id = ?1")?;
    let rows = stmt.query_map(params![key], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (other, kind) = row?;
        let other = SignatureId(other as u64);
        match kind.as_str() {
            "loop" => sig.loop_links.insert(other),
            "child" => sig.child_links.insert(other),
            _ => {
                return Err(StoreError::Corrupt {
                    table: "loop_links",
                    details: format!("unknown link kind `{kind}`"),
                });
            }
        };
    }
    Ok(Some(sig))
}

fn collect_ids(conn: &Connection, sql: &str, key: i64) -> Result<BTreeSet<SignatureId>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![key], |row| row.get::<_, i64>(0))?;
    let mut ids = BTreeSet::new();
    for row in rows {
        ids.insert(SignatureId(row? as u64));
    }
    Ok(ids)
}

impl PersistentStore for SqliteStore {
    fn connect(&self, location: &str) -> Result<(), StoreError> {
        self.disconnect()?;
        let session = Session::open(location, self.options.in_memory)?;
        self.apply_pragmas(&session.conn)?;
        session.conn.execute_batch(SCHEMA)?;
        *self.lock() = Some(session);
        info!(location, in_memory = self.options.in_memory, "store connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), StoreError> {
        let session = self.lock().take();
        if let Some(session) = session {
            session.close()?;
            info!("store disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    fn save(&self, signatures: &[Signature], words: &[VisualWord]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for sig in signatures {
                write_signature(&tx, sig)?;
            }
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO words (id, descriptor) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET descriptor = excluded.descriptor",
                )?;
                for word in words {
                    stmt.execute(params![word.id.0 as i64, descriptor_to_bytes(&word.descriptor)])?;
                }
            }
            if let Some(max) = signatures.iter().map(|s| s.id.0).max() {
                bump_sequence(&tx, "signature", max)?;
            }
            if let Some(max) = words.iter().map(|w| w.id.0).max() {
                bump_sequence(&tx, "word", max)?;
            }
            tx.commit()?;
            debug!(signatures = signatures.len(), words = words.len(), "saved to store");
            Ok(())
        })
    }

    fn load(&self, id: SignatureId) -> Result<Option<Signature>, StoreError> {
        self.with_conn(|conn| read_signature(conn, id))
    }

    fn load_words(&self, ids: &[WordId]) -> Result<Vec<VisualWord>, StoreError> {
        self.with_conn(|conn| {
            let mut words = Vec::with_capacity(ids.len());
            for &id in ids {
                let blob: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT descriptor FROM words WHERE id = ?1",
                        params![id.0 as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(blob) = blob else { continue };
                let mut word = VisualWord::new(id, bytes_to_descriptor(&blob));
                word.references = collect_ids(
                    conn,
                    "SELECT signature_id FROM word_citations WHERE word_id = ?1",
                    id.0 as i64,
                )?;
                words.push(word);
            }
            Ok(words)
        })
    }

    fn neighbor_ids(&self, id: SignatureId) -> Result<BTreeSet<SignatureId>, StoreError> {
        self.with_conn(|conn| {
            collect_ids(
                conn,
                "SELECT neighbor_id FROM neighbor_links WHERE signature_id = ?1",
                id.0 as i64,
            )
        })
    }

    fn weight(&self, id: SignatureId) -> Result<Option<u32>, StoreError> {
        self.with_conn(|conn| {
            let weight: Option<i64> = conn
                .query_row(
                    "SELECT weight FROM signatures WHERE id = ?1",
                    params![id.0 as i64],
                    |row| row.get(0),
                )
                .optional()?;
            weight.map(|w| weight_from_column(id, w)).transpose()
        })
    }

    fn loop_and_child_ids(&self, id: SignatureId) -> Result<LinkSets, StoreError> {
        self.with_conn(|conn| {
            let key = id.0 as i64;
            let loops = collect_ids(
                conn,
                "SELECT matched_id FROM loop_links WHERE signature_id = ?1 AND kind = 'loop'",
                key,
            )?;
            let children = collect_ids(
                conn,
                "SELECT matched_id FROM loop_links WHERE signature_id = ?1 AND kind = 'child'",
                key,
            )?;
            Ok((loops, children))
        })
    }

    fn change_words_ref(&self, remap: &BTreeMap<WordId, WordId>) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (old, new) in remap {
                let (old, new) = (old.0 as i64, new.0 as i64);
                tx.execute(
                    "UPDATE keypoints SET word_id = ?2 WHERE word_id = ?1",
                    params![old, new],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO word_citations (word_id, signature_id)
                     SELECT ?2, signature_id FROM word_citations WHERE word_id = ?1",
                    params![old, new],
                )?;
                tx.execute(
                    "DELETE FROM word_citations WHERE word_id = ?1",
                    params![old],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn delete_words(&self, ids: &[WordId]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(max) = ids.iter().map(|w| w.0).max() {
                bump_sequence(&tx, "word", max)?;
            }
            for id in ids {
                tx.execute("DELETE FROM words WHERE id = ?1", params![id.0 as i64])?;
                tx.execute(
                    "DELETE FROM word_citations WHERE word_id = ?1",
                    params![id.0 as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn all_signature_ids(&self) -> Result<BTreeSet<SignatureId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id FROM signatures")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut ids = BTreeSet::new();
            for row in rows {
                ids.insert(SignatureId(row? as u64));
            }
            Ok(ids)
        })
    }

    fn last_signature_id(&self) -> Result<SignatureId, StoreError> {
        self.with_conn(|conn| {
            let last: i64 = conn.query_row(
                "SELECT MAX(COALESCE((SELECT MAX(id) FROM signatures), 0),
                            COALESCE((SELECT value FROM sequences WHERE name = 'signature'), 0))",
                [],
                |row| row.get(0),
            )?;
            Ok(SignatureId(last as u64))
        })
    }

    fn last_word_id(&self) -> Result<WordId, StoreError> {
        self.with_conn(|conn| {
            let last: i64 = conn.query_row(
                "SELECT MAX(COALESCE((SELECT MAX(id) FROM words), 0),
                            COALESCE((SELECT value FROM sequences WHERE name = 'word'), 0))",
                [],
                |row| row.get(0),
            )?;
            Ok(WordId(last as u64))
        })
    }

    fn highest_weighted(&self, count: usize) -> Result<Vec<(SignatureId, u32)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, weight FROM signatures ORDER BY weight DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![count as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut ranked = Vec::new();
            for row in rows {
                let (id, weight) = row?;
                let id = SignatureId(id as u64);
                ranked.push((id, weight_from_column(id, weight)?));
            }
            Ok(ranked)
        })
    }

    fn memory_footprint_bytes(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok((pages * size) as u64)
        })
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "store not closed cleanly");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sig(id: u64, words: &[(u64, f32, f32)]) -> Signature {
        let mut sig = Signature::new(SignatureId(id), Utc::now(), SensorPayload::default());
        for &(w, x, y) in words {
            sig.add_word(WordId(w), Keypoint::new(x, y));
        }
        sig
    }

    fn make_word(id: u64, descriptor: Vec<f32>) -> VisualWord {
        VisualWord::new(WordId(id), descriptor)
    }

    // ── descriptor round-trip ────────────────────────────────────────────────

    #[test]
    fn descriptor_bytes_roundtrip() {
        let original = vec![1.5f32, -0.25, 0.0, 42.0];
        assert_eq!(bytes_to_descriptor(&descriptor_to_bytes(&original)), original);
    }

    // ── connection ───────────────────────────────────────────────────────────

    #[test]
    fn disconnected_store_rejects_queries() {
        let store = SqliteStore::new(SqliteOptions::default());
        assert!(!store.is_connected());
        assert!(matches!(
            store.all_signature_ids(),
            Err(StoreError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_then_reconnect() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.is_connected());
        store.disconnect().unwrap();
        assert!(!store.is_connected());
        store.connect(":memory:").unwrap();
        assert!(store.is_connected());
    }

    // ── save / load ──────────────────────────────────────────────────────────

    #[test]
    fn save_load_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sig = make_sig(1, &[(3, 1.0, 2.0), (3, 4.0, 5.0), (7, 0.5, 0.5)]);
        sig.weight = 4;
        sig.link_neighbor(SignatureId(2), NeighborLink::new(vec![vec![0.1, 0.2]]));
        sig.loop_links.insert(SignatureId(9));
        sig.child_links.insert(SignatureId(0));
        sig.payload = SensorPayload {
            image: vec![0xff, 0xd8],
            actions: vec![vec![1.0, -1.0]],
        };
        store.save(&[sig.clone()], &[]).unwrap();

        let back = store.load(SignatureId(1)).unwrap().unwrap();
        assert_eq!(back.words, sig.words);
        assert_eq!(back.neighbors, sig.neighbors);
        assert_eq!(back.weight, 4);
        assert_eq!(back.loop_links, sig.loop_links);
        assert_eq!(back.child_links, sig.child_links);
        assert_eq!(back.payload, sig.payload);
        assert_eq!(back.timestamp, sig.timestamp);
        assert_eq!(back.residency, Residency::Persisted);
    }

    #[test]
    fn load_unknown_id_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load(SignatureId(42)).unwrap().is_none());
        assert!(store.weight(SignatureId(42)).unwrap().is_none());
    }

    #[test]
    fn save_replaces_existing_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sig = make_sig(1, &[(3, 1.0, 1.0)]);
        sig.link_neighbor(SignatureId(2), NeighborLink::default());
        store.save(&[sig.clone()], &[]).unwrap();

        sig.words.clear();
        sig.add_word(WordId(4), Keypoint::new(0.0, 0.0));
        sig.neighbors.clear();
        sig.weight = 2;
        store.save(&[sig], &[]).unwrap();

        let back = store.load(SignatureId(1)).unwrap().unwrap();
        assert_eq!(back.word_ids(), BTreeSet::from([WordId(4)]));
        assert!(back.neighbors.is_empty());
        assert_eq!(store.weight(SignatureId(1)).unwrap(), Some(2));
    }

    // ── words ────────────────────────────────────────────────────────────────

    #[test]
    fn word_references_come_from_saved_signatures() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = make_sig(1, &[(5, 0.0, 0.0)]);
        let b = make_sig(2, &[(5, 1.0, 1.0), (6, 2.0, 2.0)]);
        store
            .save(&[a, b], &[make_word(5, vec![0.5, 0.5]), make_word(6, vec![1.0, 0.0])])
            .unwrap();

        let words = store.load_words(&[WordId(5), WordId(6), WordId(99)]).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].descriptor, vec![0.5, 0.5]);
        assert_eq!(
            words[0].references,
            BTreeSet::from([SignatureId(1), SignatureId(2)])
        );
        assert_eq!(words[1].references, BTreeSet::from([SignatureId(2)]));
    }

    #[test]
    fn change_words_ref_rewrites_citations() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = make_sig(1, &[(5, 0.0, 0.0)]);
        let b = make_sig(2, &[(6, 1.0, 1.0)]);
        store
            .save(&[a, b], &[make_word(5, vec![0.0]), make_word(6, vec![0.1])])
            .unwrap();

        store
            .change_words_ref(&BTreeMap::from([(WordId(6), WordId(5))]))
            .unwrap();

        let b = store.load(SignatureId(2)).unwrap().unwrap();
        assert_eq!(b.word_ids(), BTreeSet::from([WordId(5)]));
        let words = store.load_words(&[WordId(5), WordId(6)]).unwrap();
        assert_eq!(
            words[0].references,
            BTreeSet::from([SignatureId(1), SignatureId(2)])
        );
        assert!(words[1].references.is_empty());
    }

    #[test]
    fn deleted_word_ids_are_not_reused() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save(&[], &[make_word(1, vec![0.0]), make_word(2, vec![1.0])])
            .unwrap();
        store.delete_words(&[WordId(2)]).unwrap();
        assert!(store.load_words(&[WordId(2)]).unwrap().is_empty());
        assert_eq!(store.last_word_id().unwrap(), WordId(2));
    }

    // ── queries ──────────────────────────────────────────────────────────────

    #[test]
    fn link_queries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sig = make_sig(3, &[]);
        sig.link_neighbor(SignatureId(2), NeighborLink::default());
        sig.link_neighbor(SignatureId(4), NeighborLink::default());
        sig.loop_links.insert(SignatureId(10));
        sig.child_links.insert(SignatureId(1));
        store.save(&[sig], &[]).unwrap();

        assert_eq!(
            store.neighbor_ids(SignatureId(3)).unwrap(),
            BTreeSet::from([SignatureId(2), SignatureId(4)])
        );
        let (loops, children) = store.loop_and_child_ids(SignatureId(3)).unwrap();
        assert_eq!(loops, BTreeSet::from([SignatureId(10)]));
        assert_eq!(children, BTreeSet::from([SignatureId(1)]));
        assert_eq!(
            store.loop_and_child_ids(SignatureId(99)).unwrap(),
            (BTreeSet::new(), BTreeSet::new())
        );
    }

    #[test]
    fn highest_weighted_orders_by_weight_then_newest() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sigs: Vec<Signature> = [(1, 5), (2, 1), (3, 5), (4, 0)]
            .iter()
            .map(|&(id, w)| {
                let mut s = make_sig(id, &[]);
                s.weight = w;
                s
            })
            .collect();
        store.save(&sigs, &[]).unwrap();
        assert_eq!(
            store.highest_weighted(3).unwrap(),
            vec![(SignatureId(3), 5), (SignatureId(1), 5), (SignatureId(2), 1)]
        );
    }

    #[test]
    fn out_of_range_weight_is_corrupt() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&[make_sig(1, &[])], &[]).unwrap();
        store
            .with_conn(|conn| {
                conn.execute("UPDATE signatures SET weight = -3 WHERE id = 1", [])?;
                Ok(())
            })
            .unwrap();

        for err in [
            store.load(SignatureId(1)).unwrap_err(),
            store.weight(SignatureId(1)).unwrap_err(),
            store.highest_weighted(1).unwrap_err(),
        ] {
            assert!(matches!(err, StoreError::Corrupt { table: "signatures", .. }));
        }
    }

    #[test]
    fn last_ids_on_empty_store_are_zero() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.last_signature_id().unwrap(), SignatureId(0));
        assert_eq!(store.last_word_id().unwrap(), WordId(0));
        assert!(store.memory_footprint_bytes().unwrap() > 0);
    }

    // ── persistence ──────────────────────────────────────────────────────────

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStore::open(path).unwrap();
            store
                .save(&[make_sig(7, &[(1, 0.0, 0.0)])], &[make_word(1, vec![0.3])])
                .unwrap();
            store.disconnect().unwrap();
        }
        let store = SqliteStore::open(path).unwrap();
        assert_eq!(store.last_signature_id().unwrap(), SignatureId(7));
        assert_eq!(store.last_word_id().unwrap(), WordId(1));
        assert!(store.load(SignatureId(7)).unwrap().is_some());
    }

    #[test]
    fn in_memory_mode_loads_the_file_and_writes_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStore::open(path).unwrap();
            store.save(&[make_sig(1, &[])], &[]).unwrap();
        }

        let options = SqliteOptions {
            in_memory: true,
            ..SqliteOptions::default()
        };
        let store = SqliteStore::open_with(path, options).unwrap();
        assert!(store.load(SignatureId(1)).unwrap().is_some());
        store.save(&[make_sig(2, &[])], &[]).unwrap();
        {
            let on_disk = SqliteStore::open(path).unwrap();
            assert!(on_disk.load(SignatureId(2)).unwrap().is_none());
        }

        store.disconnect().unwrap();
        let on_disk = SqliteStore::open(path).unwrap();
        assert_eq!(
            on_disk.all_signature_ids().unwrap(),
            BTreeSet::from([SignatureId(1), SignatureId(2)])
        );
    }

    #[test]
    fn in_memory_mode_writes_back_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");
        let path = path.to_str().unwrap();
        let options = SqliteOptions {
            in_memory: true,
            ..SqliteOptions::default()
        };
        {
            let store = SqliteStore::open_with(path, options).unwrap();
            store.save(&[make_sig(5, &[])], &[]).unwrap();
            assert!(!Path::new(path).exists());
        }
        let on_disk = SqliteStore::open(path).unwrap();
        assert_eq!(on_disk.last_signature_id().unwrap(), SignatureId(5));
    }
}
