use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::coordinator::Ticket;
use crate::domain::{CanonicalKey, DataType, LocalFormat};
use crate::error::TaigaError;
use crate::store::{Store, sha256_file};

const SCHEMA_VERSION: u32 = 1;
const META_KEY_SCHEMA_VERSION: &str = "schema_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Downloading,
    Complete,
    Corrupt,
}

impl EntryStatus {
    fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Downloading => "downloading",
            EntryStatus::Complete => "complete",
            EntryStatus::Corrupt => "corrupt",
        }
    }

    fn parse(value: &str) -> Result<Self, TaigaError> {
        match value {
            "downloading" => Ok(EntryStatus::Downloading),
            "complete" => Ok(EntryStatus::Complete),
            "corrupt" => Ok(EntryStatus::Corrupt),
            other => Err(TaigaError::Index(format!("unknown entry status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub path: Utf8PathBuf,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CanonicalKey,
    pub data_type: DataType,
    pub original_sha256: Option<String>,
    pub status: EntryStatus,
    pub representations: BTreeMap<LocalFormat, Representation>,
    pub created_at: String,
    pub updated_at: String,
}

impl CacheEntry {
    pub fn representation(&self, format: LocalFormat) -> Option<&Representation> {
        self.representations.get(&format)
    }

    pub fn stored(&self) -> Option<&Representation> {
        self.representation(self.data_type.stored_format())
    }
}

/// Proof that an entry was moved to `downloading`. Consumed by
/// [`LocalIndex::commit`] or [`LocalIndex::abort`].
#[derive(Debug)]
#[must_use = "a write token must be committed or aborted"]
pub struct WriteToken {
    key: CanonicalKey,
    data_type: DataType,
}

impl WriteToken {
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

/// Durable index of cache entries and of the reference links that lead to
/// them, backed by SQLite in WAL mode.
pub struct LocalIndex {
    conn: Mutex<Connection>,
    store: Store,
}

impl LocalIndex {
    pub fn open(store: Store) -> Result<Self, TaigaError> {
        store.ensure_layout()?;
        let path = store.index_path();
        let conn = Connection::open(path.as_std_path()).map_err(db)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db)?;
        init_schema(&conn)?;
        check_schema_version(&conn)?;

        let index = Self {
            conn: Mutex::new(conn),
            store,
        };
        let recovered = index.recover()?;
        let swept = index.store.sweep_temp()?;
        if recovered > 0 || swept > 0 {
            info!(recovered, swept, "cleaned up interrupted downloads");
        }
        debug!(path = %path, "opened cache index");
        Ok(index)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The complete entry for `key`. Entries in any other state are absent.
    pub fn lookup(&self, key: &CanonicalKey) -> Result<Option<CacheEntry>, TaigaError> {
        let conn = self.lock();
        let entry = load_entry(&conn, key)?;
        Ok(entry.filter(|entry| entry.status == EntryStatus::Complete))
    }

    pub fn status(&self, key: &CanonicalKey) -> Result<Option<EntryStatus>, TaigaError> {
        let conn = self.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM entries WHERE canonical_key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        status.as_deref().map(EntryStatus::parse).transpose()
    }

    pub fn lookup_virtual(&self, reference: &str) -> Result<Option<CanonicalKey>, TaigaError> {
        let conn = self.lock();
        let target: Option<String> = conn
            .query_row(
                "SELECT canonical_key FROM virtual_links WHERE reference = ?1",
                params![reference],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        target.map(|value| value.parse()).transpose()
    }

    pub fn put_virtual_link(&self, reference: &str, key: &CanonicalKey) -> Result<(), TaigaError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO virtual_links(reference, canonical_key, learned_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(reference) DO UPDATE SET
                canonical_key = excluded.canonical_key,
                learned_at = excluded.learned_at",
            params![reference, key.to_string(), now()],
        )
        .map_err(db)?;
        Ok(())
    }

    pub fn remove_virtual_link(&self, reference: &str) -> Result<bool, TaigaError> {
        let conn = self.lock();
        let removed = conn
            .execute(
                "DELETE FROM virtual_links WHERE reference = ?1",
                params![reference],
            )
            .map_err(db)?;
        Ok(removed > 0)
    }

    /// References that point at `key`, excluding its own self link.
    pub fn links_to(&self, key: &CanonicalKey) -> Result<Vec<String>, TaigaError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT reference FROM virtual_links
                 WHERE canonical_key = ?1 AND reference != ?1
                 ORDER BY reference",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![key.to_string()], |row| row.get::<_, String>(0))
            .map_err(db)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db)
    }

    /// Learned references starting with `prefix`, ordered.
    pub fn references_with_prefix(&self, prefix: &str) -> Result<Vec<String>, TaigaError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT reference FROM virtual_links
                 WHERE substr(reference, 1, length(?1)) = ?1
                 ORDER BY reference",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(db)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db)
    }

    /// Moves `ticket`'s key to `downloading`, replacing whatever was there.
    pub fn begin_write(
        &self,
        ticket: &Ticket<'_>,
        data_type: DataType,
        original_sha256: Option<&str>,
    ) -> Result<WriteToken, TaigaError> {
        let key = ticket.key();
        let timestamp = now();
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        tx.execute(
            "DELETE FROM entries WHERE canonical_key = ?1",
            params![key.to_string()],
        )
        .map_err(db)?;
        tx.execute(
            "INSERT INTO entries(canonical_key, permaname, version, file_name, data_type,
                                 original_sha256, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                key.to_string(),
                key.permaname(),
                key.version(),
                key.file_name(),
                data_type.as_str(),
                original_sha256,
                EntryStatus::Downloading.as_str(),
                timestamp,
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        debug!(key = %key, "entry downloading");
        Ok(WriteToken {
            key: key.clone(),
            data_type,
        })
    }

    /// Re-hashes the durably written artifacts and marks the entry complete.
    ///
    /// The stored representation must hash to `expected_sha256` when one is
    /// given. On mismatch the entry is invalidated and `CorruptDownload` is
    /// returned.
    pub fn commit(
        &self,
        token: WriteToken,
        expected_sha256: Option<&str>,
        formats: &[LocalFormat],
    ) -> Result<CacheEntry, TaigaError> {
        let stored_format = token.data_type.stored_format();
        let mut representations = BTreeMap::new();
        for format in formats.iter().copied().chain([stored_format]) {
            if representations.contains_key(&format) {
                continue;
            }
            let representation = match self.hash_artifact(&token.key, format) {
                Ok(representation) => representation,
                Err(err) => {
                    self.abort(token)?;
                    return Err(err);
                }
            };
            representations.insert(format, representation);
        }

        if let (Some(expected), Some(stored)) =
            (expected_sha256, representations.get(&stored_format))
            && !expected.eq_ignore_ascii_case(&stored.sha256)
        {
            let actual = stored.sha256.clone();
            self.mark_corrupt(&token.key)?;
            warn!(key = %token.key, expected, actual = %actual, "hash mismatch after download");
            let key = token.key.to_string();
            self.abort(token)?;
            return Err(TaigaError::CorruptDownload {
                key,
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }

        let timestamp = now();
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        for (format, representation) in &representations {
            upsert_representation(&tx, &token.key, *format, representation)?;
        }
        let updated = tx
            .execute(
                "UPDATE entries SET status = ?2, updated_at = ?3
                 WHERE canonical_key = ?1 AND status = ?4",
                params![
                    token.key.to_string(),
                    EntryStatus::Complete.as_str(),
                    timestamp,
                    EntryStatus::Downloading.as_str(),
                ],
            )
            .map_err(db)?;
        if updated != 1 {
            return Err(TaigaError::Index(format!(
                "{} is no longer downloading",
                token.key
            )));
        }
        tx.commit().map_err(db)?;

        let entry = load_entry(&conn, &token.key)?
            .ok_or_else(|| TaigaError::Index(format!("{} vanished after commit", token.key)))?;
        info!(key = %token.key, formats = entry.representations.len(), "entry complete");
        Ok(entry)
    }

    /// Returns the entry to absent.
    pub fn abort(&self, token: WriteToken) -> Result<(), TaigaError> {
        debug!(key = %token.key, "aborting write");
        self.invalidate(&token.key)
    }

    /// Records an artifact written after the entry was completed.
    pub fn add_representation(
        &self,
        key: &CanonicalKey,
        format: LocalFormat,
    ) -> Result<Representation, TaigaError> {
        let representation = self.hash_artifact(key, format)?;
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT status FROM entries WHERE canonical_key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        if exists.as_deref() != Some(EntryStatus::Complete.as_str()) {
            return Err(TaigaError::Index(format!("{key} is not a complete entry")));
        }
        upsert_representation(&tx, key, format, &representation)?;
        tx.execute(
            "UPDATE entries SET updated_at = ?2 WHERE canonical_key = ?1",
            params![key.to_string(), now()],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        debug!(key = %key, format = %format, "added representation");
        Ok(representation)
    }

    /// Drops one representation and its file; the entry stays complete.
    pub fn remove_representation(
        &self,
        key: &CanonicalKey,
        format: LocalFormat,
    ) -> Result<(), TaigaError> {
        {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM representations WHERE canonical_key = ?1 AND format = ?2",
                params![key.to_string(), format.as_str()],
            )
            .map_err(db)?;
        }
        self.store.remove_artifact(key, format)
    }

    /// Deletes the row and every backing file of `key`. Links are kept.
    pub fn invalidate(&self, key: &CanonicalKey) -> Result<(), TaigaError> {
        {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM entries WHERE canonical_key = ?1",
                params![key.to_string()],
            )
            .map_err(db)?;
        }
        self.store.remove_datafile_artifacts(key)?;
        debug!(key = %key, "invalidated entry");
        Ok(())
    }

    /// Removes every entry and link of a dataset version.
    pub fn invalidate_version(&self, permaname: &str, version: u32) -> Result<usize, TaigaError> {
        let prefix = format!("{permaname}.{version}/");
        let keys = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT canonical_key FROM entries WHERE permaname = ?1 AND version = ?2")
                .map_err(db)?;
            let rows = stmt
                .query_map(params![permaname, version], |row| row.get::<_, String>(0))
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)?
        };
        for raw in &keys {
            let key: CanonicalKey = raw.parse()?;
            self.invalidate(&key)?;
        }
        let conn = self.lock();
        conn.execute(
            "DELETE FROM virtual_links
             WHERE reference = ?1
                OR substr(reference, 1, length(?2)) = ?2
                OR substr(canonical_key, 1, length(?2)) = ?2",
            params![format!("{permaname}.{version}"), prefix],
        )
        .map_err(db)?;
        Ok(keys.len())
    }

    /// All complete entries, ordered by key.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, TaigaError> {
        let conn = self.lock();
        let keys = {
            let mut stmt = conn
                .prepare(
                    "SELECT canonical_key FROM entries WHERE status = ?1 ORDER BY canonical_key",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![EntryStatus::Complete.as_str()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)?
        };
        let mut entries = Vec::with_capacity(keys.len());
        for raw in keys {
            let key: CanonicalKey = raw.parse()?;
            if let Some(entry) = load_entry(&conn, &key)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Invalidates entries left `downloading` or `corrupt` by a previous
    /// process. Must only run when no fetch is in flight.
    pub fn recover(&self) -> Result<usize, TaigaError> {
        let keys = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT canonical_key FROM entries WHERE status != ?1")
                .map_err(db)?;
            let rows = stmt
                .query_map(params![EntryStatus::Complete.as_str()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)?
        };
        for raw in &keys {
            let key: CanonicalKey = raw.parse()?;
            warn!(key = %key, "discarding partial download");
            self.invalidate(&key)?;
        }
        Ok(keys.len())
    }

    /// Folds the WAL back into the database file.
    pub fn checkpoint(&self) -> Result<(), TaigaError> {
        let conn = self.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(db)
    }

    fn mark_corrupt(&self, key: &CanonicalKey) -> Result<(), TaigaError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE entries SET status = ?2, updated_at = ?3 WHERE canonical_key = ?1",
            params![key.to_string(), EntryStatus::Corrupt.as_str(), now()],
        )
        .map_err(db)?;
        Ok(())
    }

    fn hash_artifact(
        &self,
        key: &CanonicalKey,
        format: LocalFormat,
    ) -> Result<Representation, TaigaError> {
        let path = self.store.datafile_path(key, format);
        let size = fs::metadata(path.as_std_path())
            .map_err(|err| TaigaError::Filesystem(format!("{path}: {err}")))?
            .len();
        let sha256 = sha256_file(&path)?;
        Ok(Representation { path, sha256, size })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn init_schema(conn: &Connection) -> Result<(), TaigaError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS entries (
            canonical_key TEXT PRIMARY KEY,
            permaname TEXT NOT NULL,
            version INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            data_type TEXT NOT NULL,
            original_sha256 TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS entries_by_version ON entries(permaname, version);
        CREATE TABLE IF NOT EXISTS representations (
            canonical_key TEXT NOT NULL,
            format TEXT NOT NULL,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            size INTEGER NOT NULL,
            PRIMARY KEY(canonical_key, format),
            FOREIGN KEY(canonical_key) REFERENCES entries(canonical_key) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS virtual_links (
            reference TEXT PRIMARY KEY,
            canonical_key TEXT NOT NULL,
            learned_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS links_by_target ON virtual_links(canonical_key);
        "#,
    )
    .map_err(db)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
    )
    .map_err(db)?;
    Ok(())
}

fn check_schema_version(conn: &Connection) -> Result<(), TaigaError> {
    let found: String = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![META_KEY_SCHEMA_VERSION],
            |row| row.get(0),
        )
        .map_err(db)?;
    if found != SCHEMA_VERSION.to_string() {
        return Err(TaigaError::Index(format!(
            "unsupported index schema version {found} (expected {SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

fn load_entry(conn: &Connection, key: &CanonicalKey) -> Result<Option<CacheEntry>, TaigaError> {
    let row = conn
        .query_row(
            "SELECT data_type, original_sha256, status, created_at, updated_at
             FROM entries WHERE canonical_key = ?1",
            params![key.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(db)?;
    let Some((data_type, original_sha256, status, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT format, path, sha256, size FROM representations WHERE canonical_key = ?1")
        .map_err(db)?;
    let rows = stmt
        .query_map(params![key.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .map_err(db)?;
    let mut representations = BTreeMap::new();
    for row in rows {
        let (format, path, sha256, size) = row.map_err(db)?;
        representations.insert(
            format.parse::<LocalFormat>()?,
            Representation {
                path: Utf8PathBuf::from(path),
                sha256,
                size: size as u64,
            },
        );
    }

    Ok(Some(CacheEntry {
        key: key.clone(),
        data_type: data_type.parse()?,
        original_sha256,
        status: EntryStatus::parse(&status)?,
        representations,
        created_at,
        updated_at,
    }))
}

fn upsert_representation(
    conn: &Connection,
    key: &CanonicalKey,
    format: LocalFormat,
    representation: &Representation,
) -> Result<(), TaigaError> {
    conn.execute(
        "INSERT INTO representations(canonical_key, format, path, sha256, size)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(canonical_key, format) DO UPDATE SET
            path = excluded.path,
            sha256 = excluded.sha256,
            size = excluded.size",
        params![
            key.to_string(),
            format.as_str(),
            representation.path.as_str(),
            representation.sha256,
            representation.size as i64,
        ],
    )
    .map_err(db)?;
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn db(err: rusqlite::Error) -> TaigaError {
    TaigaError::Index(err.to_string())
}
