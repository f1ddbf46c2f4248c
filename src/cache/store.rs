//! Durable cache tier backed by SQLite
//!
//! Second tier of the lookup path: every resolved concept, and every
//! confirmed "no such code" answer, lands here and survives restarts.
//! SQLite connections are not thread-safe, so each read opens its own
//! connection (cheap under WAL) inside `spawn_blocking`; WAL mode lets any
//! number of readers run while the single persistence worker writes.
//!
//! Reads are lock-free with respect to other callers. All writes go through
//! `PersistenceWriter`; this type never executes an INSERT or UPDATE.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::{Result, TaxonomyError};
use crate::model::StoredPayload;

/// One durable row: a positive concept payload or a negative marker,
/// together with the bookkeeping columns.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub resource_id: String,
    pub code: Option<String>,
    pub raw_payload: String,
    pub last_updated: DateTime<Utc>,
    pub access_count: i64,
}

impl StoredEntry {
    /// Parses the stored payload, distinguishing positive from negative.
    pub fn payload(&self) -> Result<StoredPayload> {
        StoredPayload::parse(&self.raw_payload)
    }

    /// Whether a negative entry recorded at `last_updated` is still inside
    /// its trust window. A future-dated timestamp counts as fresh.
    pub fn negative_still_valid(&self, negative_ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_updated);
        match age.to_std() {
            Ok(age) => age <= negative_ttl,
            Err(_) => true,
        }
    }
}

/// Persistent code/resourceId → payload store.
pub struct DurableCache {
    db_path: Arc<PathBuf>,
}

impl DurableCache {
    /// Opens (creating if needed) the durable cache at `path` and ensures
    /// the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = Arc::new(path.as_ref().to_path_buf());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TaxonomyError::Storage(format!("create cache directory: {e}"))
                })?;
            }
        }

        let conn = Self::connection(&db_path)?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self { db_path })
    }

    /// Opens a configured connection. Also used by the persistence worker,
    /// which holds its own long-lived connection.
    pub(crate) fn connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .map_err(|e| TaxonomyError::Storage(format!("open durable cache: {e}")))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| TaxonomyError::Storage(format!("configure durable cache: {e}")))?;

        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                 resource_id  TEXT PRIMARY KEY,
                 code         TEXT,
                 payload      TEXT NOT NULL,
                 last_updated TEXT NOT NULL,
                 access_count INTEGER NOT NULL DEFAULT 1,
                 approx_size  INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_cache_entries_code
                 ON cache_entries(code);
             CREATE INDEX IF NOT EXISTS idx_cache_entries_updated
                 ON cache_entries(last_updated);
             CREATE TABLE IF NOT EXISTS keyword_index (
                 resource_id TEXT NOT NULL,
                 code        TEXT NOT NULL,
                 term        TEXT NOT NULL,
                 term_kind   TEXT NOT NULL,
                 PRIMARY KEY (resource_id, term, term_kind)
             );",
        )
        .map_err(|e| TaxonomyError::Storage(format!("create cache schema: {e}")))?;

        Ok(())
    }

    pub(crate) fn path(&self) -> PathBuf {
        (*self.db_path).clone()
    }

    /// Most recent entry for a classification code, if any. Ordering by
    /// `last_updated` lets a fresh positive row shadow an older negative
    /// row for the same code.
    pub async fn lookup_by_code(&self, code: &str) -> Result<Option<StoredEntry>> {
        let code = code.to_string();
        self.query_one(move |conn| {
            conn.query_row(
                "SELECT resource_id, code, payload, last_updated, access_count
                 FROM cache_entries
                 WHERE code = ?1
                 ORDER BY last_updated DESC
                 LIMIT 1",
                params![code],
                row_to_raw,
            )
            .optional()
        })
        .await
    }

    /// Entry keyed by the remote scheme's opaque identifier, if any.
    pub async fn lookup_by_resource_id(&self, resource_id: &str) -> Result<Option<StoredEntry>> {
        let resource_id = resource_id.to_string();
        self.query_one(move |conn| {
            conn.query_row(
                "SELECT resource_id, code, payload, last_updated, access_count
                 FROM cache_entries
                 WHERE resource_id = ?1",
                params![resource_id],
                row_to_raw,
            )
            .optional()
        })
        .await
    }

    /// Number of durable entries (positive and negative).
    pub async fn entry_count(&self) -> Result<u64> {
        let db_path = self.path();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = Self::connection(&db_path)?;
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
                .map_err(|e| TaxonomyError::Storage(format!("count cache entries: {e}")))?;
            Ok(count as u64)
        })
        .await
        .map_err(|e| TaxonomyError::Storage(format!("count task failed: {e}")))?
    }

    async fn query_one<F>(&self, query: F) -> Result<Option<StoredEntry>>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<Option<RawEntry>> + Send + 'static,
    {
        let db_path = self.path();
        let raw = tokio::task::spawn_blocking(move || -> Result<Option<RawEntry>> {
            let conn = Self::connection(&db_path)?;
            query(&conn).map_err(|e| TaxonomyError::Storage(format!("cache lookup: {e}")))
        })
        .await
        .map_err(|e| TaxonomyError::Storage(format!("lookup task failed: {e}")))??;

        Ok(raw.map(RawEntry::into_entry))
    }
}

impl Clone for DurableCache {
    fn clone(&self) -> Self {
        Self {
            db_path: Arc::clone(&self.db_path),
        }
    }
}

/// Row as fetched, before timestamp parsing.
struct RawEntry {
    resource_id: String,
    code: Option<String>,
    raw_payload: String,
    last_updated: String,
    access_count: i64,
}

impl RawEntry {
    fn into_entry(self) -> StoredEntry {
        let last_updated = DateTime::parse_from_rfc3339(&self.last_updated)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|e| {
                // an unparseable timestamp makes the row maximally stale,
                // which forces re-validation instead of trusting it
                warn!(
                    resource_id = %self.resource_id,
                    error = %e,
                    "Malformed last_updated in cache row"
                );
                DateTime::<Utc>::MIN_UTC
            });

        StoredEntry {
            resource_id: self.resource_id,
            code: self.code,
            raw_payload: self.raw_payload,
            last_updated,
            access_count: self.access_count,
        }
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        resource_id: row.get(0)?,
        code: row.get(1)?,
        raw_payload: row.get(2)?,
        last_updated: row.get(3)?,
        access_count: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn insert_row(
        path: &Path,
        resource_id: &str,
        code: &str,
        payload: &str,
        last_updated: DateTime<Utc>,
    ) {
        let conn = DurableCache::connection(path).unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
                 (resource_id, code, payload, last_updated, access_count, approx_size)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                resource_id,
                code,
                payload,
                last_updated.to_rfc3339(),
                payload.len() as i64
            ],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_schema() {
        let dir = TempDir::new().unwrap();
        let store = DurableCache::open(dir.path().join("cache.db")).unwrap();
        assert_eq!(store.entry_count().await.unwrap(), 0);
        assert!(store.lookup_by_code("005").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_by_code_and_resource_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let store = DurableCache::open(&path).unwrap();

        let payload = r#"{"id": "https://example.org/R1", "notation": "005"}"#;
        insert_row(&path, "https://example.org/R1", "005", payload, Utc::now());

        let by_code = store.lookup_by_code("005").await.unwrap().unwrap();
        assert_eq!(by_code.resource_id, "https://example.org/R1");
        assert!(matches!(
            by_code.payload().unwrap(),
            StoredPayload::Present(_)
        ));

        let by_id = store
            .lookup_by_resource_id("https://example.org/R1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.code.as_deref(), Some("005"));
        assert_eq!(by_id.access_count, 1);
    }

    #[tokio::test]
    async fn test_newest_row_shadows_older_negative() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let store = DurableCache::open(&path).unwrap();

        let old = Utc::now() - chrono::Duration::days(120);
        insert_row(
            &path,
            "https://example.org/lookup?code=005",
            "005",
            &StoredPayload::negative_json(),
            old,
        );
        insert_row(
            &path,
            "https://example.org/R1",
            "005",
            r#"{"id": "https://example.org/R1", "notation": "005"}"#,
            Utc::now(),
        );

        let entry = store.lookup_by_code("005").await.unwrap().unwrap();
        assert_eq!(entry.resource_id, "https://example.org/R1");
        assert!(!entry.payload().unwrap().is_negative());
    }

    #[tokio::test]
    async fn test_negative_ttl_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let store = DurableCache::open(&path).unwrap();
        let ttl = Duration::from_secs(90 * 24 * 3600);

        insert_row(
            &path,
            "https://example.org/lookup?code=999.99",
            "999.99",
            &StoredPayload::negative_json(),
            Utc::now() - chrono::Duration::days(10),
        );
        let fresh = store.lookup_by_code("999.99").await.unwrap().unwrap();
        assert!(fresh.payload().unwrap().is_negative());
        assert!(fresh.negative_still_valid(ttl));

        insert_row(
            &path,
            "https://example.org/lookup?code=999.99",
            "999.99",
            &StoredPayload::negative_json(),
            Utc::now() - chrono::Duration::days(120),
        );
        let stale = store.lookup_by_code("999.99").await.unwrap().unwrap();
        assert!(!stale.negative_still_valid(ttl));
    }

    #[tokio::test]
    async fn test_malformed_timestamp_reads_as_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let store = DurableCache::open(&path).unwrap();

        let conn = DurableCache::connection(&path).unwrap();
        conn.execute(
            "INSERT INTO cache_entries (resource_id, code, payload, last_updated)
             VALUES ('https://example.org/R9', '900', ?1, 'not-a-timestamp')",
            params![StoredPayload::negative_json()],
        )
        .unwrap();

        let entry = store.lookup_by_code("900").await.unwrap().unwrap();
        assert!(!entry.negative_still_valid(Duration::from_secs(90 * 24 * 3600)));
    }
}
