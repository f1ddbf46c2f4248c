//! Single-writer persistence queue
//!
//! All durable writes funnel through one dedicated worker thread that owns
//! the write connection, so there is never more than one write transaction
//! in flight no matter how many callers resolve concurrently. Callers only
//! push onto an unbounded channel and move on; a slow or failing item is
//! logged by the worker and never reaches them.
//!
//! Access-count increments are too cheap to deserve one transaction each.
//! They accumulate in an in-memory map and a single debounce timer, reset on
//! every new increment, flushes the whole map as one batched update once the
//! map has been idle for the quiescence window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::config::CacheConfig;
use crate::cache::store::DurableCache;
use crate::error::{Result, TaxonomyError};
use crate::model::{Concept, StoredPayload};

/// Work items for the writer thread, drained strictly in submission order.
enum WriteJob {
    Upsert {
        resource_id: String,
        code: String,
        payload: String,
    },
    FlushIncrements(HashMap<String, i64>),
    Shutdown(oneshot::Sender<()>),
}

/// Pending access increments plus the debounce timer guarding them.
struct PendingIncrements {
    counts: HashMap<String, i64>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

/// Handle to the single persistence worker.
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<WriteJob>,
    pending: Arc<Mutex<PendingIncrements>>,
    flush_quiescence: Duration,
    shutdown_grace: Duration,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PersistenceWriter {
    /// Spawns the worker thread against the given durable cache.
    pub fn spawn(store: &DurableCache, config: &CacheConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let db_path = store.path();

        let worker = std::thread::Builder::new()
            .name("taxolink-writer".to_string())
            .spawn(move || run_worker(db_path, rx))
            .map_err(|e| TaxonomyError::Storage(format!("spawn persistence worker: {e}")))?;

        Ok(Self {
            tx,
            pending: Arc::new(Mutex::new(PendingIncrements {
                counts: HashMap::new(),
                timer: None,
            })),
            flush_quiescence: config.flush_quiescence,
            shutdown_grace: config.shutdown_grace,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues an upsert. Never blocks; failure to queue (worker gone) is
    /// logged and swallowed, the caller already has its answer.
    pub fn enqueue_write(&self, resource_id: &str, code: &str, payload: &str) {
        let job = WriteJob::Upsert {
            resource_id: resource_id.to_string(),
            code: code.to_string(),
            payload: payload.to_string(),
        };
        if self.tx.send(job).is_err() {
            error!(code = %code, "Persistence worker is gone, dropping write");
        } else {
            debug!(code = %code, resource_id = %resource_id, "Queued cache write");
        }
    }

    /// Records one access to a durable row. Increments accumulate in memory
    /// and are flushed as a single batched update after the quiescence
    /// window passes with no new increments.
    pub async fn enqueue_access_increment(&self, resource_id: &str) {
        let mut pending = self.pending.lock().await;
        *pending.counts.entry(resource_id.to_string()).or_insert(0) += 1;

        // reset the debounce timer
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }

        let shared = Arc::clone(&self.pending);
        let tx = self.tx.clone();
        let window = self.flush_quiescence;
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let counts = {
                let mut pending = shared.lock().await;
                pending.timer = None;
                std::mem::take(&mut pending.counts)
            };
            if !counts.is_empty() {
                debug!(keys = counts.len(), "Flushing batched access counts");
                let _ = tx.send(WriteJob::FlushIncrements(counts));
            }
        }));
    }

    /// Flushes any batched increments to the queue immediately.
    pub async fn flush_pending_increments(&self) {
        let counts = {
            let mut pending = self.pending.lock().await;
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.counts)
        };
        if !counts.is_empty() {
            let _ = self.tx.send(WriteJob::FlushIncrements(counts));
        }
    }

    /// Drains the queue and stops the worker, waiting at most the shutdown
    /// grace period. Pending increments are flushed first, so everything
    /// queued before this call is durable when it returns.
    pub async fn shutdown(&self) -> Result<()> {
        self.flush_pending_increments().await;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteJob::Shutdown(ack_tx)).is_err() {
            // worker already stopped
            return Ok(());
        }

        match tokio::time::timeout(self.shutdown_grace, ack_rx).await {
            Ok(Ok(())) => {
                if let Some(handle) = self.worker.lock().await.take() {
                    let joined = tokio::task::spawn_blocking(move || handle.join()).await;
                    if !matches!(joined, Ok(Ok(()))) {
                        warn!("Persistence worker did not exit cleanly");
                    }
                }
                Ok(())
            }
            Ok(Err(_)) => {
                warn!("Persistence worker dropped the shutdown ack");
                Ok(())
            }
            Err(_) => Err(TaxonomyError::Storage(format!(
                "persistence worker did not drain within {:?}",
                self.shutdown_grace
            ))),
        }
    }
}

/// Worker loop. Owns the only write connection; applies jobs in FIFO order
/// and keeps going when an individual item fails.
fn run_worker(db_path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteJob>) {
    info!("Persistence worker started");

    let mut conn = match DurableCache::connection(&db_path) {
        Ok(conn) => Some(conn),
        Err(e) => {
            error!(error = %e, "Persistence worker could not open its connection");
            None
        }
    };

    while let Some(job) = rx.blocking_recv() {
        match job {
            WriteJob::Upsert {
                resource_id,
                code,
                payload,
            } => match conn.as_mut() {
                Some(conn) => match apply_upsert(conn, &resource_id, &code, &payload) {
                    Ok(()) => debug!(code = %code, "Persisted cache entry"),
                    Err(e) => error!(code = %code, error = %e, "Cache write failed"),
                },
                None => error!(code = %code, "No write connection, dropping cache entry"),
            },
            WriteJob::FlushIncrements(counts) => {
                if let Some(conn) = conn.as_mut() {
                    if let Err(e) = apply_increments(conn, &counts) {
                        warn!(error = %e, "Batched access-count update failed");
                    }
                }
            }
            WriteJob::Shutdown(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }

    info!("Persistence worker stopped");
}

/// One upsert as one transaction: the cache row, the derived keyword rows
/// (delete-then-reinsert), and removal of any negative row this positive
/// result supersedes.
fn apply_upsert(conn: &mut Connection, resource_id: &str, code: &str, payload: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| TaxonomyError::Storage(format!("begin write transaction: {e}")))?;

    tx.execute(
        "INSERT OR REPLACE INTO cache_entries
             (resource_id, code, payload, last_updated, access_count, approx_size)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![
            resource_id,
            code,
            payload,
            Utc::now().to_rfc3339(),
            payload.len() as i64
        ],
    )
    .map_err(|e| TaxonomyError::Storage(format!("upsert cache entry: {e}")))?;

    match StoredPayload::parse(payload) {
        Ok(StoredPayload::Present(concept)) => {
            refresh_keywords(&tx, resource_id, code, &concept)?;

            // this code is now confirmed present, drop any negative row
            // recorded for it under a different key
            tx.execute(
                "DELETE FROM cache_entries
                 WHERE code = ?1 AND resource_id != ?2
                   AND payload IN ('{\"exists\":false}', '{\"exists\": false}')",
                params![code, resource_id],
            )
            .map_err(|e| TaxonomyError::Storage(format!("drop superseded negative: {e}")))?;
        }
        Ok(StoredPayload::Missing) => {}
        Err(e) => {
            // raw payload is stored regardless; only the derived index needs
            // a parseable body
            warn!(code = %code, error = %e, "Unparseable payload, keyword index skipped");
        }
    }

    tx.commit()
        .map_err(|e| TaxonomyError::Storage(format!("commit write transaction: {e}")))
}

fn refresh_keywords(
    tx: &rusqlite::Transaction<'_>,
    resource_id: &str,
    code: &str,
    concept: &Concept,
) -> Result<()> {
    tx.execute(
        "DELETE FROM keyword_index WHERE resource_id = ?1",
        params![resource_id],
    )
    .map_err(|e| TaxonomyError::Storage(format!("clear keyword rows: {e}")))?;

    for (term, kind) in derive_keywords(concept) {
        tx.execute(
            "INSERT OR IGNORE INTO keyword_index (resource_id, code, term, term_kind)
             VALUES (?1, ?2, ?3, ?4)",
            params![resource_id, code, term, kind],
        )
        .map_err(|e| TaxonomyError::Storage(format!("insert keyword row: {e}")))?;
    }

    Ok(())
}

/// Search terms derived from a concept's English labels.
fn derive_keywords(concept: &Concept) -> Vec<(String, &'static str)> {
    let mut terms = Vec::new();
    if let Some(label) = concept.preferred_label("en") {
        let label = label.trim();
        if !label.is_empty() {
            terms.push((label.to_string(), "pref"));
        }
    }
    for alt in concept.alternate_labels("en") {
        let alt = alt.trim();
        if !alt.is_empty() {
            terms.push((alt.to_string(), "alt"));
        }
    }
    terms
}

/// Batched `access_count` bump, one transaction for the whole map. The
/// timestamp column is left alone: bumping it here would quietly extend a
/// negative entry's trust window on every read.
fn apply_increments(conn: &mut Connection, counts: &HashMap<String, i64>) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| TaxonomyError::Storage(format!("begin increment transaction: {e}")))?;

    for (resource_id, count) in counts {
        tx.execute(
            "UPDATE cache_entries
             SET access_count = access_count + ?1
             WHERE resource_id = ?2",
            params![count, resource_id],
        )
        .map_err(|e| TaxonomyError::Storage(format!("bump access count: {e}")))?;
    }

    tx.commit()
        .map_err(|e| TaxonomyError::Storage(format!("commit increment transaction: {e}")))
}
