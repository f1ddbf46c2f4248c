//! Concept resolution across the cache tiers and the remote service
//!
//! `TaxonomyClient` is the crate's front door. Every lookup walks the same
//! path: recency cache, durable cache, then the network, with each remote
//! answer written back through the persistence queue so the next process
//! start already knows it. The context and ancestor operations build on
//! that single path rather than talking to the network themselves.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::config::CacheConfig;
use crate::cache::recency::{CacheStats, RecencyCache};
use crate::cache::store::DurableCache;
use crate::cache::writer::PersistenceWriter;
use crate::error::{Result, TaxonomyError};
use crate::model::{Concept, StoredPayload};
use crate::notation;
use crate::remote::{RemoteConfig, RemoteService};
use crate::token::CredentialProvider;

/// Tuning for the relationship-expansion operations.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Concurrent fetches when expanding narrower/related references
    pub fanout_limit: usize,

    /// Per-fetch timeout inside the fan-out
    pub fanout_timeout: Duration,

    /// Upper bound on broader-chain walks and lexical ancestor chains
    pub max_ancestor_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fanout_limit: 10,
            fanout_timeout: Duration::from_secs(20),
            max_ancestor_depth: 10,
        }
    }
}

impl ResolverConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.fanout_limit == 0 {
            return Err("fanout_limit must be at least 1".to_string());
        }

        if self.fanout_timeout.is_zero() {
            return Err("fanout_timeout must be greater than 0".to_string());
        }

        if self.max_ancestor_depth == 0 {
            return Err("max_ancestor_depth must be at least 1".to_string());
        }

        Ok(())
    }
}

/// A concept together with its resolved neighborhood.
///
/// `ancestors` runs most-general-first. `children` and `related` keep the
/// order of the references on the main concept; members that failed to
/// resolve in time are simply absent.
#[derive(Debug, Clone)]
pub struct ConceptContext {
    pub main: Arc<Concept>,
    pub ancestors: Vec<Arc<Concept>>,
    pub children: Vec<Arc<Concept>>,
    pub related: Vec<Arc<Concept>>,
}

/// Client for a remote classification scheme, with tiered caching.
pub struct TaxonomyClient {
    remote: RemoteService,
    recency: RecencyCache,
    store: DurableCache,
    writer: PersistenceWriter,
    cache_config: CacheConfig,
    resolver_config: ResolverConfig,
}

impl TaxonomyClient {
    /// Opens a client against the Dewey linked-data service with default
    /// tuning. The durable cache lives at `db_path`.
    pub fn new(
        db_path: impl AsRef<Path>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        Self::with_config(
            db_path,
            provider,
            RemoteConfig::default(),
            CacheConfig::default(),
            ResolverConfig::default(),
        )
    }

    pub fn with_config(
        db_path: impl AsRef<Path>,
        provider: Arc<dyn CredentialProvider>,
        remote_config: RemoteConfig,
        cache_config: CacheConfig,
        resolver_config: ResolverConfig,
    ) -> Result<Self> {
        cache_config.validate().map_err(TaxonomyError::Config)?;
        resolver_config.validate().map_err(TaxonomyError::Config)?;

        let store = DurableCache::open(&db_path)?;
        let writer = PersistenceWriter::spawn(&store, &cache_config)?;
        let remote = RemoteService::new(remote_config, provider)?;
        let recency = RecencyCache::new(cache_config.recency_capacity, cache_config.track_stats);

        info!(
            db_path = %db_path.as_ref().display(),
            recency_capacity = cache_config.recency_capacity,
            "Taxonomy client ready"
        );

        Ok(Self {
            remote,
            recency,
            store,
            writer,
            cache_config,
            resolver_config,
        })
    }

    /// Resolves a classification code to its concept.
    ///
    /// Checks the recency cache, then the durable cache, and only then the
    /// remote service. A confirmed "no such code" answer is cached durably
    /// and keeps answering [`TaxonomyError::NotFound`] without network
    /// traffic until it ages out of its trust window.
    pub async fn resolve(&self, code: &str) -> Result<Arc<Concept>> {
        let code = notation::normalize(code);
        if code.is_empty() {
            return Err(TaxonomyError::not_found(code));
        }

        if let Some(concept) = self.recency.get(&code).await {
            debug!(code = %code, "Recency cache hit");
            return Ok(concept);
        }

        // durable-tier read failures degrade to a cache miss
        let durable = match self.store.lookup_by_code(&code).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(code = %code, error = %e, "Durable cache read failed, going remote");
                None
            }
        };

        if let Some(entry) = durable {
            match entry.payload() {
                Ok(StoredPayload::Present(concept)) => {
                    debug!(code = %code, "Durable cache hit");
                    let concept = Arc::new(concept);
                    self.recency.put(&code, Arc::clone(&concept)).await;
                    self.writer.enqueue_access_increment(&entry.resource_id).await;
                    return Ok(concept);
                }
                Ok(StoredPayload::Missing) => {
                    if entry.negative_still_valid(self.cache_config.negative_ttl) {
                        debug!(code = %code, "Negative cache hit");
                        return Err(TaxonomyError::not_found(code));
                    }
                    // stale negative: the row stays until re-validation
                    // below overwrites or confirms it
                    debug!(code = %code, "Negative entry past its trust window, re-validating");
                }
                Err(e) => {
                    warn!(code = %code, error = %e, "Unreadable cached payload, going remote");
                }
            }
        }

        self.resolve_remote(&code).await
    }

    /// Resolves a concept and its neighborhood: the broader chain walked to
    /// the root, plus narrower and related concepts fetched concurrently.
    ///
    /// Only the main concept is all-or-nothing. A failure or cycle partway
    /// up the broader chain keeps the ancestors resolved so far, and
    /// narrower/related members that fail or time out are dropped from the
    /// result rather than failing it.
    pub async fn resolve_context(&self, code: &str) -> Result<ConceptContext> {
        self.resolve_context_with_cancel(code, &CancellationToken::new())
            .await
    }

    /// [`resolve_context`](Self::resolve_context) that honors a caller's
    /// cancellation token. Cancellation observed between steps returns the
    /// partial context built so far; the main resolution itself either
    /// completes or fails.
    pub async fn resolve_context_with_cancel(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ConceptContext> {
        let main = self.resolve(code).await?;
        let mut context = ConceptContext {
            main: Arc::clone(&main),
            ancestors: Vec::new(),
            children: Vec::new(),
            related: Vec::new(),
        };

        if cancel.is_cancelled() {
            debug!(code = %code, "Context resolution cancelled after main concept");
            return Ok(context);
        }

        context.ancestors = self.walk_broader(&main, cancel).await;

        if cancel.is_cancelled() {
            return Ok(context);
        }

        context.children = self.fetch_relations(&main.narrower, cancel).await;
        context.related = self.fetch_relations(&main.related, cancel).await;

        info!(
            code = %code,
            ancestors = context.ancestors.len(),
            children = context.children.len(),
            related = context.related.len(),
            "Resolved concept context"
        );
        Ok(context)
    }

    /// Resolves a code after warming the cache with its lexical ancestor
    /// chain (derived from the notation itself, no remote round-trips to
    /// discover it). Ancestors that fail to resolve are logged and skipped;
    /// only the input code's own resolution decides the return value.
    pub async fn resolve_with_ancestors(&self, code: &str) -> Result<Arc<Concept>> {
        let code = notation::normalize(code);
        if code.is_empty() {
            return Err(TaxonomyError::not_found(code));
        }

        let result = self.resolve(&code).await;
        if matches!(&result, Err(e) if e.is_auth()) {
            // broken credentials fail every ancestor the same way
            return result;
        }

        for ancestor in notation::ancestor_codes(&code, self.resolver_config.max_ancestor_depth) {
            match self.resolve(&ancestor).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(code = %ancestor, "No entry for ancestor code")
                }
                Err(e) => warn!(code = %ancestor, error = %e, "Ancestor warm-up failed"),
            }
        }

        result
    }

    /// Hit/miss counters for the recency tier.
    pub async fn recency_stats(&self) -> CacheStats {
        self.recency.stats().await
    }

    /// Pushes any batched access-count increments to the persistence queue
    /// without waiting for the quiescence window.
    pub async fn flush(&self) {
        self.writer.flush_pending_increments().await;
    }

    /// Drains the persistence queue and stops the writer, waiting at most
    /// the configured shutdown grace period.
    pub async fn shutdown(self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Direct access to the durable tier, for inspection.
    pub fn durable_cache(&self) -> &DurableCache {
        &self.store
    }

    async fn resolve_remote(&self, code: &str) -> Result<Arc<Concept>> {
        match self.remote.lookup_code(code).await? {
            Some(resource_id) => {
                let (concept, raw) = self.remote.fetch_concept(&resource_id).await?;
                let concept = Arc::new(concept);
                self.writer.enqueue_write(&resource_id, code, &raw);
                self.recency.put(code, Arc::clone(&concept)).await;
                Ok(concept)
            }
            None => {
                // no concept IRI exists to key the negative row, the lookup
                // URL stands in for it
                let key = self.remote.lookup_url(code);
                self.writer
                    .enqueue_write(&key, code, &StoredPayload::negative_json());
                info!(code = %code, "Code confirmed absent, cached negatively");
                Err(TaxonomyError::not_found(code))
            }
        }
    }

    /// Resolution keyed by concept IRI, used by the broader walk and the
    /// relation fan-out. Durable-cache first, then remote.
    async fn resolve_resource(&self, resource_id: &str) -> Result<Arc<Concept>> {
        match self.store.lookup_by_resource_id(resource_id).await {
            Ok(Some(entry)) => {
                if let Ok(StoredPayload::Present(concept)) = entry.payload() {
                    let concept = Arc::new(concept);
                    let code = notation::normalize(&concept.notation);
                    if !code.is_empty() {
                        self.recency.put(&code, Arc::clone(&concept)).await;
                    }
                    self.writer.enqueue_access_increment(resource_id).await;
                    return Ok(concept);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(resource_id = %resource_id, error = %e, "Durable cache read failed, going remote");
            }
        }

        let (concept, raw) = self.remote.fetch_concept(resource_id).await?;
        let concept = Arc::new(concept);
        let code = notation::normalize(&concept.notation);
        self.writer.enqueue_write(resource_id, &code, &raw);
        if !code.is_empty() {
            self.recency.put(&code, Arc::clone(&concept)).await;
        }
        Ok(concept)
    }

    /// Follows `broader` references upward until the chain ends, repeats
    /// itself, errors, is cancelled, or hits the depth cap. Whatever
    /// resolved before the stop is kept, reversed to most-general-first.
    async fn walk_broader(
        &self,
        main: &Concept,
        cancel: &CancellationToken,
    ) -> Vec<Arc<Concept>> {
        let mut chain: Vec<Arc<Concept>> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(main.id.clone());
        let mut next = main.broader.clone();

        for _ in 0..self.resolver_config.max_ancestor_depth {
            let Some(resource_id) = next.take() else {
                break;
            };
            if cancel.is_cancelled() {
                debug!("Broader walk cancelled");
                break;
            }
            if !seen.insert(resource_id.clone()) {
                warn!(resource_id = %resource_id, "Cycle in broader chain, stopping walk");
                break;
            }
            match self.resolve_resource(&resource_id).await {
                Ok(concept) => {
                    next = concept.broader.clone();
                    chain.push(concept);
                }
                Err(e) => {
                    warn!(resource_id = %resource_id, error = %e, "Broader walk stopped early");
                    break;
                }
            }
        }

        chain.reverse();
        chain
    }

    /// Resolves relationship targets concurrently, at most `fanout_limit`
    /// in flight and each bounded by `fanout_timeout`. Failures and
    /// timeouts drop the member, they never fail the batch. Input order is
    /// preserved.
    async fn fetch_relations(
        &self,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Vec<Arc<Concept>> {
        if targets.is_empty() {
            return Vec::new();
        }

        let timeout = self.resolver_config.fanout_timeout;
        let resolved: Vec<Option<Arc<Concept>>> = stream::iter(targets.iter().cloned())
            .map(|resource_id| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    match tokio::time::timeout(timeout, self.resolve_resource(&resource_id)).await
                    {
                        Ok(Ok(concept)) => Some(concept),
                        Ok(Err(e)) => {
                            warn!(resource_id = %resource_id, error = %e, "Relation fetch failed, omitting");
                            None
                        }
                        Err(_) => {
                            warn!(resource_id = %resource_id, "Relation fetch timed out, omitting");
                            None
                        }
                    }
                }
            })
            .buffered(self.resolver_config.fanout_limit)
            .collect()
            .await;

        resolved.into_iter().flatten().collect()
    }
}
