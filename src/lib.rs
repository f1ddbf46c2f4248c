//! # Taxolink
//!
//! A client library for hierarchical classification schemes published as
//! linked data, built around the Dewey Decimal service but generic over any
//! endpoint with the same shape.
//!
//! ## Features
//!
//! - Code resolution through a two-tier cache: an in-process LRU for the
//!   current working set and a SQLite store that survives restarts
//! - Negative caching: codes the scheme confirms absent stay answered
//!   locally for a configurable trust window
//! - OAuth2 client-credentials token management with double-checked renewal
//! - Retry policy tuned for a rate-limited service: one token refresh on
//!   401, immediate failure on 429, linear backoff on server trouble
//! - Context expansion: broader chains walked with cycle protection,
//!   narrower/related concepts fetched through a bounded concurrent fan-out
//! - All durable writes funneled through a single background worker, so
//!   resolution paths never wait on disk
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use taxolink::{StaticCredentials, TaxonomyClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let credentials = Arc::new(StaticCredentials::new("client-id", "client-secret"));
//!     let client = TaxonomyClient::new("dewey_cache.db", credentials)?;
//!
//!     // resolve one code
//!     let concept = client.resolve("025.04").await?;
//!     println!("{}: {}", concept.notation, concept.label());
//!
//!     // resolve a code together with its neighborhood
//!     let context = client.resolve_context("025.04").await?;
//!     for ancestor in &context.ancestors {
//!         println!("broader: {}", ancestor.label());
//!     }
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod model;
pub mod notation;
pub mod remote;
pub mod resolver;
pub mod token;

// Re-export main types for convenience
pub use cache::{CacheConfig, CacheConfigBuilder, CacheStats, DurableCache, StoredEntry};
pub use error::{AuthFailure, Result, TaxonomyError};
pub use model::{Concept, StoredPayload};
pub use remote::{FailureClass, RemoteConfig, RetryPolicy};
pub use resolver::{ConceptContext, ResolverConfig, TaxonomyClient};
pub use token::{CredentialProvider, Credentials, StaticCredentials};
