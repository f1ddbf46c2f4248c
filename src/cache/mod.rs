//! # Tiered Caching Layer
//!
//! Two cache tiers sit in front of the remote classification service:
//!
//! - **Recency tier**: in-process LRU map sized for one session's working set
//! - **Durable tier**: SQLite store that survives restarts and also records
//!   confirmed "no such code" answers for the negative-cache window
//!
//! Reads consult the recency tier, then the durable tier; only a miss in
//! both reaches the network. All durable writes funnel through the single
//! [`PersistenceWriter`] worker, so resolution paths never wait on disk.

pub mod config;
pub mod recency;
pub mod store;
pub mod writer;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use recency::{CacheStats, RecencyCache};
pub use store::{DurableCache, StoredEntry};
pub use writer::PersistenceWriter;
