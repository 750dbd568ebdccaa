//! The data source contract.
//!
//! Every connector, built-in or custom, implements [`DataSource`]. The
//! orchestrator only ever talks to sources through this trait, and only
//! ever creates them through the [`SourceRegistry`](crate::registry::SourceRegistry),
//! so new connectors never require orchestrator changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             SourceRegistry               │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │  file   │ │ url/s3  │ │  Custom    │  │
//! │  │         │ │ sheets… │ │  (Rust)    │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!      DataSourceManager → ItemStore
//! ```
//!
//! # Example
//!
//! ```rust
//! use ingest_harness::error::ReadError;
//! use ingest_harness::models::{Item, SourceConfig};
//! use ingest_harness::traits::{DataSource, ItemIter};
//!
//! struct Fixed {
//!     config: SourceConfig,
//!     items: Vec<Item>,
//! }
//!
//! impl DataSource for Fixed {
//!     fn config(&self) -> &SourceConfig { &self.config }
//!     fn is_available(&self) -> bool { true }
//!     fn read_items(&mut self, start: usize, count: Option<usize>) -> anyhow::Result<ItemIter<'_>> {
//!         let iter = self.items.iter().skip(start).take(count.unwrap_or(usize::MAX));
//!         Ok(Box::new(iter.cloned().map(Ok::<Item, ReadError>)))
//!     }
//!     fn total_count(&self) -> Option<usize> { Some(self.items.len()) }
//!     fn supports_partial_reading(&self) -> bool { true }
//! }
//! ```

use anyhow::Result;
use std::sync::Arc;

use crate::cache::CacheManager;
use crate::credentials::CredentialResolver;
use crate::error::ReadError;
use crate::models::{Item, SourceConfig};

/// Finite, non-restartable sequence of records from a source.
///
/// The sequence ending is the exhaustion signal; errors are reserved for
/// real failures (see [`ReadError`]).
pub type ItemIter<'a> = Box<dyn Iterator<Item = Result<Item, ReadError>> + 'a>;

/// A connector that yields annotation items.
///
/// Required: [`is_available`](DataSource::is_available),
/// [`read_items`](DataSource::read_items),
/// [`total_count`](DataSource::total_count) and
/// [`supports_partial_reading`](DataSource::supports_partial_reading).
/// The remaining methods have no-op defaults.
pub trait DataSource: Send {
    /// The configuration this source was built from.
    fn config(&self) -> &SourceConfig;

    fn source_id(&self) -> &str {
        &self.config().id
    }

    fn source_type(&self) -> &str {
        &self.config().source_type
    }

    /// Cheap probe of dependencies, credentials and reachability.
    fn is_available(&self) -> bool;

    /// Yield up to `count` items starting at zero-based position `start`.
    ///
    /// `count = None` means all remaining items. Items must come out in the
    /// same order on every call, otherwise resuming by position breaks.
    fn read_items(&mut self, start: usize, count: Option<usize>) -> Result<ItemIter<'_>>;

    /// Total number of items, when knowable without a full read.
    fn total_count(&self) -> Option<usize>;

    fn supports_partial_reading(&self) -> bool;

    /// Non-fatal configuration problems, checked before activation.
    fn validate_config(&self) -> Vec<String> {
        Vec::new()
    }

    /// Drop any internal cached data. Returns whether the refresh succeeded.
    fn refresh(&mut self) -> bool {
        true
    }

    /// Release held resources. Must be idempotent.
    fn close(&mut self) {}
}

/// Static facts about a source type, declared once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Capabilities {
    pub description: &'static str,
    /// Whether instances can resume from a non-zero start.
    pub partial_reading: bool,
    /// Whether instances fetch over the network (and may use the cache).
    pub remote: bool,
}

/// Shared services handed to every source factory.
#[derive(Clone)]
pub struct SourceContext {
    /// Present when the payload cache is enabled.
    pub cache: Option<Arc<CacheManager>>,
    pub credentials: Arc<CredentialResolver>,
    /// Field that carries each item's id.
    pub id_key: String,
}

impl SourceContext {
    pub fn new(
        cache: Option<Arc<CacheManager>>,
        credentials: Arc<CredentialResolver>,
        id_key: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            credentials,
            id_key: id_key.into(),
        }
    }
}

/// Apply `start`/`count` to an already-ordered iterator.
pub fn slice_items<'a, I>(iter: I, start: usize, count: Option<usize>) -> ItemIter<'a>
where
    I: Iterator<Item = Result<Item, ReadError>> + 'a,
{
    let iter = iter.skip(start);
    match count {
        Some(n) => Box::new(iter.take(n)),
        None => Box::new(iter),
    }
}
