//! Ingestion orchestration.
//!
//! [`DataSourceManager`] builds sources from configuration through a
//! [`SourceRegistry`], drives initial and incremental loads, deduplicates
//! against the [`ItemStore`] and keeps the partial-read state current.
//!
//! ```text
//! [[data_sources]] ──▶ credentials ──▶ SourceConfig ──▶ registry ──▶ DataSource
//!                                                                        │
//!   PartialReader (start, count) ──▶ read_items ──▶ dedup ──▶ ItemStore ◀┘
//! ```
//!
//! # Failure isolation
//!
//! A misconfigured or unreachable source never stops construction: it is
//! logged and either skipped (bad config, unknown type, duplicate id) or
//! kept and flagged unavailable. Per-item problems (missing id, rejected
//! insert, malformed record) skip the item and the batch continues.
//!
//! # Locking
//!
//! Every public operation holds one mutex for its whole duration, including
//! the connector's fetch. A slow remote source therefore blocks all other
//! operations on the same manager until it returns.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheStats};
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::error::{ReadError, SourceError};
use crate::models::{item_id, SourceConfig};
use crate::partial::{PartialReader, PartialStats, StateUpdate};
use crate::registry::SourceRegistry;
use crate::store::ItemStore;
use crate::traits::{Capabilities, DataSource, SourceContext};

/// Live status of one registered source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub source_type: String,
    pub description: String,
    pub available: bool,
    pub supports_partial_reading: bool,
    pub remote: bool,
    /// Unique items added so far (partial tracking only).
    pub items_loaded: Option<u64>,
    pub total_estimate: Option<u64>,
    pub is_complete: bool,
    pub last_error: Option<String>,
}

/// Snapshot returned by [`DataSourceManager::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub sources: Vec<SourceStatus>,
    pub item_count: usize,
    pub cache: Option<CacheStats>,
    pub partial_loading: Option<PartialStats>,
}

struct SourceSlot {
    source: Box<dyn DataSource>,
    capabilities: Capabilities,
    available: bool,
    last_error: Option<String>,
}

struct Inner {
    slots: Vec<SourceSlot>,
    closed: bool,
}

/// Top-level coordinator for all configured sources.
pub struct DataSourceManager {
    inner: Mutex<Inner>,
    cache: Option<Arc<CacheManager>>,
    partial: Option<PartialReader>,
    id_key: String,
    store: Arc<dyn ItemStore>,
}

impl DataSourceManager {
    /// Build every configured source.
    ///
    /// Only shared infrastructure (credentials file, cache directory, state
    /// directory) can make this fail; individual sources never do.
    pub fn new(config: &Config, registry: &SourceRegistry, store: Arc<dyn ItemStore>) -> Result<Self> {
        let resolver = Arc::new(match &config.credentials.env_file {
            Some(path) => CredentialResolver::with_env_file(path)?,
            None => CredentialResolver::new(),
        });

        let cache = if config.cache.enabled {
            Some(Arc::new(CacheManager::from_config(&config.cache)?))
        } else {
            None
        };

        let partial = if config.partial_loading.enabled {
            Some(PartialReader::new(config.partial_loading.clone(), &config.output.dir)?)
        } else {
            None
        };

        let id_key = config.item_properties.id_key.clone();
        let ctx = SourceContext::new(cache.clone(), resolver.clone(), id_key.clone());

        let mut slots = Vec::new();
        let mut seen = HashSet::new();
        for (index, raw) in config.data_sources.iter().enumerate() {
            match build_source(index, raw, registry, &ctx, &resolver, &seen) {
                Ok(Some(slot)) => {
                    seen.insert(slot.source.source_id().to_string());
                    slots.push(slot);
                }
                Ok(None) => {}
                Err(e) => warn!(index, error = %e, "skipping data source"),
            }
        }

        info!(
            sources = slots.len(),
            configured = config.data_sources.len(),
            cache = cache.is_some(),
            partial_loading = partial.is_some(),
            "data source manager ready"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                slots,
                closed: false,
            }),
            cache,
            partial,
            id_key,
            store,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache(&self) -> Option<&CacheManager> {
        self.cache.as_deref()
    }

    pub fn partial_reader(&self) -> Option<&PartialReader> {
        self.partial.as_ref()
    }

    /// Ids of live sources, in configuration order.
    pub fn source_ids(&self) -> Vec<String> {
        self.lock()
            .slots
            .iter()
            .map(|s| s.source.source_id().to_string())
            .collect()
    }

    pub fn source_status(&self, source_id: &str) -> Option<SourceStatus> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .find(|s| s.source.source_id() == source_id)
            .map(|slot| self.status_of(slot))
    }

    fn status_of(&self, slot: &SourceSlot) -> SourceStatus {
        let id = slot.source.source_id().to_string();
        let state = self.partial.as_ref().and_then(|p| p.get_state(&id));
        SourceStatus {
            source_type: slot.source.source_type().to_string(),
            description: slot.capabilities.description.to_string(),
            available: slot.available,
            supports_partial_reading: slot.source.supports_partial_reading(),
            remote: slot.capabilities.remote,
            items_loaded: state.as_ref().map(|s| s.items_loaded),
            total_estimate: state.as_ref().and_then(|s| s.total_estimate),
            is_complete: state.as_ref().is_some_and(|s| s.is_complete),
            last_error: slot.last_error.clone(),
            id,
        }
    }

    /// First load of every source, in configuration order.
    ///
    /// Failures are isolated per source. Returns the number of items added.
    pub fn load_initial_data(&self) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }

        let mut total = 0;
        for slot in inner.slots.iter_mut() {
            match self.load_from_source(slot, true, None) {
                Ok(added) => total += added,
                Err(e) => warn!(source_id = %slot.source.source_id(), error = %e, "initial load failed"),
            }
        }
        info!(items = total, "initial load finished");
        total
    }

    /// Load the next batch from one source.
    ///
    /// `count` overrides the configured batch size.
    pub fn load_more(&self, source_id: &str, count: Option<usize>) -> Result<usize, SourceError> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.source.source_id() == source_id)
            .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?;
        self.load_from_source(slot, false, count)
    }

    /// Pull another batch from every source whose annotation ratio crossed
    /// the threshold. Returns the yield per triggered source.
    pub fn check_auto_load(&self, annotated_count: u64, total_loaded: u64) -> BTreeMap<String, usize> {
        let mut loaded = BTreeMap::new();
        let Some(partial) = &self.partial else {
            return loaded;
        };

        let mut inner = self.lock();
        if inner.closed {
            return loaded;
        }
        for slot in inner.slots.iter_mut() {
            let id = slot.source.source_id().to_string();
            if !partial.should_load_more(&id, annotated_count, total_loaded) {
                continue;
            }
            debug!(source_id = %id, annotated_count, total_loaded, "auto-load triggered");
            match self.load_from_source(slot, false, None) {
                Ok(added) => {
                    loaded.insert(id, added);
                }
                Err(e) => warn!(source_id = %id, error = %e, "auto-load failed"),
            }
        }
        loaded
    }

    /// Forget everything known about a source: its cache entry, its read
    /// position and the connector's own cached data. Availability is probed
    /// again afterwards.
    pub fn refresh_source(&self, source_id: &str) -> Result<bool, SourceError> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.source.source_id() == source_id)
            .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))?;

        if let Some(cache) = &self.cache {
            cache.invalidate(source_id)?;
        }
        if let Some(partial) = &self.partial {
            partial.reset_state(source_id)?;
        }

        let refreshed = slot.source.refresh();
        slot.available = slot.source.is_available();
        slot.last_error = None;
        info!(source_id, refreshed, available = slot.available, "source refreshed");
        Ok(refreshed)
    }

    /// Drop every cache entry. Returns how many were removed.
    pub fn clear_cache(&self) -> Result<usize, SourceError> {
        let _inner = self.lock();
        match &self.cache {
            Some(cache) => Ok(cache.clear()?),
            None => Ok(0),
        }
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn cache_cleanup(&self) -> Result<usize, SourceError> {
        let _inner = self.lock();
        match &self.cache {
            Some(cache) => Ok(cache.cleanup_expired()?),
            None => Ok(0),
        }
    }

    pub fn get_stats(&self) -> ManagerStats {
        let inner = self.lock();
        ManagerStats {
            sources: inner.slots.iter().map(|s| self.status_of(s)).collect(),
            item_count: self.store.len(),
            cache: self.cache.as_ref().map(|c| c.get_stats()),
            partial_loading: self.partial.as_ref().map(|p| p.get_stats()),
        }
    }

    /// Close every source and forget them. Safe to call more than once.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        for slot in inner.slots.iter_mut() {
            slot.source.close();
        }
        let closed = inner.slots.len();
        inner.slots.clear();
        inner.closed = true;
        debug!(sources = closed, "data source manager closed");
    }

    /// Read one batch from `slot` into the store.
    ///
    /// Only newly added items count: they advance the resume cursor and they
    /// decide exhaustion. A batch that yields fewer new items than requested
    /// marks the source complete, even when duplicates filled the rest.
    fn load_from_source(
        &self,
        slot: &mut SourceSlot,
        is_initial: bool,
        count: Option<usize>,
    ) -> Result<usize, SourceError> {
        let source_id = slot.source.source_id().to_string();

        if let Some(partial) = &self.partial {
            if partial.is_complete(&source_id) {
                debug!(source_id = %source_id, "source already complete");
                return Ok(0);
            }
        }

        let start = self
            .partial
            .as_ref()
            .map(|p| p.get_start_position(&source_id) as usize)
            .unwrap_or(0);
        let count = count.or_else(|| {
            self.partial
                .as_ref()
                .map(|p| p.get_load_count(&source_id, is_initial))
        });

        if start > 0 && !slot.source.supports_partial_reading() {
            warn!(
                source_id = %source_id,
                start,
                "source cannot resume from a non-zero position; nothing loaded"
            );
            return Ok(0);
        }

        debug!(source_id = %source_id, start, count = ?count, is_initial, "reading items");

        let mut consumed = 0usize;
        let mut added = 0usize;
        let mut duplicates = 0usize;
        let mut failure = None;

        match slot.source.read_items(start, count) {
            Ok(items) => {
                for record in items {
                    let item = match record {
                        Ok(item) => item,
                        Err(ReadError::Malformed { position, message }) => {
                            consumed += 1;
                            warn!(source_id = %source_id, position, message = %message, "skipping malformed record");
                            continue;
                        }
                        Err(ReadError::Source(e)) => {
                            failure = Some(format!("{:#}", e));
                            break;
                        }
                    };
                    consumed += 1;

                    let Some(id) = item_id(&item, &self.id_key) else {
                        warn!(source_id = %source_id, id_key = %self.id_key, "item has no id; skipped");
                        continue;
                    };
                    if self.store.has_item(&id) {
                        duplicates += 1;
                        continue;
                    }
                    match self.store.add_item(&id, item) {
                        Ok(()) => added += 1,
                        Err(e) => {
                            let rejected = SourceError::ItemRejected {
                                item_id: id,
                                message: e.to_string(),
                            };
                            warn!(source_id = %source_id, error = %rejected, "item skipped");
                        }
                    }
                }
            }
            Err(e) => {
                slot.available = false;
                slot.last_error = Some(format!("{:#}", e));
                return Err(SourceError::Unavailable {
                    id: source_id,
                    message: format!("{:#}", e),
                });
            }
        }

        match &failure {
            Some(message) => {
                warn!(source_id = %source_id, consumed, error = %message, "read stopped early");
                slot.last_error = Some(message.clone());
            }
            None => {
                slot.available = true;
                slot.last_error = None;
            }
        }

        let exhausted = failure.is_none()
            && match count {
                Some(n) => added < n,
                None => true,
            };

        if let Some(partial) = &self.partial {
            let update = StateUpdate {
                is_complete: Some(exhausted),
                total_estimate: slot.source.total_count().map(|n| n as u64),
                ..Default::default()
            };
            partial.update_state(&source_id, added as u64, update)?;
        }

        info!(
            source_id = %source_id,
            added,
            duplicates,
            consumed,
            complete = exhausted,
            "batch loaded"
        );
        Ok(added)
    }
}

/// Run the per-source construction pipeline for the `index`-th table.
///
/// `Ok(None)` means the source is disabled; errors skip just this source.
fn build_source(
    index: usize,
    raw: &serde_json::Map<String, serde_json::Value>,
    registry: &SourceRegistry,
    ctx: &SourceContext,
    resolver: &CredentialResolver,
    seen: &HashSet<String>,
) -> Result<Option<SourceSlot>, SourceError> {
    let processed = resolver.process_config(raw);
    let config = SourceConfig::from_raw(processed, index).map_err(|e| SourceError::Configuration {
        id: format!("#{}", index),
        message: e.to_string(),
    })?;
    let id = config.id.clone();
    let configuration = |message: String| SourceError::Configuration {
        id: id.clone(),
        message,
    };

    if !config.enabled {
        info!(source_id = %id, "data source disabled");
        return Ok(None);
    }
    if seen.contains(&id) {
        return Err(configuration("duplicate source id".to_string()));
    }

    let Some(capabilities) = registry.capabilities(&config.source_type) else {
        return Err(configuration(format!(
            "unknown source type '{}' (registered: {})",
            config.source_type,
            registry.tags().join(", ")
        )));
    };

    let source = registry
        .create(config, ctx)
        .map_err(|e| configuration(format!("{:#}", e)))?
        .ok_or_else(|| configuration("source type disappeared from registry".to_string()))?;

    let problems = source.validate_config();
    if !problems.is_empty() {
        return Err(configuration(problems.join("; ")));
    }

    let available = source.is_available();
    if available {
        debug!(source_id = %id, "data source registered");
    } else {
        warn!(source_id = %id, "data source registered but currently unavailable");
    }

    Ok(Some(SourceSlot {
        source,
        capabilities,
        available,
        last_error: None,
    }))
}
