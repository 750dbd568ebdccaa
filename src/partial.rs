//! Incremental read tracking per source.
//!
//! Each source moves through `Unseen → Active → Complete`:
//!
//! - **Unseen**: no state recorded.
//! - **Active**: `items_loaded` counts items added so far and is the
//!   start position of the next read.
//! - **Complete**: the source reported exhaustion. Only
//!   [`PartialReader::reset_state`] / [`PartialReader::clear_all_state`]
//!   leave this state, returning the source to Unseen.
//!
//! The reader also owns the auto-load heuristic: once the ratio of annotated
//! to delivered items crosses the configured threshold, another batch should
//! be pulled.
//!
//! One non-reentrant mutex guards the state map. Public methods lock it once
//! and never call each other while holding it; the private `save` helper is
//! handed the guarded map.
//!
//! State is persisted to `partial_state.json` in the output directory after
//! every mutation:
//!
//! ```json
//! { "version": 1, "sources": [ { "sourceId": "...", "itemsLoaded": 0, "totalEstimate": null,
//!   "filePosition": null, "lineNumber": null, "isComplete": false,
//!   "lastLoadedAt": null, "metadata": {} } ] }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::cache::write_atomic;
use crate::config::PartialLoadingConfig;

pub const PARTIAL_STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "partial_state.json";

/// Progress of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialReadState {
    pub source_id: String,
    /// Items added so far; never decreases.
    pub items_loaded: u64,
    pub total_estimate: Option<u64>,
    /// Optional byte cursor for connectors that can seek.
    pub file_position: Option<u64>,
    pub line_number: Option<u64>,
    pub is_complete: bool,
    pub last_loaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PartialReadState {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            items_loaded: 0,
            total_estimate: None,
            file_position: None,
            line_number: None,
            is_complete: false,
            last_loaded_at: None,
            metadata: Map::new(),
        }
    }
}

/// Arguments for [`PartialReader::update_state`] beyond the item count.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub file_position: Option<u64>,
    pub line_number: Option<u64>,
    /// Raises the completion flag when `true`; `false`/`None` never lowers it.
    pub is_complete: Option<bool>,
    pub total_estimate: Option<u64>,
}

/// Aggregate view for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PartialStats {
    pub enabled: bool,
    pub initial_count: usize,
    pub batch_size: usize,
    pub auto_load_threshold: f64,
    pub auto_load_enabled: bool,
    pub tracked_sources: usize,
    pub complete_sources: usize,
    pub total_items_loaded: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    sources: Vec<PartialReadState>,
}

/// Persisted per-source read positions and the auto-load policy.
#[derive(Debug)]
pub struct PartialReader {
    config: PartialLoadingConfig,
    output_dir: PathBuf,
    states: Mutex<HashMap<String, PartialReadState>>,
}

impl PartialReader {
    /// Load (or start) the state file in `output_dir`.
    pub fn new(config: PartialLoadingConfig, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let states = load_states(&output_dir.join(STATE_FILE));
        debug!(sources = states.len(), "loaded partial read state");

        Ok(Self {
            config,
            output_dir,
            states: Mutex::new(states),
        })
    }

    pub fn config(&self) -> &PartialLoadingConfig {
        &self.config
    }

    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join(STATE_FILE)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PartialReadState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of a source's state, if it has one.
    pub fn get_state(&self, source_id: &str) -> Option<PartialReadState> {
        self.lock().get(source_id).cloned()
    }

    /// State for `source_id`, creating an Active state with zero items if needed.
    pub fn get_or_create_state(&self, source_id: &str) -> Result<PartialReadState> {
        let mut states = self.lock();
        if let Some(state) = states.get(source_id) {
            return Ok(state.clone());
        }
        let state = PartialReadState::new(source_id);
        states.insert(source_id.to_string(), state.clone());
        self.save(&states)?;
        Ok(state)
    }

    /// Record a finished read: add `items_added` to the running total,
    /// optionally move the cursor, raise completion and refresh the estimate.
    pub fn update_state(
        &self,
        source_id: &str,
        items_added: u64,
        update: StateUpdate,
    ) -> Result<PartialReadState> {
        let mut states = self.lock();
        let state = states
            .entry(source_id.to_string())
            .or_insert_with(|| PartialReadState::new(source_id));

        state.items_loaded = state.items_loaded.saturating_add(items_added);
        if update.file_position.is_some() {
            state.file_position = update.file_position;
        }
        if update.line_number.is_some() {
            state.line_number = update.line_number;
        }
        if update.is_complete == Some(true) {
            state.is_complete = true;
        }
        if update.total_estimate.is_some() {
            state.total_estimate = update.total_estimate;
        }
        state.last_loaded_at = Some(Utc::now());

        let snapshot = state.clone();
        self.save(&states)?;

        debug!(
            source_id,
            items_added,
            items_loaded = snapshot.items_loaded,
            complete = snapshot.is_complete,
            "partial state updated"
        );
        Ok(snapshot)
    }

    /// Position to resume reading from.
    pub fn get_start_position(&self, source_id: &str) -> u64 {
        self.lock()
            .get(source_id)
            .map(|s| s.items_loaded)
            .unwrap_or(0)
    }

    /// Batch size for the next read; the caller says whether this is the first load.
    pub fn get_load_count(&self, _source_id: &str, is_initial: bool) -> usize {
        if is_initial {
            self.config.initial_count
        } else {
            self.config.batch_size
        }
    }

    pub fn is_complete(&self, source_id: &str) -> bool {
        self.lock()
            .get(source_id)
            .is_some_and(|s| s.is_complete)
    }

    /// Whether annotation progress justifies pulling another batch for `source_id`.
    pub fn should_load_more(&self, source_id: &str, annotated_count: u64, total_loaded: u64) -> bool {
        if !self.config.auto_load_enabled {
            return false;
        }
        if self.is_complete(source_id) {
            return false;
        }
        if total_loaded == 0 {
            return false;
        }
        let ratio = annotated_count as f64 / total_loaded as f64;
        ratio >= self.config.auto_load_threshold
    }

    /// Forget a source, returning it to Unseen.
    pub fn reset_state(&self, source_id: &str) -> Result<bool> {
        let mut states = self.lock();
        let removed = states.remove(source_id).is_some();
        if removed {
            self.save(&states)?;
            debug!(source_id, "partial state reset");
        }
        Ok(removed)
    }

    pub fn clear_all_state(&self) -> Result<usize> {
        let mut states = self.lock();
        let count = states.len();
        states.clear();
        self.save(&states)?;
        Ok(count)
    }

    pub fn get_stats(&self) -> PartialStats {
        let states = self.lock();
        PartialStats {
            enabled: self.config.enabled,
            initial_count: self.config.initial_count,
            batch_size: self.config.batch_size,
            auto_load_threshold: self.config.auto_load_threshold,
            auto_load_enabled: self.config.auto_load_enabled,
            tracked_sources: states.len(),
            complete_sources: states.values().filter(|s| s.is_complete).count(),
            total_items_loaded: states.values().map(|s| s.items_loaded).sum(),
        }
    }

    fn save(&self, states: &HashMap<String, PartialReadState>) -> Result<()> {
        let mut sources: Vec<PartialReadState> = states.values().cloned().collect();
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        let file = StateFile {
            version: PARTIAL_STATE_VERSION,
            sources,
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.output_dir, &self.state_path(), &json)
            .context("Failed to write partial read state")
    }
}

fn load_states(path: &Path) -> HashMap<String, PartialReadState> {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read partial state");
            }
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<StateFile>(&content) {
        Ok(file) => file
            .sources
            .into_iter()
            .map(|s| (s.source_id.clone(), s))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt partial state, starting fresh");
            HashMap::new()
        }
    }
}
