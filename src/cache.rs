//! Local file cache for payloads fetched by remote connectors.
//!
//! Each source id owns at most one live [`CacheEntry`]. Payload files live
//! directly under the cache directory, named by a hash of
//! `"{source_id}:{source_url}"` plus an extension inferred from the content
//! type (falling back to the URL's extension). An index file,
//! `cache_index.json`, records every entry:
//!
//! ```json
//! { "version": 1, "entries": [ { "sourceId": "...", "sourceUrl": "...", "cachePath": "...",
//!   "etag": null, "lastModified": null, "createdAt": "...", "expiresAt": "...",
//!   "fileSize": 0, "contentType": null, "metadata": {} } ] }
//! ```
//!
//! # Validity
//!
//! An entry is served only while its file exists and it has not expired.
//! [`CacheManager::get_if_valid`] additionally compares ETag / Last-Modified
//! values freshly observed from the remote side.
//!
//! # Eviction
//!
//! After every put the total size is checked against the bound; entries are
//! removed oldest-created first until the total fits. Reads never refresh an
//! entry's position.
//!
//! # Persistence and locking
//!
//! The index is rewritten (write-to-temp + rename) before every mutating call
//! returns. All operations run under one mutex per manager. The mutex is not
//! reentrant: a public method never calls another locking method while it
//! holds the guard, and private helpers take the guarded map as an argument.
//! The directory must not be shared between processes: there is no
//! cross-process lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

pub const CACHE_INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = "cache_index.json";

/// Metadata for one cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub source_id: String,
    pub source_url: String,
    pub cache_path: PathBuf,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub file_size: u64,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// File present and not expired.
    pub fn is_valid(&self) -> bool {
        self.cache_path.exists() && !self.is_expired()
    }

    /// Read the cached payload.
    pub fn read(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.cache_path)
            .with_context(|| format!("Failed to read cache file: {}", self.cache_path.display()))
    }
}

/// Optional attributes for [`CacheManager::put`] and [`CacheManager::put_file`].
#[derive(Debug, Clone, Default)]
pub struct CachePutOptions {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    /// Overrides the manager's default TTL; `<= 0` means never expire.
    pub ttl_seconds: Option<i64>,
    pub metadata: Map<String, Value>,
}

/// Snapshot of cache usage for status output.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub expired_count: usize,
    pub ttl_seconds: i64,
    pub max_size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    #[serde(default)]
    entries: Vec<CacheEntry>,
}

/// Content-addressed payload cache with TTL, validators and a size bound.
#[derive(Debug)]
pub struct CacheManager {
    cache_dir: PathBuf,
    default_ttl_seconds: i64,
    max_size_bytes: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheManager {
    /// Open (or create) a cache directory and load its index.
    ///
    /// Entries whose payload file has disappeared are dropped silently and
    /// the index is rewritten without them. An unreadable index is logged and
    /// replaced by an empty one.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        default_ttl_seconds: i64,
        max_size_bytes: u64,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;

        let (entries, dropped) = load_index(&cache_dir.join(INDEX_FILE));

        let manager = Self {
            cache_dir,
            default_ttl_seconds,
            max_size_bytes,
            entries: Mutex::new(entries),
        };

        if dropped > 0 {
            debug!(dropped, "dropped cache entries with missing files");
            let entries = manager.lock();
            manager.save_index(&entries)?;
        }

        Ok(manager)
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(
            &config.cache_dir,
            config.ttl_seconds,
            config.max_size_bytes(),
        )
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Valid entry for `source_id`, if any.
    ///
    /// Missing and expired entries are indistinguishable to the caller.
    pub fn get(&self, source_id: &str) -> Option<CacheEntry> {
        let entries = self.lock();
        entries
            .get(source_id)
            .filter(|entry| entry.is_valid())
            .cloned()
    }

    /// Like [`get`](Self::get), but a supplied validator that does not match
    /// the stored one is a miss.
    pub fn get_if_valid(
        &self,
        source_id: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Option<CacheEntry> {
        let entry = self.get(source_id)?;

        if let Some(etag) = etag {
            if entry.etag.as_deref() != Some(etag) {
                debug!(source_id, "cache miss: etag changed");
                return None;
            }
        }
        if let Some(last_modified) = last_modified {
            if entry.last_modified.as_deref() != Some(last_modified) {
                debug!(source_id, "cache miss: last-modified changed");
                return None;
            }
        }

        Some(entry)
    }

    /// Store `bytes` as the payload for `source_id`, replacing any prior entry.
    pub fn put(
        &self,
        source_id: &str,
        source_url: &str,
        bytes: &[u8],
        options: CachePutOptions,
    ) -> Result<CacheEntry> {
        let mut entries = self.lock();
        let path = self.payload_path(source_id, source_url, options.content_type.as_deref());

        write_atomic(&self.cache_dir, &path, bytes)?;
        self.release_previous(&mut entries, source_id, &path);

        self.record(&mut entries, source_id, source_url, path, bytes.len() as u64, options)
    }

    /// Store an existing file as the payload for `source_id`.
    ///
    /// With `move_file` the file is renamed into the cache instead of copied.
    pub fn put_file(
        &self,
        source_id: &str,
        source_url: &str,
        file: &Path,
        options: CachePutOptions,
        move_file: bool,
    ) -> Result<CacheEntry> {
        let mut entries = self.lock();
        let path = self.payload_path(source_id, source_url, options.content_type.as_deref());

        if move_file {
            if let Err(e) = std::fs::rename(file, &path) {
                // Cross-device moves fail with rename; fall back to copy + remove.
                debug!(error = %e, "rename into cache failed, copying instead");
                std::fs::copy(file, &path).with_context(|| {
                    format!("Failed to copy {} into cache", file.display())
                })?;
                std::fs::remove_file(file).with_context(|| {
                    format!("Failed to remove moved file {}", file.display())
                })?;
            }
        } else {
            std::fs::copy(file, &path)
                .with_context(|| format!("Failed to copy {} into cache", file.display()))?;
        }

        let size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat cache file: {}", path.display()))?
            .len();
        self.release_previous(&mut entries, source_id, &path);

        self.record(&mut entries, source_id, source_url, path, size, options)
    }

    /// Remove the entry for `source_id` and its file. Returns whether anything was removed.
    pub fn invalidate(&self, source_id: &str) -> Result<bool> {
        let mut entries = self.lock();
        let removed = remove_entry(&mut entries, source_id);
        if removed {
            self.save_index(&entries)?;
            debug!(source_id, "cache entry invalidated");
        }
        Ok(removed)
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> Result<usize> {
        let mut entries = self.lock();
        let ids: Vec<String> = entries.keys().cloned().collect();
        for id in &ids {
            remove_entry(&mut entries, id);
        }
        self.save_index(&entries)?;
        info!(removed = ids.len(), "cache cleared");
        Ok(ids.len())
    }

    /// Remove expired entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let mut entries = self.lock();
        let now = Utc::now();
        let expired: Vec<String> = entries
            .values()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.source_id.clone())
            .collect();

        for id in &expired {
            remove_entry(&mut entries, id);
        }
        if !expired.is_empty() {
            self.save_index(&entries)?;
            info!(removed = expired.len(), "expired cache entries removed");
        }
        Ok(expired.len())
    }

    pub fn get_stats(&self) -> CacheStats {
        let entries = self.lock();
        let now = Utc::now();
        CacheStats {
            cache_dir: self.cache_dir.clone(),
            entry_count: entries.len(),
            total_size_bytes: entries.values().map(|e| e.file_size).sum(),
            expired_count: entries.values().filter(|e| e.is_expired_at(now)).count(),
            ttl_seconds: self.default_ttl_seconds,
            max_size_bytes: self.max_size_bytes,
        }
    }

    /// Deterministic payload path for a source id and URL.
    pub fn payload_path(
        &self,
        source_id: &str,
        source_url: &str,
        content_type: Option<&str>,
    ) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", source_id, source_url).as_bytes());
        let digest = hex::encode(hasher.finalize());
        let ext = extension_for(content_type, source_url);
        self.cache_dir.join(format!("{}{}", &digest[..32], ext))
    }

    /// Drop the previous entry's file when it lives at a different path.
    fn release_previous(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        source_id: &str,
        new_path: &Path,
    ) {
        if let Some(previous) = entries.remove(source_id) {
            if previous.cache_path != new_path {
                remove_file_quietly(&previous.cache_path);
            }
        }
    }

    fn record(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        source_id: &str,
        source_url: &str,
        cache_path: PathBuf,
        file_size: u64,
        options: CachePutOptions,
    ) -> Result<CacheEntry> {
        let created_at = Utc::now();
        let ttl = options.ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let expires_at = (ttl > 0).then(|| created_at + Duration::seconds(ttl));

        let entry = CacheEntry {
            source_id: source_id.to_string(),
            source_url: source_url.to_string(),
            cache_path,
            etag: options.etag,
            last_modified: options.last_modified,
            created_at,
            expires_at,
            file_size,
            content_type: options.content_type,
            metadata: options.metadata,
        };

        entries.insert(source_id.to_string(), entry.clone());
        self.save_index(entries)?;
        debug!(source_id, bytes = file_size, "cached payload");

        self.enforce_size_limit(entries)?;
        Ok(entry)
    }

    fn enforce_size_limit(&self, entries: &mut HashMap<String, CacheEntry>) -> Result<()> {
        let mut total: u64 = entries.values().map(|e| e.file_size).sum();
        if total <= self.max_size_bytes {
            return Ok(());
        }

        let mut by_age: Vec<(DateTime<Utc>, String, u64)> = entries
            .values()
            .map(|e| (e.created_at, e.source_id.clone(), e.file_size))
            .collect();
        by_age.sort();

        for (_, id, size) in by_age {
            if total <= self.max_size_bytes {
                break;
            }
            remove_entry(entries, &id);
            total = total.saturating_sub(size);
            info!(source_id = %id, bytes = size, "evicted cache entry to respect size bound");
        }

        self.save_index(entries)
    }

    fn save_index(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        let mut sorted: Vec<CacheEntry> = entries.values().cloned().collect();
        sorted.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let index = CacheIndex {
            version: CACHE_INDEX_VERSION,
            entries: sorted,
        };
        let json = serde_json::to_vec_pretty(&index)?;
        write_atomic(&self.cache_dir, &self.cache_dir.join(INDEX_FILE), &json)
            .context("Failed to write cache index")
    }
}

/// Load the index, keeping only entries whose files exist. Returns the entries and the drop count.
fn load_index(path: &Path) -> (HashMap<String, CacheEntry>, usize) {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (HashMap::new(), 0),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read cache index, starting empty");
            return (HashMap::new(), 0);
        }
    };

    let index: CacheIndex = match serde_json::from_slice(&content) {
        Ok(index) => index,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cache index, starting empty");
            return (HashMap::new(), 0);
        }
    };

    let mut dropped = 0;
    let mut entries = HashMap::new();
    for entry in index.entries {
        if entry.cache_path.exists() {
            entries.insert(entry.source_id.clone(), entry);
        } else {
            dropped += 1;
        }
    }
    (entries, dropped)
}

fn remove_entry(entries: &mut HashMap<String, CacheEntry>, source_id: &str) -> bool {
    match entries.remove(source_id) {
        Some(entry) => {
            remove_file_quietly(&entry.cache_path);
            true
        }
        None => false,
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

/// Write via a temp file in `dir` and rename over `path`.
pub(crate) fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// File extension (with leading dot) for a payload, or an empty string.
fn extension_for(content_type: Option<&str>, url: &str) -> String {
    if let Some(ct) = content_type {
        let base = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        let ext = match base.as_str() {
            "application/json" => Some("json"),
            "application/x-ndjson" | "application/jsonl" | "application/jsonlines"
            | "application/x-jsonlines" => Some("jsonl"),
            "text/csv" => Some("csv"),
            "text/tab-separated-values" => Some("tsv"),
            "text/plain" => Some("txt"),
            "application/xml" | "text/xml" => Some("xml"),
            "text/html" => Some("html"),
            "application/vnd.apache.parquet" | "application/x-parquet" => Some("parquet"),
            "application/zip" => Some("zip"),
            "application/gzip" => Some("gz"),
            _ => None,
        };
        if let Some(ext) = ext {
            return format!(".{}", ext);
        }
    }

    url_extension(url)
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Lowercased trailing extension of a URL path, if it looks like one.
pub(crate) fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
