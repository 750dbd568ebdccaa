//! Item stores: where unique items end up.
//!
//! The orchestrator only needs [`ItemStore::has_item`] for dedup and
//! [`ItemStore::add_item`] for insertion. A rejected insertion is a per-item
//! problem: the orchestrator logs it and carries on with the batch.
//!
//! | Store | Persistence | Used by |
//! |-------|-------------|---------|
//! | [`MemoryItemStore`] | none | tests, embedding hosts |
//! | [`JsonlItemStore`] | append-only `items.jsonl` | the `ingest` CLI |

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

use crate::models::Item;

pub const ITEMS_FILE: &str = "items.jsonl";

/// Destination for ingested items, keyed by instance id.
pub trait ItemStore: Send + Sync {
    fn has_item(&self, item_id: &str) -> bool;

    /// Insert a new item. Errors mean the item was rejected.
    fn add_item(&self, item_id: &str, item: Item) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store preserving insertion order.
#[derive(Default)]
pub struct MemoryItemStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    order: Vec<String>,
    items: HashMap<String, Item>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item_id: &str) -> Option<Item> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.items.get(item_id).cloned()
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.order.clone()
    }
}

impl ItemStore for MemoryItemStore {
    fn has_item(&self, item_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.items.contains_key(item_id)
    }

    fn add_item(&self, item_id: &str, item: Item) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.items.contains_key(item_id) {
            bail!("item '{}' already exists", item_id);
        }
        inner.order.push(item_id.to_string());
        inner.items.insert(item_id.to_string(), item);
        Ok(())
    }

    fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.order.len()
    }
}

#[derive(Serialize)]
struct RecordRef<'a> {
    id: &'a str,
    item: &'a Item,
}

#[derive(Deserialize)]
struct RecordId {
    id: String,
}

/// Append-only JSON Lines store; one `{"id", "item"}` record per line.
pub struct JsonlItemStore {
    path: PathBuf,
    inner: Mutex<JsonlInner>,
}

struct JsonlInner {
    ids: HashSet<String>,
    file: File,
}

impl JsonlItemStore {
    /// Open (or create) `items.jsonl` under `dir`, loading the ids already present.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        let path = dir.join(ITEMS_FILE);

        let mut ids = HashSet::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecordId>(&line) {
                    Ok(record) => {
                        ids.insert(record.id);
                    }
                    Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable item record"),
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open item store: {}", path.display()))?;

        Ok(Self {
            path,
            inner: Mutex::new(JsonlInner { ids, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ItemStore for JsonlItemStore {
    fn has_item(&self, item_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.ids.contains(item_id)
    }

    fn add_item(&self, item_id: &str, item: Item) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.ids.contains(item_id) {
            bail!("item '{}' already exists", item_id);
        }
        let mut line = serde_json::to_string(&RecordRef { id: item_id, item: &item })?;
        line.push('\n');
        inner
            .file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        inner.ids.insert(item_id.to_string());
        Ok(())
    }

    fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str) -> Item {
        json!({ "id": id, "text": format!("text of {}", id) })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn memory_store_rejects_duplicates() {
        let store = MemoryItemStore::new();
        assert!(store.is_empty());
        store.add_item("a", item("a")).unwrap();
        store.add_item("b", item("b")).unwrap();
        assert!(store.add_item("a", item("a")).is_err());

        assert!(store.has_item("a"));
        assert_eq!(store.ids(), vec!["a", "b"]);
        assert_eq!(store.get("b").unwrap()["text"], "text of b");
    }

    #[test]
    fn jsonl_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = JsonlItemStore::open(tmp.path()).unwrap();
            store.add_item("a", item("a")).unwrap();
            store.add_item("b", item("b")).unwrap();
            assert_eq!(store.len(), 2);
        }

        let store = JsonlItemStore::open(tmp.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.has_item("b"));
        assert!(store.add_item("a", item("a")).is_err());
        store.add_item("c", item("c")).unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 3);
        let last: serde_json::Value = serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(last["id"], "c");
        assert_eq!(last["item"]["text"], "text of c");
    }

    #[test]
    fn jsonl_store_skips_corrupt_lines() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(ITEMS_FILE), "{\"id\": \"x\", \"item\": {}}\nnot json\n").unwrap();
        let store = JsonlItemStore::open(tmp.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.has_item("x"));
    }
}
