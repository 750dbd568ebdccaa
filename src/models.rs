//! Core data models shared by the registry, connectors and orchestrator.

use serde::Serialize;
use serde_json::{Map, Value};

/// A single annotation item: a string-keyed record.
///
/// Every item must carry the configured id field (see
/// [`ItemPropertiesConfig::id_key`](crate::config::ItemPropertiesConfig)).
pub type Item = Map<String, Value>;

/// Typed configuration for one data source.
///
/// Built by the orchestrator from a raw `[[data_sources]]` table after
/// credential substitution. The `raw` map keeps every key, including the
/// type-specific ones that only the connector understands.
#[derive(Debug, Clone, Serialize)]
pub struct SourceConfig {
    /// Registered type tag, e.g. `"file"` or `"url"`.
    pub source_type: String,
    /// Unique source id; derived from type, index and location when absent.
    pub id: String,
    pub enabled: bool,
    pub raw: Map<String, Value>,
}

impl SourceConfig {
    /// Build a config from a raw table at position `index` in the source list.
    ///
    /// Fails only when the `type` key is missing or not a string.
    pub fn from_raw(raw: Map<String, Value>, index: usize) -> anyhow::Result<Self> {
        let source_type = raw
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("data source #{} has no 'type'", index))?
            .to_string();

        let id = match raw.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => derive_source_id(&source_type, index, &raw),
        };

        let enabled = raw.get("enabled").and_then(Value::as_bool).unwrap_or(true);

        Ok(Self {
            source_type,
            id,
            enabled,
            raw,
        })
    }

    /// String value for `key`, if present and non-empty.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.raw.get(key).and_then(Value::as_u64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.raw.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.raw.get(key).and_then(Value::as_bool)
    }

    /// List of strings for `key`; non-string entries are ignored.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.raw
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Path or URL this source points at, used for id derivation and logs.
    pub fn location(&self) -> Option<&str> {
        ["path", "url", "key", "dataset", "spreadsheet_id", "table"]
            .iter()
            .find_map(|k| self.get_str(k))
    }
}

/// Derive a stable id such as `file_0_items` from type, index and location.
pub fn derive_source_id(source_type: &str, index: usize, raw: &Map<String, Value>) -> String {
    let location = ["path", "url", "key", "dataset", "spreadsheet_id", "table"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(Value::as_str));

    let stem = location.map(location_stem).filter(|s| !s.is_empty());

    match stem {
        Some(stem) => format!("{}_{}_{}", source_type, index, stem),
        None => format!("{}_{}", source_type, index),
    }
}

/// Last path segment without query string or extension, reduced to `[A-Za-z0-9_-]`.
fn location_stem(location: &str) -> String {
    let without_query = location
        .split(['?', '#'])
        .next()
        .unwrap_or(location)
        .trim_end_matches('/');
    let segment = without_query.rsplit(['/', '\\']).next().unwrap_or("");
    let stem = match segment.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => segment,
    };
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Extract the instance id of `item` under `id_key`.
///
/// Strings are used verbatim, numbers and booleans are rendered; `null`,
/// empty strings and nested values count as missing.
pub fn item_id(item: &Item, id_key: &str) -> Option<String> {
    match item.get(id_key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn explicit_id_is_kept() {
        let cfg = SourceConfig::from_raw(raw(json!({"type": "file", "id": "main"})), 3).unwrap();
        assert_eq!(cfg.id, "main");
        assert!(cfg.enabled);
    }

    #[test]
    fn id_derived_from_path() {
        let cfg =
            SourceConfig::from_raw(raw(json!({"type": "file", "path": "data/items.jsonl"})), 0)
                .unwrap();
        assert_eq!(cfg.id, "file_0_items");
    }

    #[test]
    fn id_derived_from_url_strips_query() {
        let cfg = SourceConfig::from_raw(
            raw(json!({"type": "url", "url": "https://x.test/dump/batch.v2.csv?token=abc"})),
            2,
        )
        .unwrap();
        assert_eq!(cfg.id, "url_2_batch_v2");
    }

    #[test]
    fn id_without_location() {
        let cfg = SourceConfig::from_raw(raw(json!({"type": "custom"})), 5).unwrap();
        assert_eq!(cfg.id, "custom_5");
    }

    #[test]
    fn missing_type_fails() {
        assert!(SourceConfig::from_raw(raw(json!({"path": "a.jsonl"})), 0).is_err());
    }

    #[test]
    fn disabled_flag() {
        let cfg =
            SourceConfig::from_raw(raw(json!({"type": "file", "enabled": false})), 0).unwrap();
        assert!(!cfg.enabled);
    }

    #[test]
    fn item_id_variants() {
        let item = raw(json!({"id": 7, "name": "x", "empty": "", "nested": {"a": 1}}));
        assert_eq!(item_id(&item, "id").as_deref(), Some("7"));
        assert_eq!(item_id(&item, "name").as_deref(), Some("x"));
        assert_eq!(item_id(&item, "empty"), None);
        assert_eq!(item_id(&item, "nested"), None);
        assert_eq!(item_id(&item, "missing"), None);
    }
}
