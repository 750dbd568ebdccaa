//! HTTP(S) connector.
//!
//! Downloads one payload from a URL and decodes it with the shared
//! [`formats`](crate::formats) module. Payloads go through the cache when
//! it is enabled: a HEAD request supplies the ETag / Last-Modified used to
//! validate the cached copy before any GET is issued.
//!
//! # Configuration
//!
//! ```toml
//! [[data_sources]]
//! type = "url"
//! url = "https://example.com/batch.jsonl"
//! format = "jsonl"                 # optional
//! items_key = "data"               # JSON only
//! timeout_seconds = 30
//! cache_ttl_seconds = 600          # overrides [cache].ttl_seconds
//!
//! [data_sources.headers]
//! Authorization = "Bearer ${API_TOKEN}"
//! ```

use anyhow::{bail, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CacheManager;
use crate::fetch::{fetch_cached, HttpEndpoint, PayloadSlot, RemoteEndpoint};
use crate::formats::ItemFormat;
use crate::models::SourceConfig;
use crate::traits::{Capabilities, DataSource, ItemIter, SourceContext};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct UrlSource {
    config: SourceConfig,
    endpoint: HttpEndpoint,
    cache: Option<Arc<CacheManager>>,
    cache_ttl_seconds: Option<i64>,
    slot: PayloadSlot,
}

impl UrlSource {
    pub const CAPABILITIES: Capabilities = Capabilities {
        description: "Items downloaded from an HTTP(S) URL",
        partial_reading: true,
        remote: true,
    };

    pub fn new(config: SourceConfig, ctx: &SourceContext) -> Result<Self> {
        let Some(url) = config.get_str("url").map(str::to_string) else {
            bail!("url source '{}' has no 'url'", config.id);
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("url source '{}' needs an http(s) URL, got '{}'", config.id, url);
        }

        let timeout = config.get_u64("timeout_seconds").unwrap_or(DEFAULT_TIMEOUT_SECS);
        let endpoint = HttpEndpoint::new(&url, headers(&config), Duration::from_secs(timeout))?;
        let slot = PayloadSlot::new(
            &url,
            config.get_str("format").map(str::to_string),
            config.get_str("items_key").map(str::to_string),
        );

        Ok(Self {
            cache_ttl_seconds: config.get_i64("cache_ttl_seconds"),
            cache: ctx.cache.clone(),
            config,
            endpoint,
            slot,
        })
    }
}

/// String-valued entries of the `headers` table.
fn headers(config: &SourceConfig) -> Vec<(String, String)> {
    config
        .raw
        .get("headers")
        .and_then(Value::as_object)
        .map(|table| {
            table
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl DataSource for UrlSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        if let Some(cache) = &self.cache {
            if cache.get(&self.config.id).is_some() {
                return true;
            }
        }
        match self.endpoint.probe() {
            Ok(_) => true,
            Err(e) => {
                debug!(source_id = %self.config.id, error = %e, "url probe failed");
                false
            }
        }
    }

    fn read_items(&mut self, start: usize, count: Option<usize>) -> Result<ItemIter<'_>> {
        let cache = self.cache.as_deref();
        let endpoint = &self.endpoint;
        let source_id = self.config.id.as_str();
        let ttl = self.cache_ttl_seconds;
        self.slot
            .read(start, count, || fetch_cached(cache, source_id, endpoint, ttl))
    }

    fn total_count(&self) -> Option<usize> {
        self.slot.count()
    }

    fn supports_partial_reading(&self) -> bool {
        true
    }

    fn validate_config(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(format) = self.config.get_str("format") {
            if ItemFormat::from_name(format).is_none() {
                problems.push(format!("unsupported format '{}'", format));
            }
        }
        if self.config.get_u64("timeout_seconds") == Some(0) {
            problems.push("'timeout_seconds' must be positive".to_string());
        }
        problems
    }

    fn refresh(&mut self) -> bool {
        self.slot.clear();
        true
    }

    fn close(&mut self) {
        self.slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialResolver;
    use crate::fetch::test_server;
    use serde_json::json;
    use tempfile::TempDir;

    fn context(cache: Option<Arc<CacheManager>>) -> SourceContext {
        SourceContext::new(cache, Arc::new(CredentialResolver::new()), "id")
    }

    fn config(raw: Value) -> SourceConfig {
        SourceConfig::from_raw(raw.as_object().cloned().unwrap(), 0).unwrap()
    }

    fn jsonl_server() -> test_server::TestServer {
        test_server::spawn(Box::new(|target: &str| {
            target.starts_with("/items.jsonl").then(|| {
                let body: String = (0..5).map(|i| format!("{{\"id\": {}}}\n", i)).collect();
                ("application/x-ndjson".to_string(), body)
            })
        }))
    }

    #[test]
    fn rejects_missing_or_non_http_url() {
        assert!(UrlSource::new(config(json!({ "type": "url" })), &context(None)).is_err());
        assert!(UrlSource::new(
            config(json!({ "type": "url", "url": "ftp://x/y" })),
            &context(None)
        )
        .is_err());
    }

    #[test]
    fn headers_table_is_collected() {
        let cfg = config(json!({
            "type": "url",
            "url": "https://x.test/a.json",
            "headers": { "Authorization": "Bearer t", "X-Num": 3 }
        }));
        assert_eq!(
            headers(&cfg),
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );
    }

    #[test]
    fn downloads_once_and_serves_slices() {
        let server = jsonl_server();
        let url = format!("{}/items.jsonl", server.base_url);
        let mut src = UrlSource::new(config(json!({ "type": "url", "url": url })), &context(None)).unwrap();

        assert!(src.is_available());
        assert_eq!(src.read_items(0, Some(2)).unwrap().count(), 2);
        assert_eq!(src.read_items(2, None).unwrap().count(), 3);
        assert_eq!(src.total_count(), Some(5));
        assert_eq!(server.get_count(), 1);

        src.refresh();
        assert_eq!(src.total_count(), None);
        assert_eq!(src.read_items(4, None).unwrap().count(), 1);
        assert_eq!(server.get_count(), 2);
    }

    #[test]
    fn cache_serves_unchanged_payload_after_refresh() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(CacheManager::new(tmp.path(), 3600, 10_000_000).unwrap());
        let server = jsonl_server();
        let url = format!("{}/items.jsonl", server.base_url);
        let mut src = UrlSource::new(
            config(json!({ "type": "url", "id": "remote", "url": url })),
            &context(Some(cache.clone())),
        )
        .unwrap();

        assert_eq!(src.read_items(0, None).unwrap().count(), 5);
        assert!(cache.get("remote").is_some());

        src.refresh();
        assert_eq!(src.read_items(0, None).unwrap().count(), 5);
        assert_eq!(server.get_count(), 1);
    }

    #[test]
    fn unreachable_url_is_unavailable() {
        let server = jsonl_server();
        let url = format!("{}/missing.jsonl", server.base_url);
        let mut src = UrlSource::new(config(json!({ "type": "url", "url": url })), &context(None)).unwrap();
        assert!(!src.is_available());
        assert!(src.read_items(0, None).is_err());
    }
}
