//! Google Sheets connector.
//!
//! Reads one worksheet through the spreadsheet's CSV export endpoint. The
//! header row supplies item keys. Public sheets need no credentials; private
//! ones take an OAuth `access_token`.
//!
//! # Configuration
//!
//! ```toml
//! [[data_sources]]
//! type = "google_sheets"
//! spreadsheet_id = "1AbC..."
//! gid = 0                           # worksheet id, default 0
//! access_token = "${GOOGLE_TOKEN}"  # optional
//! ```

use anyhow::{bail, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CacheManager;
use crate::fetch::{fetch_cached, HttpEndpoint, PayloadSlot, RemoteEndpoint};
use crate::models::SourceConfig;
use crate::traits::{Capabilities, DataSource, ItemIter, SourceContext};

const DEFAULT_BASE_URL: &str = "https://docs.google.com";

pub struct GoogleSheetsSource {
    config: SourceConfig,
    endpoint: HttpEndpoint,
    cache: Option<Arc<CacheManager>>,
    cache_ttl_seconds: Option<i64>,
    slot: PayloadSlot,
}

impl GoogleSheetsSource {
    pub const CAPABILITIES: Capabilities = Capabilities {
        description: "Google Sheets worksheet via CSV export",
        partial_reading: true,
        remote: true,
    };

    pub fn new(config: SourceConfig, ctx: &SourceContext) -> Result<Self> {
        let Some(spreadsheet_id) = config.get_str("spreadsheet_id") else {
            bail!("google_sheets source '{}' has no 'spreadsheet_id'", config.id);
        };
        let base_url = config.get_str("base_url").unwrap_or(DEFAULT_BASE_URL);
        let url = export_url(base_url, spreadsheet_id, &worksheet_gid(&config));

        let mut headers = Vec::new();
        if let Some(token) = ctx.credentials.get_credential(&config.raw, "access_token", false)? {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        let timeout = Duration::from_secs(config.get_u64("timeout_seconds").unwrap_or(30));
        let endpoint = HttpEndpoint::new(&url, headers, timeout)?;
        let slot = PayloadSlot::new(url, Some("csv".to_string()), None);

        Ok(Self {
            cache_ttl_seconds: config.get_i64("cache_ttl_seconds"),
            cache: ctx.cache.clone(),
            config,
            endpoint,
            slot,
        })
    }
}

/// `gid` may be written as a number or a string.
fn worksheet_gid(config: &SourceConfig) -> String {
    match config.raw.get("gid") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => "0".to_string(),
    }
}

fn export_url(base_url: &str, spreadsheet_id: &str, gid: &str) -> String {
    format!(
        "{}/spreadsheets/d/{}/export?format=csv&gid={}",
        base_url.trim_end_matches('/'),
        spreadsheet_id,
        gid
    )
}

impl DataSource for GoogleSheetsSource {
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
                debug!(source_id = %self.config.id, error = %e, "sheet probe failed");
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

    fn refresh(&mut self) -> bool {
        self.slot.clear();
        true
    }

    fn close(&mut self) {
        self.slot.clear();
    }
}
