//! Hugging Face datasets connector.
//!
//! Pages through a dataset split with the datasets-server `/rows` API,
//! which supports native `offset`/`length` paging, so resuming never
//! re-downloads earlier rows. The total comes from `num_rows_total`.
//!
//! # Configuration
//!
//! ```toml
//! [[data_sources]]
//! type = "huggingface"
//! dataset = "imdb"
//! config = "plain_text"        # default "default"
//! split = "test"               # default "train"
//! token = "${HF_TOKEN}"        # gated / private datasets
//! page_size = 100              # at most 100
//! id_from_row_index = true     # fill a missing id with the row index
//! ```

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::error::ReadError;
use crate::models::{Item, SourceConfig};
use crate::traits::{Capabilities, DataSource, ItemIter, SourceContext};

const DEFAULT_ENDPOINT: &str = "https://datasets-server.huggingface.co";
const MAX_PAGE_SIZE: usize = 100;

pub struct HuggingFaceSource {
    config: SourceConfig,
    api: RowsApi,
    id_key: String,
    id_from_row_index: bool,
    total: Arc<OnceLock<usize>>,
}

impl HuggingFaceSource {
    pub const CAPABILITIES: Capabilities = Capabilities {
        description: "Hugging Face dataset split via datasets-server",
        partial_reading: true,
        remote: true,
    };

    pub fn new(config: SourceConfig, ctx: &SourceContext) -> Result<Self> {
        let Some(dataset) = config.get_str("dataset") else {
            bail!("huggingface source '{}' has no 'dataset'", config.id);
        };

        let page_size = config
            .get_u64("page_size")
            .map(|n| (n as usize).clamp(1, MAX_PAGE_SIZE))
            .unwrap_or(MAX_PAGE_SIZE);
        let token = ctx.credentials.get_credential(&config.raw, "token", false)?;

        let api = RowsApi {
            client: Client::builder()
                .timeout(Duration::from_secs(config.get_u64("timeout_seconds").unwrap_or(60)))
                .build()
                .context("Failed to build HTTP client")?,
            endpoint: config
                .get_str("endpoint")
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            dataset: dataset.to_string(),
            subset: config.get_str("config").unwrap_or("default").to_string(),
            split: config.get_str("split").unwrap_or("train").to_string(),
            token,
            page_size,
        };

        Ok(Self {
            id_from_row_index: config.get_bool("id_from_row_index").unwrap_or(false),
            id_key: ctx.id_key.clone(),
            config,
            api,
            total: Arc::new(OnceLock::new()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RowsPage {
    #[serde(default)]
    rows: Vec<RowEntry>,
    num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row_idx: u64,
    row: Value,
}

struct RowsApi {
    client: Client,
    endpoint: String,
    dataset: String,
    subset: String,
    split: String,
    token: Option<String>,
    page_size: usize,
}

impl RowsApi {
    fn fetch(&self, offset: usize, length: usize) -> Result<RowsPage> {
        let (offset, length) = (offset.to_string(), length.to_string());
        let mut request = self.client.get(format!("{}/rows", self.endpoint)).query(&[
            ("dataset", self.dataset.as_str()),
            ("config", self.subset.as_str()),
            ("split", self.split.as_str()),
            ("offset", offset.as_str()),
            ("length", length.as_str()),
        ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .with_context(|| format!("Failed to fetch rows of '{}'", self.dataset))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!(
                "datasets-server returned HTTP {} for '{}': {}",
                status,
                self.dataset,
                body.chars().take(500).collect::<String>()
            );
        }
        resp.json::<RowsPage>()
            .with_context(|| format!("Unexpected /rows response for '{}'", self.dataset))
    }
}

/// Lazily fetches pages until `remaining` rows were yielded or the split ends.
struct RowPages<'a> {
    api: &'a RowsApi,
    id_key: &'a str,
    id_from_row_index: bool,
    total: Arc<OnceLock<usize>>,
    offset: usize,
    remaining: Option<usize>,
    buffer: VecDeque<Result<Item, ReadError>>,
    done: bool,
}

impl RowPages<'_> {
    fn fill(&mut self) -> Result<()> {
        let length = match self.remaining {
            Some(n) => n.min(self.api.page_size),
            None => self.api.page_size,
        };
        let page = self.api.fetch(self.offset, length)?;
        if let Some(total) = page.num_rows_total {
            let _ = self.total.set(total);
        }

        let fetched = page.rows.len();
        for (i, entry) in page.rows.into_iter().enumerate() {
            let position = self.offset + i;
            self.buffer.push_back(match entry.row {
                Value::Object(mut item) => {
                    if self.id_from_row_index && !item.contains_key(self.id_key) {
                        item.insert(self.id_key.to_string(), Value::from(entry.row_idx));
                    }
                    Ok(item)
                }
                _ => Err(ReadError::malformed(position, "row is not an object")),
            });
        }

        self.offset += fetched;
        let past_end = page.num_rows_total.is_some_and(|t| self.offset >= t);
        if fetched < length || past_end {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for RowPages<'_> {
    type Item = Result<Item, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(ReadError::Source(e)));
            }
        }
        let next = self.buffer.pop_front()?;
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(next)
    }
}

impl DataSource for HuggingFaceSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        match self.api.fetch(0, 1) {
            Ok(page) => {
                if let Some(total) = page.num_rows_total {
                    let _ = self.total.set(total);
                }
                true
            }
            Err(e) => {
                debug!(source_id = %self.config.id, error = %e, "huggingface probe failed");
                false
            }
        }
    }

    fn read_items(&mut self, start: usize, count: Option<usize>) -> Result<ItemIter<'_>> {
        if let Some(total) = self.total.get() {
            if start >= *total {
                return Ok(Box::new(std::iter::empty()));
            }
        }
        Ok(Box::new(RowPages {
            api: &self.api,
            id_key: &self.id_key,
            id_from_row_index: self.id_from_row_index,
            total: self.total.clone(),
            offset: start,
            remaining: count,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn total_count(&self) -> Option<usize> {
        if let Some(total) = self.total.get() {
            return Some(*total);
        }
        let total = self.api.fetch(0, 1).ok()?.num_rows_total?;
        Some(*self.total.get_or_init(|| total))
    }

    fn supports_partial_reading(&self) -> bool {
        true
    }

    fn refresh(&mut self) -> bool {
        self.total = Arc::new(OnceLock::new());
        true
    }
}
