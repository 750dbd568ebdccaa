//! Local file connector.
//!
//! Reads items from a single file, or from every matching file under a
//! directory. Files are visited in sorted relative-path order so that
//! positional resume is stable across runs.
//!
//! # Configuration
//!
//! ```toml
//! [[data_sources]]
//! type = "file"
//! path = "./data/items.jsonl"    # file or directory
//! format = "jsonl"               # optional; inferred from the extension
//! items_key = "data"             # JSON only: list location inside an object
//! include_globs = ["**/*.jsonl"] # directory mode only
//! exclude_globs = ["drafts/**"]
//! ```

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ReadError;
use crate::formats::{count_items, decode_items, ItemFormat};
use crate::models::SourceConfig;
use crate::traits::{slice_items, Capabilities, DataSource, ItemIter, SourceContext};

const DEFAULT_INCLUDE: &[&str] = &["**/*.jsonl", "**/*.ndjson", "**/*.json", "**/*.csv", "**/*.tsv"];
const DEFAULT_EXCLUDE: &[&str] = &["**/.git/**", "**/node_modules/**"];

pub struct FileSource {
    config: SourceConfig,
    path: Option<PathBuf>,
    format: Option<String>,
    items_key: Option<String>,
    include_globs: Vec<String>,
    exclude_globs: Vec<String>,
    total: OnceLock<Option<usize>>,
}

impl FileSource {
    pub const CAPABILITIES: Capabilities = Capabilities {
        description: "Local JSON, JSON Lines, CSV or TSV files",
        partial_reading: true,
        remote: false,
    };

    pub fn new(config: SourceConfig, _ctx: &SourceContext) -> Self {
        let path = config.get_str("path").map(PathBuf::from);
        let format = config.get_str("format").map(str::to_string);
        let items_key = config.get_str("items_key").map(str::to_string);

        let mut include_globs = config.get_str_list("include_globs");
        if include_globs.is_empty() {
            include_globs = DEFAULT_INCLUDE.iter().map(|g| g.to_string()).collect();
        }
        let mut exclude_globs: Vec<String> = DEFAULT_EXCLUDE.iter().map(|g| g.to_string()).collect();
        exclude_globs.extend(config.get_str_list("exclude_globs"));

        Self {
            config,
            path,
            format,
            items_key,
            include_globs,
            exclude_globs,
            total: OnceLock::new(),
        }
    }

    fn root(&self) -> Result<&Path> {
        match &self.path {
            Some(path) => Ok(path),
            None => bail!("file source '{}' has no 'path'", self.config.id),
        }
    }

    /// Files to read, in order.
    fn files(&self) -> Result<Vec<PathBuf>> {
        let root = self.root()?;
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }
        if !root.is_dir() {
            bail!("path does not exist: {}", root.display());
        }

        let include_set = build_globset(&self.include_globs)?;
        let exclude_set = build_globset(&self.exclude_globs)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        Ok(files)
    }

    fn format_for(&self, path: &Path) -> Result<ItemFormat> {
        ItemFormat::resolve(self.format.as_deref(), &path.to_string_lossy(), None)
    }

    fn count_all(&self) -> Result<usize> {
        let mut total = 0;
        for path in self.files()? {
            let file = open(&path)?;
            total += count_items(file, self.format_for(&path)?, self.items_key.as_deref())
                .with_context(|| format!("Failed to count items in {}", path.display()))?;
        }
        Ok(total)
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl DataSource for FileSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        self.path.as_ref().is_some_and(|p| p.exists())
    }

    fn read_items(&mut self, start: usize, count: Option<usize>) -> Result<ItemIter<'_>> {
        let mut decoders = Vec::new();
        for path in self.files()? {
            let format = self.format_for(&path)?;
            decoders.push((path, format));
        }
        debug!(source_id = %self.config.id, files = decoders.len(), start, "reading files");

        let items_key = self.items_key.clone();
        let items = decoders.into_iter().flat_map(move |(path, format)| {
            let decoded = open(&path).and_then(|file| decode_items(file, format, items_key.as_deref()));
            let iter: ItemIter<'static> = match decoded {
                Ok(iter) => iter,
                Err(e) => Box::new(std::iter::once(Err(ReadError::Source(e)))),
            };
            iter
        });
        Ok(slice_items(items, start, count))
    }

    fn total_count(&self) -> Option<usize> {
        *self.total.get_or_init(|| match self.count_all() {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(source_id = %self.config.id, error = %e, "total count unavailable");
                None
            }
        })
    }

    fn supports_partial_reading(&self) -> bool {
        true
    }

    fn validate_config(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.path.is_none() {
            problems.push("'path' is required".to_string());
        }
        if let Some(format) = &self.format {
            if ItemFormat::from_name(format).is_none() {
                problems.push(format!("unsupported format '{}'", format));
            }
        }
        for pattern in self.include_globs.iter().chain(&self.exclude_globs) {
            if let Err(e) = Glob::new(pattern) {
                problems.push(format!("invalid glob '{}': {}", pattern, e));
            }
        }
        problems
    }

    fn refresh(&mut self) -> bool {
        self.total = OnceLock::new();
        true
    }
}
