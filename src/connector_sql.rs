//! SQL database connector (SQLite via `sqlx`).
//!
//! Reads rows from a table or an arbitrary query, paging with
//! `LIMIT`/`OFFSET`. Every row becomes an item keyed by column name. The
//! connector is synchronous like every other source: it owns a private
//! current-thread tokio runtime and blocks on each query.
//!
//! # Configuration
//!
//! ```toml
//! [[data_sources]]
//! type = "database"
//! url = "sqlite:./data/corpus.db"
//! table = "documents"          # or: query = "SELECT id, body AS text FROM docs"
//! order_by = "id"              # default: rowid for tables
//! page_size = 500
//! ```
//!
//! Results must come back in a stable order for resume to work, so tables
//! are always ordered (by `rowid` unless `order_by` is given).

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::OnceLock;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::ReadError;
use crate::models::{Item, SourceConfig};
use crate::traits::{Capabilities, DataSource, ItemIter, SourceContext};

const DEFAULT_PAGE_SIZE: usize = 500;

pub struct SqlSource {
    config: SourceConfig,
    // Dropped before the runtime it was created on.
    pool: SqlitePool,
    runtime: Runtime,
    /// Table name, or a parenthesised query.
    from: String,
    order_by: Option<String>,
    page_size: usize,
    closed: bool,
}

impl SqlSource {
    pub const CAPABILITIES: Capabilities = Capabilities {
        description: "Rows from a SQLite table or query",
        partial_reading: true,
        remote: false,
    };

    pub fn new(config: SourceConfig, ctx: &SourceContext) -> Result<Self> {
        let Some(url) = ctx.credentials.get_credential(&config.raw, "url", false)? else {
            bail!("database source '{}' has no 'url'", config.id);
        };

        let (from, default_order) = match (config.get_str("table"), config.get_str("query")) {
            (Some(table), None) => {
                if !is_identifier(table) {
                    bail!("invalid table name '{}'", table);
                }
                (table.to_string(), Some("rowid".to_string()))
            }
            (None, Some(query)) => (format!("({})", query.trim().trim_end_matches(';')), None),
            (Some(_), Some(_)) => bail!("database source '{}' sets both 'table' and 'query'", config.id),
            (None, None) => bail!("database source '{}' needs 'table' or 'query'", config.id),
        };

        let order_by = match config.get_str("order_by") {
            Some(order) if is_order_clause(order) => Some(order.to_string()),
            Some(order) => bail!("invalid order_by '{}'", order),
            None => default_order,
        };

        let url = if url.starts_with("sqlite:") {
            url
        } else {
            format!("sqlite:{}", url)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("Invalid database url '{}'", url))?
            .read_only(true);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .context("Failed to start database runtime")?;
        let pool = runtime.block_on(async {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_lazy_with(options)
        });

        let page_size = config
            .get_u64("page_size")
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        Ok(Self {
            config,
            pool,
            runtime,
            from,
            order_by,
            page_size,
            closed: false,
        })
    }

    fn page_sql(&self) -> String {
        match &self.order_by {
            Some(order) => format!("SELECT * FROM {} ORDER BY {} LIMIT ? OFFSET ?", self.from, order),
            None => format!("SELECT * FROM {} LIMIT ? OFFSET ?", self.from),
        }
    }

    fn count(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.from);
        let total: i64 = self
            .runtime
            .block_on(sqlx::query_scalar(&sql).fetch_one(&self.pool))
            .with_context(|| format!("Failed to count rows for '{}'", self.config.id))?;
        Ok(total.max(0) as usize)
    }
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("identifier pattern is a valid regex")
    })
}

fn is_identifier(name: &str) -> bool {
    identifier_re().is_match(name)
}

/// Comma-separated columns, each optionally followed by ASC or DESC.
fn is_order_clause(clause: &str) -> bool {
    clause.split(',').all(|part| {
        let mut words = part.split_whitespace();
        let column_ok = words.next().is_some_and(is_identifier);
        let direction_ok = match words.next() {
            None => true,
            Some(dir) => dir.eq_ignore_ascii_case("asc") || dir.eq_ignore_ascii_case("desc"),
        };
        column_ok && direction_ok && words.next().is_none()
    })
}

/// Convert a row into an item using each value's storage class.
fn row_to_item(row: &SqliteRow) -> Result<Item> {
    let mut item = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" | "NUMERIC" => Value::from(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => Value::String(row.try_get::<String, _>(i)?),
            }
        };
        item.insert(column.name().to_string(), value);
    }
    Ok(item)
}

struct SqlPages<'a> {
    source: &'a SqlSource,
    sql: String,
    offset: usize,
    remaining: Option<usize>,
    buffer: std::collections::VecDeque<Result<Item, ReadError>>,
    done: bool,
}

impl SqlPages<'_> {
    fn fill(&mut self) -> Result<()> {
        let limit = match self.remaining {
            Some(n) => n.min(self.source.page_size),
            None => self.source.page_size,
        };
        let rows = self.source.runtime.block_on(
            sqlx::query(&self.sql)
                .bind(limit as i64)
                .bind(self.offset as i64)
                .fetch_all(&self.source.pool),
        )?;

        for (i, row) in rows.iter().enumerate() {
            let position = self.offset + i;
            self.buffer.push_back(
                row_to_item(row).map_err(|e| ReadError::malformed(position, e.to_string())),
            );
        }
        self.offset += rows.len();
        if rows.len() < limit {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for SqlPages<'_> {
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

impl DataSource for SqlSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        if self.closed {
            return false;
        }
        match self.count() {
            Ok(_) => true,
            Err(e) => {
                debug!(source_id = %self.config.id, error = %e, "database probe failed");
                false
            }
        }
    }

    fn read_items(&mut self, start: usize, count: Option<usize>) -> Result<ItemIter<'_>> {
        if self.closed {
            bail!("database source '{}' is closed", self.config.id);
        }
        Ok(Box::new(SqlPages {
            sql: self.page_sql(),
            source: self,
            offset: start,
            remaining: count,
            buffer: Default::default(),
            done: false,
        }))
    }

    fn total_count(&self) -> Option<usize> {
        self.count().ok()
    }

    fn supports_partial_reading(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if !self.closed {
            self.runtime.block_on(self.pool.close());
            self.closed = true;
        }
    }
}
