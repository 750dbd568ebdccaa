//! # Ingest Harness
//!
//! Pluggable ingestion of annotation items from heterogeneous sources
//! (local files, HTTP endpoints, S3, Google Sheets, Hugging Face datasets,
//! SQL databases) into a host application's item store.
//!
//! Three things make this more than a loop over readers:
//!
//! - sources are added through a [`registry::SourceRegistry`] without
//!   touching the orchestrator;
//! - large sources are consumed in bounded batches whose read positions
//!   survive restarts ([`partial`]);
//! - remote payloads are cached locally with TTL, ETag/Last-Modified
//!   validation and size-bounded eviction ([`cache`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────┐
//! │  Connectors  │──▶│ DataSourceManager │──▶│ ItemStore  │
//! │ file/url/s3… │   │  dedup + batches  │   │            │
//! └──────┬───────┘   └────────┬──────────┘   └────────────┘
//!        ▼                    ▼
//!  ┌────────────┐     ┌───────────────┐
//!  │CacheManager│     │ PartialReader │
//!  └────────────┘     └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ingest sources                 # what is configured, what is reachable
//! ingest load                    # first batch from every source
//! ingest more file_0_items       # next batch from one source
//! ingest auto --annotated 850    # top up once 80% of items are annotated
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Items and source configuration |
//! | [`error`] | Error taxonomy |
//! | [`traits`] | The `DataSource` contract |
//! | [`registry`] | Type tag → connector factory |
//! | [`credentials`] | `${VAR}` substitution and secrets |
//! | [`cache`] | Payload cache |
//! | [`partial`] | Incremental read state |
//! | [`ingest`] | Orchestrator |
//! | [`store`] | Item stores |
//! | [`formats`] | JSONL / JSON / CSV / TSV decoding |
//! | [`fetch`] | Cache-aware remote fetching |
//! | [`sources`] | Status table |

pub mod cache;
pub mod config;
pub mod connector_file;
pub mod connector_hf;
pub mod connector_s3;
pub mod connector_sheets;
#[cfg(feature = "database")]
pub mod connector_sql;
pub mod connector_url;
pub mod credentials;
pub mod error;
pub mod fetch;
pub mod formats;
pub mod ingest;
pub mod models;
pub mod partial;
pub mod registry;
pub mod sources;
pub mod store;
pub mod traits;
