//! `ingest sources`: status table of configured sources.

use std::fmt::Write;

use crate::ingest::{DataSourceManager, SourceStatus};
use crate::registry::SourceRegistry;

pub fn list_sources(manager: &DataSourceManager, registry: &SourceRegistry) {
    let statuses = manager.get_stats().sources;
    print!("{}", render_sources(&statuses, registry));
}

/// Render the live sources, followed by every registered type.
pub fn render_sources(statuses: &[SourceStatus], registry: &SourceRegistry) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{:<28} {:<14} {:<12} {:>8} {:>8}  COMPLETE",
        "SOURCE", "TYPE", "STATUS", "LOADED", "TOTAL"
    );
    if statuses.is_empty() {
        let _ = writeln!(out, "(no data sources configured)");
    }
    for s in statuses {
        let status = if s.available { "OK" } else { "UNAVAILABLE" };
        let loaded = s.items_loaded.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
        let total = s.total_estimate.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<28} {:<14} {:<12} {:>8} {:>8}  {}",
            s.id, s.source_type, status, loaded, total, s.is_complete
        );
        if let Some(err) = &s.last_error {
            let _ = writeln!(out, "    last error: {}", err);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{:<14} {:<8} {:<8} DESCRIPTION", "TYPE", "RESUME", "REMOTE");
    for tag in registry.tags() {
        if let Some(caps) = registry.capabilities(tag) {
            let _ = writeln!(
                out,
                "{:<14} {:<8} {:<8} {}",
                tag, caps.partial_reading, caps.remote, caps.description
            );
        }
    }
    out
}
