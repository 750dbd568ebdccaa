//! Mapping from source type tags to connector factories.
//!
//! A [`SourceRegistry`] is built once at process start and handed to the
//! orchestrator. Built-in connectors come from
//! [`SourceRegistry::with_builtins`]; hosts and tests add their own with
//! [`SourceRegistry::register`]. There is no global registry, so two
//! orchestrators in one process can see different connector sets.
//!
//! | Tag | Connector | Module |
//! |-----|-----------|--------|
//! | `file` | Local files and directories | [`connector_file`](crate::connector_file) |
//! | `url` | HTTP(S) endpoints | [`connector_url`](crate::connector_url) |
//! | `s3` | S3 / S3-compatible objects | [`connector_s3`](crate::connector_s3) |
//! | `google_sheets` | Google Sheets CSV export | [`connector_sheets`](crate::connector_sheets) |
//! | `huggingface` | Hugging Face datasets | [`connector_hf`](crate::connector_hf) |
//! | `database` | SQL databases (SQLite) | `connector_sql` (feature `database`) |

use anyhow::Result;
use std::collections::BTreeMap;

use crate::models::SourceConfig;
use crate::traits::{Capabilities, DataSource, SourceContext};

/// Constructor for one source type.
pub type SourceFactory =
    Box<dyn Fn(SourceConfig, &SourceContext) -> Result<Box<dyn DataSource>> + Send + Sync>;

struct Registration {
    capabilities: Capabilities,
    factory: SourceFactory,
}

/// Registry of connector types, keyed by tag.
pub struct SourceRegistry {
    types: BTreeMap<String, Registration>,
}

impl SourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    /// Create a registry with every built-in connector registered.
    pub fn with_builtins() -> Self {
        use crate::connector_file::FileSource;
        use crate::connector_hf::HuggingFaceSource;
        use crate::connector_s3::S3Source;
        use crate::connector_sheets::GoogleSheetsSource;
        use crate::connector_url::UrlSource;

        let mut registry = Self::new();

        registry.register("file", FileSource::CAPABILITIES, |config, ctx| {
            Ok(Box::new(FileSource::new(config, ctx)))
        });
        registry.register("url", UrlSource::CAPABILITIES, |config, ctx| {
            Ok(Box::new(UrlSource::new(config, ctx)?))
        });
        registry.register("s3", S3Source::CAPABILITIES, |config, ctx| {
            Ok(Box::new(S3Source::new(config, ctx)?))
        });
        registry.register(
            "google_sheets",
            GoogleSheetsSource::CAPABILITIES,
            |config, ctx| Ok(Box::new(GoogleSheetsSource::new(config, ctx)?)),
        );
        registry.register("huggingface", HuggingFaceSource::CAPABILITIES, |config, ctx| {
            Ok(Box::new(HuggingFaceSource::new(config, ctx)?))
        });

        #[cfg(feature = "database")]
        {
            use crate::connector_sql::SqlSource;
            registry.register("database", SqlSource::CAPABILITIES, |config, ctx| {
                Ok(Box::new(SqlSource::new(config, ctx)?))
            });
        }

        registry
    }

    /// Register (or replace) the factory for `tag`.
    pub fn register<F>(&mut self, tag: &str, capabilities: Capabilities, factory: F)
    where
        F: Fn(SourceConfig, &SourceContext) -> Result<Box<dyn DataSource>> + Send + Sync + 'static,
    {
        self.types.insert(
            tag.to_string(),
            Registration {
                capabilities,
                factory: Box::new(factory),
            },
        );
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.types.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    pub fn capabilities(&self, tag: &str) -> Option<Capabilities> {
        self.types.get(tag).map(|r| r.capabilities)
    }

    /// Instantiate the source described by `config`.
    ///
    /// Returns `Ok(None)` when the type tag is not registered.
    pub fn create(
        &self,
        config: SourceConfig,
        ctx: &SourceContext,
    ) -> Result<Option<Box<dyn DataSource>>> {
        match self.types.get(&config.source_type) {
            Some(registration) => (registration.factory)(config, ctx).map(Some),
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialResolver;
    use crate::traits::ItemIter;
    use serde_json::json;
    use std::sync::Arc;

    struct Empty(SourceConfig);

    impl DataSource for Empty {
        fn config(&self) -> &SourceConfig {
            &self.0
        }
        fn is_available(&self) -> bool {
            true
        }
        fn read_items(&mut self, _start: usize, _count: Option<usize>) -> Result<ItemIter<'_>> {
            Ok(Box::new(std::iter::empty()))
        }
        fn total_count(&self) -> Option<usize> {
            Some(0)
        }
        fn supports_partial_reading(&self) -> bool {
            false
        }
    }

    const EMPTY: Capabilities = Capabilities {
        description: "always empty",
        partial_reading: false,
        remote: false,
    };

    fn ctx() -> SourceContext {
        SourceContext::new(None, Arc::new(CredentialResolver::new()), "id")
    }

    fn config(tag: &str) -> SourceConfig {
        SourceConfig::from_raw(json!({ "type": tag }).as_object().cloned().unwrap(), 0).unwrap()
    }

    #[test]
    fn builtins_are_registered() {
        let registry = SourceRegistry::with_builtins();
        for tag in ["file", "url", "s3", "google_sheets", "huggingface"] {
            assert!(registry.contains(tag), "missing builtin {}", tag);
        }
        assert!(registry.capabilities("url").unwrap().remote);
        assert!(!registry.capabilities("file").unwrap().remote);
    }

    #[test]
    fn custom_registration_and_creation() {
        let mut registry = SourceRegistry::new();
        assert!(registry.is_empty());
        registry.register("empty", EMPTY, |config, _ctx| Ok(Box::new(Empty(config))));

        assert_eq!(registry.tags(), vec!["empty"]);
        let source = registry.create(config("empty"), &ctx()).unwrap().unwrap();
        assert_eq!(source.source_type(), "empty");
        assert_eq!(source.source_id(), "empty_0");
    }

    #[test]
    fn unknown_tag_yields_none() {
        let registry = SourceRegistry::new();
        assert!(registry.create(config("nope"), &ctx()).unwrap().is_none());
    }

    #[test]
    fn separate_registries_do_not_leak() {
        let mut a = SourceRegistry::new();
        a.register("empty", EMPTY, |config, _ctx| Ok(Box::new(Empty(config))));
        let b = SourceRegistry::new();
        assert!(a.contains("empty"));
        assert!(!b.contains("empty"));
    }
}
