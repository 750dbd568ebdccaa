//! Secret substitution for source configurations.
//!
//! Source tables may reference secrets as `${VAR}` or `${VAR:-default}`.
//! [`CredentialResolver::process_config`] replaces every placeholder found in
//! string values (recursively through objects and arrays) before a
//! [`SourceConfig`](crate::models::SourceConfig) is built, so the orchestrator
//! never has to handle raw secrets itself.
//!
//! Lookup order for a variable:
//!
//! 1. The process environment.
//! 2. The optional dotenv-style file from `[credentials] env_file`.
//!
//! The dotenv file is parsed once at construction and never written into the
//! process environment. Placeholders that resolve to nothing are left
//! verbatim so that [`CredentialResolver::get_credential`] can tell
//! "configured but unresolved" apart from a real value.

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::SourceError;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("placeholder pattern is a valid regex")
    })
}

/// Resolves `${VAR}` placeholders from the environment and an optional env file.
#[derive(Debug, Default, Clone)]
pub struct CredentialResolver {
    file_vars: HashMap<String, String>,
}

impl CredentialResolver {
    /// Resolver backed by the process environment only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver that also consults a dotenv-style file.
    ///
    /// A missing file is not an error: it is logged and ignored, since
    /// deployments commonly provide secrets through the environment instead.
    pub fn with_env_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "credential env file not found, using process env only");
            return Ok(Self::new());
        }

        let mut file_vars = HashMap::new();
        let iter = dotenvy::from_path_iter(path)
            .with_context(|| format!("Failed to open env file: {}", path.display()))?;
        for entry in iter {
            let (key, value) = entry
                .with_context(|| format!("Failed to parse env file: {}", path.display()))?;
            file_vars.insert(key, value);
        }

        debug!(path = %path.display(), vars = file_vars.len(), "loaded credential env file");
        Ok(Self { file_vars })
    }

    /// Build a resolver from explicit variables; used by embedding hosts and tests.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            file_vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a single variable.
    pub fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .or_else(|| self.file_vars.get(name).cloned())
    }

    /// Substitute placeholders in one string.
    pub fn substitute(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }

        placeholder_re()
            .replace_all(input, |caps: &Captures| {
                let name = &caps[1];
                match self.lookup(name) {
                    Some(value) => value,
                    None => match caps.get(2) {
                        Some(default) => default.as_str().to_string(),
                        None => {
                            warn!(variable = name, "unresolved credential placeholder");
                            caps[0].to_string()
                        }
                    },
                }
            })
            .into_owned()
    }

    /// Return a copy of `raw` with every placeholder substituted.
    pub fn process_config(&self, raw: &Map<String, Value>) -> Map<String, Value> {
        raw.iter()
            .map(|(k, v)| (k.clone(), self.process_value(v)))
            .collect()
    }

    fn process_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.process_value(v)).collect()),
            Value::Object(map) => Value::Object(self.process_config(map)),
            other => other.clone(),
        }
    }

    /// Fetch a credential from an already-processed config table.
    ///
    /// Absent keys, empty strings and values that still contain an
    /// unresolved placeholder all count as missing. A missing `required`
    /// credential is an error.
    pub fn get_credential(
        &self,
        config: &Map<String, Value>,
        key: &str,
        required: bool,
    ) -> Result<Option<String>, SourceError> {
        let value = config
            .get(key)
            .and_then(Value::as_str)
            .map(|s| self.substitute(s))
            .filter(|s| !s.is_empty() && !placeholder_re().is_match(s));

        match value {
            Some(v) => Ok(Some(v)),
            None if required => Err(SourceError::Credential(key.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn substitutes_nested_values() {
        let resolver = CredentialResolver::from_vars([("IH_TEST_TOKEN", "s3cr3t")]);
        let raw = map(json!({
            "url": "https://api.test/?key=${IH_TEST_TOKEN}",
            "headers": { "Authorization": "Bearer ${IH_TEST_TOKEN}" },
            "list": ["${IH_TEST_TOKEN}", 1],
            "timeout_seconds": 5
        }));

        let out = resolver.process_config(&raw);
        assert_eq!(out["url"], "https://api.test/?key=s3cr3t");
        assert_eq!(out["headers"]["Authorization"], "Bearer s3cr3t");
        assert_eq!(out["list"][0], "s3cr3t");
        assert_eq!(out["timeout_seconds"], 5);
    }

    #[test]
    fn default_values_apply() {
        let resolver = CredentialResolver::new();
        assert_eq!(
            resolver.substitute("${IH_TEST_SURELY_UNSET:-fallback}"),
            "fallback"
        );
    }

    #[test]
    fn unresolved_placeholder_left_verbatim() {
        let resolver = CredentialResolver::new();
        assert_eq!(
            resolver.substitute("x-${IH_TEST_SURELY_UNSET}-y"),
            "x-${IH_TEST_SURELY_UNSET}-y"
        );
    }

    #[test]
    fn env_file_values_are_used() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "IH_TEST_FROM_FILE=abc123").unwrap();
        writeln!(file, "# comment").unwrap();

        let resolver = CredentialResolver::with_env_file(file.path()).unwrap();
        assert_eq!(resolver.lookup("IH_TEST_FROM_FILE").as_deref(), Some("abc123"));
        assert!(std::env::var("IH_TEST_FROM_FILE").is_err());
    }

    #[test]
    fn missing_env_file_is_tolerated() {
        let resolver = CredentialResolver::with_env_file(Path::new("/no/such/.env")).unwrap();
        assert!(resolver.lookup("IH_TEST_SURELY_UNSET").is_none());
    }

    #[test]
    fn get_credential_required_and_optional() {
        let resolver = CredentialResolver::from_vars([("IH_TEST_KEY", "k")]);
        let config = map(json!({
            "present": "${IH_TEST_KEY}",
            "unresolved": "${IH_TEST_SURELY_UNSET}",
            "empty": ""
        }));

        assert_eq!(
            resolver.get_credential(&config, "present", true).unwrap().as_deref(),
            Some("k")
        );
        assert_eq!(resolver.get_credential(&config, "unresolved", false).unwrap(), None);
        assert_eq!(resolver.get_credential(&config, "empty", false).unwrap(), None);
        assert!(matches!(
            resolver.get_credential(&config, "absent", true),
            Err(SourceError::Credential(key)) if key == "absent"
        ));
    }
}
