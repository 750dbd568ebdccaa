//! Amazon S3 connector.
//!
//! Fetches a single object and decodes it like any other payload. Requests
//! are signed with AWS Signature V4 using pure-Rust `hmac` + `sha2`, and
//! custom endpoints (MinIO, LocalStack) are addressed path-style.
//!
//! # Configuration
//!
//! ```toml
//! [[data_sources]]
//! type = "s3"
//! bucket = "acme-annotations"
//! key = "batches/2024-06.jsonl"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! access_key_id = "${S3_KEY_ID}"
//! secret_access_key = "${S3_SECRET}"
//! ```
//!
//! # Credentials
//!
//! Taken from the source table first, then from the resolver's
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and (optional)
//! `AWS_SESSION_TOKEN`. Missing credentials make the source unavailable.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::{Client, RequestBuilder};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CacheManager;
use crate::credentials::CredentialResolver;
use crate::fetch::{fetch_cached, Download, PayloadSlot, RemoteEndpoint, Validators};
use crate::formats::ItemFormat;
use crate::models::SourceConfig;
use crate::traits::{Capabilities, DataSource, ItemIter, SourceContext};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Source {
    config: SourceConfig,
    endpoint: S3Endpoint,
    cache: Option<Arc<CacheManager>>,
    cache_ttl_seconds: Option<i64>,
    slot: PayloadSlot,
}

impl S3Source {
    pub const CAPABILITIES: Capabilities = Capabilities {
        description: "Objects in S3 or S3-compatible storage",
        partial_reading: true,
        remote: true,
    };

    pub fn new(config: SourceConfig, ctx: &SourceContext) -> Result<Self> {
        let (Some(bucket), Some(key)) = (config.get_str("bucket"), config.get_str("key")) else {
            bail!("s3 source '{}' needs both 'bucket' and 'key'", config.id);
        };

        let endpoint = S3Endpoint {
            client: Client::builder()
                .timeout(Duration::from_secs(config.get_u64("timeout_seconds").unwrap_or(60)))
                .build()
                .context("Failed to build HTTP client")?,
            bucket: bucket.to_string(),
            key: key.trim_start_matches('/').to_string(),
            region: config.get_str("region").unwrap_or(DEFAULT_REGION).to_string(),
            endpoint_url: config.get_str("endpoint_url").map(|s| s.trim_end_matches('/').to_string()),
            credentials: AwsCredentials::resolve(&config, &ctx.credentials),
        };

        let slot = PayloadSlot::new(
            endpoint.location(),
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

impl DataSource for S3Source {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn is_available(&self) -> bool {
        if self.endpoint.credentials.is_none() {
            debug!(source_id = %self.config.id, "no AWS credentials configured");
            return false;
        }
        if let Some(cache) = &self.cache {
            if cache.get(&self.config.id).is_some() {
                return true;
            }
        }
        match self.endpoint.probe() {
            Ok(_) => true,
            Err(e) => {
                debug!(source_id = %self.config.id, error = %e, "s3 probe failed");
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
        if self.endpoint.key.ends_with('/') {
            problems.push("'key' must name an object, not a prefix".to_string());
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

// ============ Credentials ============

#[derive(Debug, Clone, PartialEq, Eq)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    /// Source table first, then `AWS_*` variables through the resolver.
    fn resolve(config: &SourceConfig, resolver: &CredentialResolver) -> Option<Self> {
        let lookup = |key: &str, env: &str| {
            resolver
                .get_credential(&config.raw, key, false)
                .ok()
                .flatten()
                .or_else(|| resolver.lookup(env).filter(|v| !v.is_empty()))
        };

        Some(Self {
            access_key_id: lookup("access_key_id", "AWS_ACCESS_KEY_ID")?,
            secret_access_key: lookup("secret_access_key", "AWS_SECRET_ACCESS_KEY")?,
            session_token: lookup("session_token", "AWS_SESSION_TOKEN"),
        })
    }
}

// ============ Endpoint ============

struct S3Endpoint {
    client: Client,
    bucket: String,
    key: String,
    region: String,
    endpoint_url: Option<String>,
    credentials: Option<AwsCredentials>,
}

impl S3Endpoint {
    /// `(scheme://host, host, canonical uri)` for the object.
    fn address(&self) -> (String, String, String) {
        let encoded_key = self.key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint_url {
            Some(endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let base = if endpoint.contains("://") {
                    endpoint.clone()
                } else {
                    format!("https://{}", endpoint)
                };
                (base, host, format!("/{}/{}", uri_encode(&self.bucket), encoded_key))
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                (format!("https://{}", host), host, format!("/{}", encoded_key))
            }
        }
    }

    fn signed(&self, method: &str) -> Result<RequestBuilder> {
        let Some(creds) = &self.credentials else {
            bail!("no AWS credentials for s3://{}/{}", self.bucket, self.key);
        };
        let (base, host, canonical_uri) = self.address();
        let url = format!("{}{}", base, canonical_uri);

        let headers = sign_request(method, &host, &canonical_uri, &self.region, creds, Utc::now());
        let mut request = match method {
            "HEAD" => self.client.head(&url),
            _ => self.client.get(&url),
        };
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }
}

impl RemoteEndpoint for S3Endpoint {
    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    fn probe(&self) -> Result<Validators> {
        let resp = self
            .signed("HEAD")?
            .send()
            .with_context(|| format!("HEAD {} failed", self.location()))?;
        if !resp.status().is_success() {
            bail!("S3 HeadObject failed (HTTP {}) for {}", resp.status(), self.location());
        }
        Ok(Validators::from_response(&resp))
    }

    fn download(&self) -> Result<Download> {
        let resp = self
            .signed("GET")?
            .send()
            .map_err(|e| anyhow::anyhow!("Failed to get {}: {}", self.location(), e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!(
                "S3 GetObject failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        let validators = Validators::from_response(&resp);
        let bytes = resp.bytes()?.to_vec();
        Ok(Download { bytes, validators })
    }
}

// ============ AWS SigV4 Helpers ============

/// Signed headers, `authorization` included, for a bodyless request with
/// no query string.
fn sign_request(
    method: &str,
    host: &str,
    canonical_uri: &str,
    region: &str,
    creds: &AwsCredentials,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(b"");

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = &creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    );

    // reqwest sets Host itself.
    headers.retain(|(k, _)| k != "host");
    headers.push(("authorization".to_string(), authorization));
    headers
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::test_server;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn config(raw: Value) -> SourceConfig {
        SourceConfig::from_raw(raw.as_object().cloned().unwrap(), 0).unwrap()
    }

    fn context(vars: &[(&str, &str)]) -> SourceContext {
        SourceContext::new(
            None,
            Arc::new(CredentialResolver::from_vars(vars.iter().copied())),
            "id",
        )
    }

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encode_keeps_unreserved() {
        assert_eq!(uri_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn signed_headers_cover_session_token() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let headers = sign_request("GET", "b.s3.us-east-1.amazonaws.com", "/k", "us-east-1", &creds(), now);
        let auth = &headers.iter().find(|(k, _)| k == "authorization").unwrap().1;
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240601/us-east-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date,"));
        assert!(!headers.iter().any(|(k, _)| k == "host"));

        let mut with_token = creds();
        with_token.session_token = Some("tok".to_string());
        let headers = sign_request("GET", "h", "/k", "us-east-1", &with_token, now);
        let auth = &headers.iter().find(|(k, _)| k == "authorization").unwrap().1;
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token,"));

        let get = sign_request("GET", "h", "/k", "us-east-1", &creds(), now);
        let head = sign_request("HEAD", "h", "/k", "us-east-1", &creds(), now);
        assert_ne!(get.last(), head.last());
    }

    #[test]
    fn credentials_fall_back_to_aws_env() {
        let cfg = config(json!({ "type": "s3", "bucket": "b", "key": "k.jsonl" }));
        let src = S3Source::new(
            cfg.clone(),
            &context(&[("AWS_ACCESS_KEY_ID", "id"), ("AWS_SECRET_ACCESS_KEY", "secret")]),
        )
        .unwrap();
        assert_eq!(src.endpoint.credentials.as_ref().unwrap().access_key_id, "id");

        let src = S3Source::new(cfg, &context(&[])).unwrap();
        assert!(src.endpoint.credentials.is_none());
        assert!(!src.is_available());
    }

    #[test]
    fn requires_bucket_and_key() {
        assert!(S3Source::new(config(json!({ "type": "s3", "bucket": "b" })), &context(&[])).is_err());
    }

    #[test]
    fn virtual_host_and_path_style_addresses() {
        let src = S3Source::new(
            config(json!({ "type": "s3", "bucket": "b", "key": "dir/my file.jsonl", "region": "eu-west-1" })),
            &context(&[]),
        )
        .unwrap();
        let (base, host, uri) = src.endpoint.address();
        assert_eq!(base, "https://b.s3.eu-west-1.amazonaws.com");
        assert_eq!(host, "b.s3.eu-west-1.amazonaws.com");
        assert_eq!(uri, "/dir/my%20file.jsonl");
        assert_eq!(src.endpoint.location(), "s3://b/dir/my file.jsonl");

        let src = S3Source::new(
            config(json!({ "type": "s3", "bucket": "b", "key": "k.csv", "endpoint_url": "http://localhost:9000/" })),
            &context(&[]),
        )
        .unwrap();
        let (base, host, uri) = src.endpoint.address();
        assert_eq!(base, "http://localhost:9000");
        assert_eq!(host, "localhost:9000");
        assert_eq!(uri, "/b/k.csv");
    }

    #[test]
    fn reads_object_from_compatible_endpoint() {
        let server = test_server::spawn(Box::new(|target: &str| {
            (target == "/bucket/items.csv")
                .then(|| ("text/csv".to_string(), "id,text\n1,a\n2,b\n3,c\n".to_string()))
        }));
        let mut src = S3Source::new(
            config(json!({
                "type": "s3",
                "bucket": "bucket",
                "key": "items.csv",
                "endpoint_url": server.base_url,
                "access_key_id": "id",
                "secret_access_key": "secret",
            })),
            &context(&[]),
        )
        .unwrap();

        assert!(src.is_available());
        let items: Vec<_> = src.read_items(1, None).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["text"], "b");
        assert_eq!(src.total_count(), Some(3));
        assert!(server
            .auth
            .lock()
            .unwrap()
            .iter()
            .all(|a| a.starts_with("AWS4-HMAC-SHA256 Credential=id/")));
    }
}
