//! Cache-aware payload fetching for remote connectors.
//!
//! Remote connectors describe their endpoint with [`RemoteEndpoint`] (a cheap
//! metadata probe plus a full download) and let [`fetch_cached`] decide
//! whether the cached copy can be used:
//!
//! 1. Probe the endpoint for fresh ETag / Last-Modified values.
//! 2. Ask the cache for an entry that is unexpired *and* matches them
//!    (if the probe failed, fall back to a plain TTL lookup).
//! 3. On a miss, download and store the payload.
//!
//! Either way the payload ends up in memory, so a later eviction of the
//! cache file cannot break a source that is still reading from it.
//! [`PayloadSlot`] keeps the fetched payload for the lifetime of a source so
//! repeated `read_items` calls do not refetch; `refresh()` clears it.

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderName, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheManager, CachePutOptions};
use crate::formats::{count_items, decode_items, ItemFormat};
use crate::traits::{slice_items, ItemIter};

/// Validators and content type reported by the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

impl Validators {
    pub fn from_response(resp: &Response) -> Self {
        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
            content_type: header(CONTENT_TYPE),
        }
    }
}

/// A full download.
#[derive(Debug)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub validators: Validators,
}

/// Something that can be probed and downloaded.
pub trait RemoteEndpoint {
    /// Canonical location, used as the cache's source URL.
    fn location(&self) -> String;

    /// Metadata-only request (e.g. HTTP HEAD).
    fn probe(&self) -> Result<Validators>;

    fn download(&self) -> Result<Download>;
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub from_cache: bool,
}

/// Fetch `endpoint`'s payload, going through `cache` when one is configured.
pub fn fetch_cached(
    cache: Option<&CacheManager>,
    source_id: &str,
    endpoint: &dyn RemoteEndpoint,
    ttl_seconds: Option<i64>,
) -> Result<FetchedPayload> {
    let Some(cache) = cache else {
        let download = endpoint.download()?;
        return Ok(FetchedPayload {
            content_type: download.validators.content_type,
            bytes: download.bytes,
            from_cache: false,
        });
    };

    let hit = match endpoint.probe() {
        Ok(v) => cache.get_if_valid(source_id, v.etag.as_deref(), v.last_modified.as_deref()),
        Err(e) => {
            debug!(source_id, error = %e, "probe failed, falling back to TTL-only cache lookup");
            cache.get(source_id)
        }
    };

    if let Some(entry) = hit {
        match std::fs::read(&entry.cache_path) {
            Ok(bytes) => {
                debug!(source_id, path = %entry.cache_path.display(), "serving payload from cache");
                return Ok(FetchedPayload {
                    bytes,
                    content_type: entry.content_type,
                    from_cache: true,
                });
            }
            Err(e) => {
                warn!(source_id, path = %entry.cache_path.display(), error = %e, "cached payload unreadable, downloading");
            }
        }
    }

    let download = endpoint.download()?;
    let options = CachePutOptions {
        etag: download.validators.etag.clone(),
        last_modified: download.validators.last_modified.clone(),
        content_type: download.validators.content_type.clone(),
        ttl_seconds,
        ..Default::default()
    };
    if let Err(e) = cache.put(source_id, &endpoint.location(), &download.bytes, options) {
        warn!(source_id, error = %e, "failed to cache payload");
    }

    Ok(FetchedPayload {
        content_type: download.validators.content_type,
        bytes: download.bytes,
        from_cache: false,
    })
}

/// Per-source holder of a fetched payload and how to decode it.
#[derive(Debug, Default)]
pub struct PayloadSlot {
    fetched: Option<FetchedPayload>,
    format: Option<String>,
    items_key: Option<String>,
    location: String,
}

impl PayloadSlot {
    pub fn new(location: impl Into<String>, format: Option<String>, items_key: Option<String>) -> Self {
        Self {
            fetched: None,
            format,
            items_key,
            location: location.into(),
        }
    }

    fn item_format(&self, fetched: &FetchedPayload) -> Result<ItemFormat> {
        ItemFormat::resolve(
            self.format.as_deref(),
            &self.location,
            fetched.content_type.as_deref(),
        )
    }

    /// Fetch on first use, then decode and slice.
    pub fn read<F>(&mut self, start: usize, count: Option<usize>, fetch: F) -> Result<ItemIter<'_>>
    where
        F: FnOnce() -> Result<FetchedPayload>,
    {
        if self.fetched.is_none() {
            self.fetched = Some(fetch()?);
        }
        let Some(fetched) = self.fetched.as_ref() else {
            bail!("payload for '{}' was not fetched", self.location);
        };

        let format = self.item_format(fetched)?;
        let items = decode_items(fetched.bytes.as_slice(), format, self.items_key.as_deref())?;
        Ok(slice_items(items, start, count))
    }

    /// Record count of the loaded payload; `None` until something was fetched.
    pub fn count(&self) -> Option<usize> {
        let fetched = self.fetched.as_ref()?;
        let format = self.item_format(fetched).ok()?;
        count_items(fetched.bytes.as_slice(), format, self.items_key.as_deref()).ok()
    }

    pub fn clear(&mut self) {
        self.fetched = None;
    }
}

/// Plain HTTP(S) endpoint with optional extra headers.
pub struct HttpEndpoint {
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpEndpoint {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            headers,
        })
    }

    fn with_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

impl RemoteEndpoint for HttpEndpoint {
    fn location(&self) -> String {
        self.url.clone()
    }

    fn probe(&self) -> Result<Validators> {
        let resp = self
            .with_headers(self.client.head(&self.url))
            .send()
            .with_context(|| format!("HEAD {} failed", self.url))?;
        if !resp.status().is_success() {
            bail!("HEAD {} returned HTTP {}", self.url, resp.status());
        }
        Ok(Validators::from_response(&resp))
    }

    fn download(&self) -> Result<Download> {
        let resp = self
            .with_headers(self.client.get(&self.url))
            .send()
            .with_context(|| format!("GET {} failed", self.url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            bail!(
                "GET {} returned HTTP {}: {}",
                self.url,
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        let validators = Validators::from_response(&resp);
        let bytes = resp.bytes()?.to_vec();
        Ok(Download { bytes, validators })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct FakeEndpoint {
        etag: &'static str,
        body: &'static [u8],
        probe_fails: bool,
        downloads: Cell<usize>,
    }

    impl FakeEndpoint {
        fn new(etag: &'static str, body: &'static [u8]) -> Self {
            Self {
                etag,
                body,
                probe_fails: false,
                downloads: Cell::new(0),
            }
        }
    }

    impl RemoteEndpoint for FakeEndpoint {
        fn location(&self) -> String {
            "https://fake.test/items.jsonl".to_string()
        }
        fn probe(&self) -> Result<Validators> {
            if self.probe_fails {
                bail!("offline");
            }
            Ok(Validators {
                etag: Some(self.etag.to_string()),
                ..Default::default()
            })
        }
        fn download(&self) -> Result<Download> {
            self.downloads.set(self.downloads.get() + 1);
            Ok(Download {
                bytes: self.body.to_vec(),
                validators: Validators {
                    etag: Some(self.etag.to_string()),
                    content_type: Some("application/x-ndjson".to_string()),
                    ..Default::default()
                },
            })
        }
    }

    #[test]
    fn unchanged_remote_is_served_from_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheManager::new(tmp.path(), 3600, 1_000_000).unwrap();
        let endpoint = FakeEndpoint::new("v1", b"{\"id\": 1}\n");

        let first = fetch_cached(Some(&cache), "src", &endpoint, None).unwrap();
        assert!(!first.from_cache);
        let second = fetch_cached(Some(&cache), "src", &endpoint, None).unwrap();
        assert!(second.from_cache);
        assert_eq!(endpoint.downloads.get(), 1);
    }

    #[test]
    fn changed_etag_forces_download() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheManager::new(tmp.path(), 3600, 1_000_000).unwrap();

        fetch_cached(Some(&cache), "src", &FakeEndpoint::new("v1", b"a"), None).unwrap();
        let changed = FakeEndpoint::new("v2", b"b");
        let fetched = fetch_cached(Some(&cache), "src", &changed, None).unwrap();

        assert!(!fetched.from_cache);
        assert_eq!(changed.downloads.get(), 1);
        assert_eq!(cache.get("src").unwrap().etag.as_deref(), Some("v2"));
    }

    #[test]
    fn failed_probe_uses_ttl_lookup() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheManager::new(tmp.path(), 3600, 1_000_000).unwrap();
        fetch_cached(Some(&cache), "src", &FakeEndpoint::new("v1", b"a"), None).unwrap();

        let mut offline = FakeEndpoint::new("v9", b"z");
        offline.probe_fails = true;
        let fetched = fetch_cached(Some(&cache), "src", &offline, None).unwrap();
        assert!(fetched.from_cache);
        assert_eq!(offline.downloads.get(), 0);
    }

    #[test]
    fn without_cache_always_downloads() {
        let endpoint = FakeEndpoint::new("v1", b"a");
        fetch_cached(None, "src", &endpoint, None).unwrap();
        fetch_cached(None, "src", &endpoint, None).unwrap();
        assert_eq!(endpoint.downloads.get(), 2);
    }

    #[test]
    fn cached_payload_survives_eviction() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheManager::new(tmp.path(), 3600, 40).unwrap();
        let a = FakeEndpoint::new("a1", b"{\"id\": 1}\n{\"id\": 2}\n{\"id\": 3}\n");
        fetch_cached(Some(&cache), "a", &a, None).unwrap();

        let mut slot = PayloadSlot::new(a.location(), None, None);
        let first = slot
            .read(0, Some(1), || {
                let fetched = fetch_cached(Some(&cache), "a", &a, None)?;
                assert!(fetched.from_cache);
                Ok(fetched)
            })
            .unwrap()
            .count();
        assert_eq!(first, 1);

        let b = FakeEndpoint::new("b1", b"{\"id\": 7}\n{\"id\": 8}\n{\"id\": 9}\n");
        fetch_cached(Some(&cache), "b", &b, None).unwrap();
        assert!(cache.get("a").is_none());

        let ids: Vec<_> = slot
            .read(1, Some(2), || bail!("already fetched"))
            .unwrap()
            .map(|r| r.unwrap()["id"].clone())
            .collect();
        assert_eq!(ids, vec![serde_json::json!(2), serde_json::json!(3)]);
        assert_eq!(a.downloads.get(), 1);
    }

    #[test]
    fn payload_slot_fetches_once_and_slices() {
        let endpoint = FakeEndpoint::new("v1", b"{\"id\": 1}\n{\"id\": 2}\n{\"id\": 3}\n");
        let mut slot = PayloadSlot::new(endpoint.location(), None, None);

        let ids: Vec<_> = slot
            .read(1, Some(1), || fetch_cached(None, "src", &endpoint, None))
            .unwrap()
            .map(|r| r.unwrap()["id"].clone())
            .collect();
        assert_eq!(ids, vec![serde_json::json!(2)]);

        let rest = slot
            .read(1, None, || fetch_cached(None, "src", &endpoint, None))
            .unwrap()
            .count();
        assert_eq!(rest, 2);
        assert_eq!(endpoint.downloads.get(), 1);
        assert_eq!(slot.count(), Some(3));

        slot.clear();
        assert_eq!(slot.count(), None);
    }
}

/// Minimal HTTP/1.1 server for connector tests.
#[cfg(test)]
pub(crate) mod test_server {
    use sha2::{Digest, Sha256};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// `(content_type, body)` for a request target, or `None` for 404.
    pub type Handler = Box<dyn Fn(&str) -> Option<(String, String)> + Send>;

    pub struct TestServer {
        pub base_url: String,
        pub gets: Arc<AtomicUsize>,
        pub heads: Arc<AtomicUsize>,
        pub auth: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl TestServer {
        pub fn get_count(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    /// Serve `handler` on an ephemeral port until the test process exits.
    pub fn spawn(handler: Handler) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let gets = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(AtomicUsize::new(0));
        let auth = Arc::new(std::sync::Mutex::new(Vec::new()));

        let (g, h, a) = (gets.clone(), heads.clone(), auth.clone());
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("authorization") {
                            a.lock().unwrap().push(value.trim().to_string());
                        }
                    }
                }

                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let target = parts.next().unwrap_or("/").to_string();
                let is_head = method == "HEAD";
                if is_head {
                    h.fetch_add(1, Ordering::SeqCst);
                } else {
                    g.fetch_add(1, Ordering::SeqCst);
                }

                let response = match handler(&target) {
                    Some((content_type, body)) => {
                        let etag = hex::encode(&Sha256::digest(body.as_bytes())[..8]);
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nETag: \"{}\"\r\nConnection: close\r\n\r\n",
                            content_type,
                            body.len(),
                            etag
                        );
                        if is_head { head } else { head + &body }
                    }
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        TestServer {
            base_url,
            gets,
            heads,
            auth,
        }
    }
}
