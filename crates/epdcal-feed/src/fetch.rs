//! Conditional HTTP fetching with a disk-backed cache.
//!
//! Each source gets one cache subdirectory named by the first 16 hex chars
//! of SHA-256(url), holding `meta` (JSON cache metadata) and `body` (the raw
//! ICS payload). The body is always written before the meta so the metadata
//! never points at a missing or stale body.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use epdcal_core::Source;

use crate::error::{FeedError, FeedResult};

/// Per-request timeout. The whole-cycle budget is enforced by the caller.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const META_FILE: &str = "meta";
const BODY_FILE: &str = "body";

/// The outcome of fetching a single source.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source: Source,
    /// ICS payload, freshly fetched or substituted from cache.
    pub body: Vec<u8>,
    /// True when the body came from the disk cache (304 or degraded path).
    pub from_cache: bool,
}

/// HTTP cache metadata persisted per source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Fetches ICS feeds with ETag / Last-Modified revalidation.
///
/// The fetcher exclusively owns its cache directory; sources map to
/// disjoint subdirectories, so concurrent per-source fetches never touch
/// the same files.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl Fetcher {
    /// Creates a fetcher rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> FeedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("epdcal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::internal("failed to build HTTP client").with_cause(e))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
        })
    }

    /// Fetches all sources concurrently.
    ///
    /// The result vector preserves the input order of the sources that
    /// produced a body; per-source failures are collected separately and
    /// never abort the batch.
    pub async fn fetch_all(&self, sources: &[Source]) -> (Vec<FetchResult>, Vec<FeedError>) {
        let mut handles = Vec::with_capacity(sources.len());
        for src in sources {
            let fetcher = self.clone();
            let src = src.clone();
            handles.push(tokio::spawn(async move { fetcher.fetch_one(&src).await }));
        }

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (handle, src) in handles.into_iter().zip(sources) {
            match handle.await {
                Ok(Ok(res)) => results.push(res),
                Ok(Err(e)) => {
                    warn!(id = %src.id, url = %src.redacted_url(), error = %e, "feed fetch failed");
                    errors.push(e.with_source_id(&src.id));
                }
                Err(e) => {
                    errors.push(
                        FeedError::internal("fetch task panicked")
                            .with_cause(e)
                            .with_source_id(&src.id),
                    );
                }
            }
        }

        (results, errors)
    }

    /// Fetches a single source, honoring cached validators.
    pub async fn fetch_one(&self, src: &Source) -> FeedResult<FetchResult> {
        if src.url.is_empty() {
            return Err(FeedError::internal("source URL is empty"));
        }

        let dir = self.cache_dir_for(&src.url);
        ensure_private_dir(&dir).await?;

        let meta = load_meta(&dir).await;
        let cached_body = load_body(&dir).await;

        let mut request = self.client.get(&src.url);
        if let Some(ref meta) = meta {
            if let Some(ref etag) = meta.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(ref lm) = meta.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, lm);
            }
        }

        info!(id = %src.id, url = %src.redacted_url(), "feed fetch start");

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                // Transport failure; degrade to the cached body if we have one.
                if let Some(body) = cached_body {
                    warn!(
                        id = %src.id,
                        url = %src.redacted_url(),
                        error = %e,
                        "feed fetch network error, serving cached body"
                    );
                    return Ok(FetchResult {
                        source: src.clone(),
                        body,
                        from_cache: true,
                    });
                }
                return Err(FeedError::network("request failed").with_cause(e));
            }
        };

        match response.status() {
            StatusCode::OK => {
                let etag = header_string(&response, header::ETAG);
                let last_modified = header_string(&response, header::LAST_MODIFIED);
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| FeedError::network("failed to read response body").with_cause(e))?
                    .to_vec();

                let entry = CacheEntry {
                    url: src.url.clone(),
                    etag,
                    last_modified,
                    updated_at: Utc::now(),
                };
                if let Err(e) = save_cache(&dir, &entry, &body).await {
                    // The fresh body is still good; only the cache write failed.
                    warn!(id = %src.id, error = %e, "feed cache save failed");
                }

                info!(id = %src.id, url = %src.redacted_url(), bytes = body.len(), "feed fetch success");
                Ok(FetchResult {
                    source: src.clone(),
                    body,
                    from_cache: false,
                })
            }

            StatusCode::NOT_MODIFIED => match cached_body {
                Some(body) => {
                    info!(id = %src.id, url = %src.redacted_url(), "feed not modified, serving cache");
                    Ok(FetchResult {
                        source: src.clone(),
                        body,
                        from_cache: true,
                    })
                }
                None => Err(FeedError::cache_corrupt(
                    "304 Not Modified but no cached body on disk",
                )),
            },

            status => {
                if let Some(body) = cached_body {
                    warn!(
                        id = %src.id,
                        url = %src.redacted_url(),
                        status = status.as_u16(),
                        "feed fetch non-OK status, serving cached body"
                    );
                    return Ok(FetchResult {
                        source: src.clone(),
                        body,
                        from_cache: true,
                    });
                }
                Err(FeedError::http_status(status.as_u16()))
            }
        }
    }

    /// Cache subdirectory for a URL: first 16 hex chars of SHA-256(url).
    fn cache_dir_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let mut name = String::with_capacity(16);
        for byte in &digest[..8] {
            name.push_str(&format!("{:02x}", byte));
        }
        self.cache_dir.join(name)
    }
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

async fn ensure_private_dir(dir: &Path) -> FeedResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| FeedError::internal("failed to create cache directory").with_cause(e))?;
    set_mode(dir, 0o700).await
}

async fn load_meta(dir: &Path) -> Option<CacheEntry> {
    let data = tokio::fs::read(dir.join(META_FILE)).await.ok()?;
    match serde_json::from_slice(&data) {
        Ok(meta) => Some(meta),
        Err(e) => {
            debug!(error = %e, "ignoring unreadable cache meta");
            None
        }
    }
}

async fn load_body(dir: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(dir.join(BODY_FILE)).await {
        Ok(body) if !body.is_empty() => Some(body),
        _ => None,
    }
}

/// Persists a fresh response. The body lands on disk before the meta so a
/// crash between the two writes can never leave meta validators pointing at
/// a body we do not have.
async fn save_cache(dir: &Path, entry: &CacheEntry, body: &[u8]) -> FeedResult<()> {
    let body_path = dir.join(BODY_FILE);
    tokio::fs::write(&body_path, body)
        .await
        .map_err(|e| FeedError::internal("failed to write cache body").with_cause(e))?;
    set_mode(&body_path, 0o600).await?;

    let meta_path = dir.join(META_FILE);
    let data = serde_json::to_vec_pretty(entry)
        .map_err(|e| FeedError::internal("failed to encode cache meta").with_cause(e))?;
    tokio::fs::write(&meta_path, data)
        .await
        .map_err(|e| FeedError::internal("failed to write cache meta").with_cause(e))?;
    set_mode(&meta_path, 0o600).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> FeedResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| FeedError::internal("failed to set cache permissions").with_cause(e))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> FeedResult<()> {
    Ok(())
}
