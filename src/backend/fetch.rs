//! Source image fetching into the local cache.
//!
//! Next to each cached image sits a small JSON sidecar (`<file>.meta.json`)
//! recording what the upstream looked like when it was fetched. A fetch first
//! compares the upstream against the sidecar (a `HEAD` request for HTTP(S),
//! size and mtime for `file://`) and only transfers when something changed.
//! Transfers land in a `.part` file and are renamed into place once complete.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{FetchOutcome, Fetcher};
use crate::util::fs::{copy_file, ensure_dir, mtime_secs, remove_file_if_exists, write_atomic};
use crate::util::shell::Shell;

const BUFFER_SIZE: usize = 64 * 1024;

/// What the upstream looked like at the last transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub source: String,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl CacheMeta {
    fn from_headers(source: &Url, headers: &HeaderMap) -> Self {
        let text = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        CacheMeta {
            source: source.to_string(),
            last_modified: text(LAST_MODIFIED),
            content_length: text(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            etag: text(ETAG),
        }
    }

    fn from_file(source: &Url, path: &Path) -> Result<Self> {
        let len = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        Ok(CacheMeta {
            source: source.to_string(),
            last_modified: Some(mtime_secs(path)?.to_string()),
            content_length: Some(len),
            etag: None,
        })
    }

    /// Whether `upstream` describes the same content as this record.
    ///
    /// At least one validator must be present on both sides; a record
    /// without validators never counts as current.
    pub fn is_current(&self, upstream: &CacheMeta) -> bool {
        if self.source != upstream.source {
            return false;
        }
        let pairs = [
            (self.etag.as_ref(), upstream.etag.as_ref()),
            (self.last_modified.as_ref(), upstream.last_modified.as_ref()),
        ];
        let mut compared = false;
        for (cached, remote) in pairs {
            if let (Some(cached), Some(remote)) = (cached, remote) {
                if cached != remote {
                    return false;
                }
                compared = true;
            }
        }
        if let (Some(cached), Some(remote)) = (self.content_length, upstream.content_length) {
            if cached != remote {
                return false;
            }
        }
        compared
    }
}

/// Path of the sidecar for a cached file.
pub fn meta_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".meta.json")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn read_meta(dest: &Path) -> Option<CacheMeta> {
    let content = std::fs::read_to_string(meta_path(dest)).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_meta(dest: &Path, meta: &CacheMeta) -> Result<()> {
    let content = serde_json::to_vec_pretty(meta)?;
    write_atomic(&meta_path(dest), &content)
}

/// Fetcher for `http`, `https` and `file` sources.
pub struct HttpFetcher {
    client: Client,
    shell: Arc<Shell>,
}

impl HttpFetcher {
    /// `timeout` bounds each request, including the full body transfer.
    pub fn new(timeout: Duration, shell: Arc<Shell>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("imgforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpFetcher { client, shell })
    }

    fn fetch_http(&self, source: &Url, dest: &Path) -> Result<FetchOutcome> {
        let cached = if dest.exists() { read_meta(dest) } else { None };

        if let Some(cached) = &cached {
            match self.head(source) {
                Ok(upstream) if cached.is_current(&upstream) => {
                    tracing::info!("cached {} is current", dest.display());
                    return unchanged(dest);
                }
                Ok(_) => tracing::info!("upstream {} changed, downloading", source),
                Err(e) => {
                    tracing::warn!("freshness check failed ({:#}), using cached copy", e);
                    return unchanged(dest);
                }
            }
        }

        self.download(source, dest)
    }

    fn head(&self, source: &Url) -> Result<CacheMeta> {
        let response = self
            .client
            .head(source.as_str())
            .send()
            .with_context(|| format!("HEAD {} failed", source))?;
        if !response.status().is_success() {
            bail!("HEAD {}: HTTP {}", source, response.status());
        }
        Ok(CacheMeta::from_headers(source, response.headers()))
    }

    fn download(&self, source: &Url, dest: &Path) -> Result<FetchOutcome> {
        tracing::info!("downloading {} to {}", source, dest.display());

        let mut response = self
            .client
            .get(source.as_str())
            .send()
            .with_context(|| format!("failed to download {}", source))?;
        if !response.status().is_success() {
            bail!("failed to download {}: HTTP {}", source, response.status());
        }

        let meta = CacheMeta::from_headers(source, response.headers());
        let part = with_suffix(dest, ".part");
        let bytes = discard_on_error(
            &part,
            self.stream_to(&mut response, &part, meta.content_length.unwrap_or(0), source)
                .with_context(|| format!("failed to download {}", source))
                .and_then(|bytes| {
                    std::fs::rename(&part, dest).with_context(|| {
                        format!("failed to move download into {}", dest.display())
                    })?;
                    Ok(bytes)
                }),
        )?;
        write_meta(dest, &meta)?;

        Ok(FetchOutcome {
            path: dest.to_path_buf(),
            transferred: true,
            bytes,
        })
    }

    fn stream_to(&self, response: &mut Response, part: &Path, total: u64, source: &Url) -> Result<u64> {
        let mut file =
            File::create(part).with_context(|| format!("failed to create {}", part.display()))?;
        let name = source
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or("image")
            .to_string();
        let mut progress = self.shell.bytes_progress(name, total);

        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            progress.inc(n as u64);
        }
        progress.finish();
        file.sync_all()?;

        if total > 0 && progress.position() != total {
            bail!(
                "transfer truncated: received {} of {} bytes",
                progress.position(),
                total
            );
        }
        Ok(progress.position())
    }

    fn fetch_file(&self, source: &Url, dest: &Path) -> Result<FetchOutcome> {
        let path = source
            .to_file_path()
            .map_err(|_| anyhow!("`{}` is not a local file path", source))?;
        let upstream = CacheMeta::from_file(source, &path)?;

        if dest.exists() {
            if let Some(cached) = read_meta(dest) {
                if cached.is_current(&upstream) {
                    tracing::info!("cached {} is current", dest.display());
                    return unchanged(dest);
                }
            }
        }

        tracing::info!("copying {} to {}", path.display(), dest.display());
        let part = with_suffix(dest, ".part");
        let bytes = discard_on_error(
            &part,
            copy_file(&path, &part).and_then(|bytes| {
                std::fs::rename(&part, dest)
                    .with_context(|| format!("failed to move copy into {}", dest.display()))?;
                Ok(bytes)
            }),
        )?;
        write_meta(dest, &upstream)?;

        Ok(FetchOutcome {
            path: dest.to_path_buf(),
            transferred: true,
            bytes,
        })
    }
}

/// Remove a partial transfer when `result` is an error.
fn discard_on_error<T>(part: &Path, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(e) = remove_file_if_exists(part) {
            tracing::warn!("failed to remove {}: {:#}", part.display(), e);
        }
    }
    result
}

fn unchanged(dest: &Path) -> Result<FetchOutcome> {
    let bytes = std::fs::metadata(dest)
        .with_context(|| format!("failed to stat {}", dest.display()))?
        .len();
    Ok(FetchOutcome {
        path: dest.to_path_buf(),
        transferred: false,
        bytes,
    })
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, source: &Url, dest: &Path) -> Result<FetchOutcome> {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        match source.scheme() {
            "http" | "https" => self.fetch_http(source, dest),
            "file" => self.fetch_file(source, dest),
            other => bail!("unsupported source scheme `{}`", other),
        }
    }
}
