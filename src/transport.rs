//! Thin transport layer for manifest and segment fetches over HTTP(S) or file URLs.
//!
//! Scheme and file-extension validation, byte-ranged requests, size probing, and replay of the
//! caller's HTTP options (headers, user agent, cookies, proxy, referer, timeout) on every fetch
//! live here. Everything else about HTTP (redirects, TLS, connection reuse) is delegated to the
//! `reqwest` client.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use bytes::{Buf, Bytes};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE, RANGE, REFERER};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use crate::manifest::MAX_MANIFEST_SIZE;
use crate::{DashDemuxError, Result};

/// HTTP options captured from the caller at open time and replayed on every fetch, so
/// authentication and session state persist across segment requests.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Extra request headers sent with every fetch.
    pub headers: HashMap<String, String>,
    pub user_agent: Option<String>,
    /// Initial Cookie header value; cookies set by responses are retained in the client's
    /// cookie store for subsequent requests.
    pub cookies: Option<String>,
    pub http_proxy: Option<String>,
    pub referer: Option<String>,
    /// Timeout applied to each request, covering connect and body transfer.
    pub rw_timeout: Option<Duration>,
    /// Request ICY metadata from shoutcast-style servers.
    pub icy: bool,
}

fn network_error(why: &str, e: reqwest::Error) -> DashDemuxError {
    DashDemuxError::Network(format!("{why}: {e}"))
}

// crypto+https://… and crypto:https://… select an encrypted input wrapper around the inner
// protocol; scheme checks apply to the inner URL.
fn strip_crypto_prefix(url: &str) -> &str {
    url.strip_prefix("crypto+")
        .or_else(|| url.strip_prefix("crypto:"))
        .unwrap_or(url)
}

/// Transport handle shared by every reader of a presentation.
pub struct Transport {
    client: reqwest::Client,
    referer: Option<String>,
    allowed_extensions: String,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(
        options: &TransportOptions,
        allowed_extensions: &str,
        cancel: CancellationToken,
    ) -> Result<Transport> {
        let mut headers = HeaderMap::new();
        for (k, v) in &options.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| DashDemuxError::Other(format!("invalid header name {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| DashDemuxError::Other(format!("invalid header value for {k}: {e}")))?;
            headers.insert(name, value);
        }
        if let Some(cookies) = &options.cookies {
            let value = HeaderValue::from_str(cookies)
                .map_err(|e| DashDemuxError::Other(format!("invalid cookie value: {e}")))?;
            headers.insert(COOKIE, value);
        }
        if options.icy {
            headers.insert(HeaderName::from_static("icy-metadata"), HeaderValue::from_static("1"));
        }
        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_store(true);
        if let Some(ua) = &options.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        if let Some(proxy) = &options.http_proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| DashDemuxError::Other(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(timeout) = options.rw_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()
            .map_err(|e| DashDemuxError::Network(format!("building HTTP client: {e}")))?;
        Ok(Transport {
            client,
            referer: options.referer.clone(),
            allowed_extensions: allowed_extensions.to_string(),
            cancel,
        })
    }

    /// Whether the cancellation token has fired.
    pub fn interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DashDemuxError::Interrupted);
        }
        Ok(())
    }

    // Validate the URL scheme, returning the parsed inner URL.
    fn check_scheme(&self, url: &str) -> Result<Url> {
        let target = strip_crypto_prefix(url);
        let parsed = Url::parse(target)
            .map_err(|_| DashDemuxError::InvalidProtocol(format!("unparseable URL '{url}'")))?;
        match parsed.scheme() {
            "http" | "https" | "file" => Ok(parsed),
            other => Err(DashDemuxError::InvalidProtocol(
                format!("scheme '{other}' not allowed for '{url}'"))),
        }
    }

    /// Validate a media URL: scheme plus, for file URLs, the allowed-extensions whitelist.
    pub fn check_url(&self, url: &str) -> Result<Url> {
        let parsed = self.check_scheme(url)?;
        if parsed.scheme() == "file" && self.allowed_extensions != "ALL" {
            let ext = Path::new(parsed.path())
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            let allowed = self.allowed_extensions.split(',')
                .any(|a| a.trim().eq_ignore_ascii_case(ext));
            if !allowed {
                return Err(DashDemuxError::InvalidProtocol(format!(
                    "filename extension of '{url}' is not a common multimedia extension, \
                     blocked for security reasons; adjust allowed_extensions (or set it to \
                     'ALL') to override")));
            }
        }
        Ok(parsed)
    }

    /// Fetch a manifest document, following redirects. Returns the final URL (which relative
    /// references resolve against) and the document text, bounded by the manifest size cap.
    pub async fn fetch_manifest(&self, url: &str) -> Result<(String, String)> {
        self.check_interrupt()?;
        let parsed = self.check_scheme(url)?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path()
                .map_err(|_| DashDemuxError::InvalidProtocol(format!("bad file URL '{url}'")))?;
            let body = tokio::fs::read_to_string(&path).await
                .map_err(|e| DashDemuxError::Io(e, String::from("reading manifest file")))?;
            return Ok((url.to_string(), body));
        }
        let mut req = self.client.get(parsed)
            .header(ACCEPT, "application/dash+xml,video/vnd.mpeg.dash.mpd");
        if let Some(referer) = &self.referer {
            req = req.header(REFERER, referer);
        }
        let response = req.send().await
            .map_err(|e| network_error("requesting DASH manifest", e))?;
        if !response.status().is_success() {
            return Err(DashDemuxError::Network(
                format!("HTTP {} fetching manifest '{url}'", response.status())));
        }
        if let Some(len) = response.content_length() {
            if len as usize > MAX_MANIFEST_SIZE {
                return Err(DashDemuxError::InvalidManifest(format!("manifest too large: {len} bytes")));
            }
        }
        let final_url = response.url().to_string();
        let body = response.text().await
            .map_err(|e| network_error("reading DASH manifest", e))?;
        Ok((final_url, body))
    }

    /// Determine the size in bytes of a resource without streaming it. Returns `None` when the
    /// size cannot be determined; the segment is then read to EOF.
    pub async fn probe_size(&self, url: &str) -> Option<u64> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let parsed = self.check_url(url).ok()?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path().ok()?;
            return tokio::fs::metadata(&path).await.ok().map(|m| m.len());
        }
        match self.client.head(parsed).send().await {
            Ok(response) if response.status().is_success() => response.content_length(),
            Ok(response) => {
                debug!("size probe for '{url}' answered HTTP {}", response.status());
                None
            },
            Err(e) => {
                debug!("size probe for '{url}' failed: {e}");
                None
            },
        }
    }

    /// Open a resource for reading, optionally restricted to the byte range
    /// `[offset, offset + size)`.
    pub async fn open(&self, url: &str, offset: u64, size: Option<u64>) -> Result<SegmentInput> {
        self.check_interrupt()?;
        let parsed = self.check_url(url)?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path()
                .map_err(|_| DashDemuxError::InvalidProtocol(format!("bad file URL '{url}'")))?;
            let mut file = File::open(&path).await
                .map_err(|e| DashDemuxError::Io(e, format!("opening '{url}'")))?;
            let total = file.metadata().await
                .map_err(|e| DashDemuxError::Io(e, String::from("reading file metadata")))?
                .len();
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await
                    .map_err(|e| DashDemuxError::Io(e, String::from("seeking in media file")))?;
            }
            let remaining = size.unwrap_or_else(|| total.saturating_sub(offset));
            return Ok(SegmentInput {
                size: Some(remaining),
                kind: SegmentInputKind::File { file, remaining },
            });
        }
        let mut req = self.client.get(parsed);
        if let Some(referer) = &self.referer {
            req = req.header(REFERER, referer);
        }
        if offset > 0 || size.is_some() {
            // restrict the HTTP request to the part we want
            let range = match size {
                Some(size) => format!("bytes={offset}-{}", offset + size.saturating_sub(1)),
                None => format!("bytes={offset}-"),
            };
            req = req.header(RANGE, range);
        }
        let response = req.send().await
            .map_err(|e| network_error("fetching media segment", e))?;
        if !response.status().is_success() {
            return Err(DashDemuxError::Network(
                format!("HTTP {} fetching segment '{url}'", response.status())));
        }
        let size = size.or_else(|| response.content_length());
        Ok(SegmentInput {
            size,
            kind: SegmentInputKind::Http { response, pending: Bytes::new() },
        })
    }
}

enum SegmentInputKind {
    Http { response: reqwest::Response, pending: Bytes },
    File { file: File, remaining: u64 },
}

/// An open handle on one segment (or one byte range of a resource).
pub struct SegmentInput {
    size: Option<u64>,
    kind: SegmentInputKind,
}

impl SegmentInput {
    /// Number of bytes this input will deliver, when known up front.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Read some bytes into `buf`. `Ok(0)` signals the end of the segment.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut self.kind {
            SegmentInputKind::Http { response, pending } => {
                if pending.is_empty() {
                    match response.chunk().await
                        .map_err(|e| network_error("reading segment body", e))?
                    {
                        Some(chunk) => *pending = chunk,
                        None => return Ok(0),
                    }
                }
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending[..n]);
                pending.advance(n);
                Ok(n)
            },
            SegmentInputKind::File { file, remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let limit = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = file.read(&mut buf[..limit]).await
                    .map_err(|e| DashDemuxError::Io(e, String::from("reading media file")))?;
                if n == 0 {
                    warn!("media file ended {remaining} bytes before the declared range");
                    *remaining = 0;
                }
                *remaining -= n as u64;
                Ok(n)
            },
        }
    }
}
