// Single resumable HTTP GET with Range/ETag semantics and bounded backoff.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DeviceProfile;
use crate::error::FetchError;

/// Why the client discarded partial progress and went back to offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Server answered a ranged request with 200.
    RangeIgnored,
    /// 206 Content-Range start did not match the requested offset.
    RangeMismatch,
    /// 416 at an offset the server cannot serve.
    RangeNotSatisfiable,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::RangeIgnored => "range_ignored",
            ResetReason::RangeMismatch => "range_mismatch",
            ResetReason::RangeNotSatisfiable => "range_not_satisfiable",
        }
    }
}

/// Receives the body chunk-by-chunk. A failed `on_chunk` or `on_reset` is
/// non-retryable: it means the downstream sink itself is broken.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn on_chunk(&self, chunk: Bytes) -> anyhow::Result<()>;
    fn on_progress(&self, _received: u64, _total: Option<u64>) {}
    fn on_reset(&self, _reason: ResetReason) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Supplies a replacement URL after an auth rejection (401/403).
#[async_trait]
pub trait UrlRefresher: Send + Sync {
    async fn refresh(&self, status: u16, offset: u64) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub offset: u64,
    pub etag: Option<String>,
    pub expected_size: Option<u64>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            offset: 0,
            etag: None,
            expected_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadLimits {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_url_refresh: u32,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(8_000),
            max_url_refresh: 2,
        }
    }
}

impl DownloadLimits {
    /// Limits tuned to the device class: slower networks back off longer.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        Self {
            base_delay: profile.base_delay,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Final URL the bytes came from (may differ after auth refreshes).
    pub url: String,
    pub received: u64,
    pub total: Option<u64>,
    pub etag: Option<String>,
    pub mime: Option<String>,
}

struct ContentRange {
    start: Option<u64>,
    size: Option<u64>,
}

// "bytes start-end/size" or "bytes */size"; size may be "*".
fn parse_content_range(raw: &str) -> Option<ContentRange> {
    let rest = raw.trim().strip_prefix("bytes")?.trim();
    let (range_part, size_part) = rest.split_once('/')?;
    let size = match size_part.trim() {
        "*" => None,
        s => Some(s.parse::<u64>().ok()?),
    };
    let range = range_part.trim();
    if range == "*" {
        return Some(ContentRange { start: None, size });
    }
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some(ContentRange {
        start: Some(start),
        size,
    })
}

// Seconds form only, clamped to one minute.
fn parse_retry_after(res: &Response) -> Option<Duration> {
    let secs: u64 = res
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(secs.min(60)))
}

fn header_str(res: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    let val = res.headers().get(name)?.to_str().ok()?.trim();
    if val.is_empty() {
        None
    } else {
        Some(val.to_string())
    }
}

/// Resumable HTTP download client. One instance is shared across transfers;
/// each `download` call is one logical transfer attempt with internal
/// retries.
pub struct ProtocolClient {
    http: Client,
}

impl ProtocolClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    async fn wait_backoff(
        &self,
        attempt: &mut u32,
        retry_after: Option<Duration>,
        limits: &DownloadLimits,
    ) {
        let exp = 1u32.checked_shl(*attempt).unwrap_or(u32::MAX);
        let backoff = limits.base_delay.saturating_mul(exp).min(limits.max_delay);
        let jitter = backoff.mul_f64(rand::thread_rng().gen_range(0.15..0.30));
        *attempt += 1;
        let delay = retry_after.unwrap_or(Duration::ZERO).max(backoff + jitter);
        tokio::time::sleep(delay).await;
    }

    /// Run the transfer to completion. Resumes from `request.offset`, resets
    /// to 0 when the server cannot honor the range, and retries transient
    /// failures with exponential backoff until `limits.max_retries`.
    pub async fn download(
        &self,
        request: DownloadRequest,
        limits: &DownloadLimits,
        sink: &dyn DownloadSink,
        refresher: Option<&dyn UrlRefresher>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, FetchError> {
        let mut url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(FetchError::MissingUrl);
        }
        let mut offset = request.offset;
        let mut etag = request
            .etag
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        let mut total = request.expected_size.filter(|s| *s > 0);
        let mut mime: Option<String> = None;
        let mut retry_attempt: u32 = 0;
        let mut refreshes: u32 = 0;

        // Discard partial progress; clears the etag so the next attempt is
        // an unconditional full GET.
        macro_rules! reset {
            ($reason:expr) => {{
                if offset > 0 {
                    debug!("download reset url={} reason={}", url, $reason.as_str());
                    offset = 0;
                    etag = None;
                    retry_attempt = 0;
                    sink.on_reset($reason)
                        .map_err(|e| FetchError::SinkFailed(e.to_string()))?;
                }
            }};
        }

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Aborted);
            }

            let mut req = self.http.get(&url);
            if offset > 0 {
                req = req.header(RANGE, format!("bytes={offset}-"));
                if let Some(tag) = &etag {
                    req = req.header(IF_RANGE, tag.clone());
                }
            }

            let res = match req.send().await {
                Ok(res) => res,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(FetchError::Aborted);
                    }
                    if retry_attempt >= limits.max_retries {
                        return Err(FetchError::Network(e.to_string()));
                    }
                    warn!("download request failed, retrying: {}", e);
                    self.wait_backoff(&mut retry_attempt, None, limits).await;
                    continue;
                }
            };

            let status = res.status().as_u16();

            if status == 401 || status == 403 {
                let Some(refresher) = refresher else {
                    return Err(FetchError::Http(status));
                };
                if refreshes >= limits.max_url_refresh {
                    return Err(FetchError::Http(status));
                }
                refreshes += 1;
                let fresh = refresher
                    .refresh(status, offset)
                    .await
                    .map_err(|_| FetchError::Http(status))?;
                let fresh = fresh.trim().to_string();
                if fresh.is_empty() {
                    return Err(FetchError::MissingUrl);
                }
                debug!("download url refreshed after http_{} offset={}", status, offset);
                url = fresh;
                retry_attempt = 0;
                continue;
            }

            if status == 429 || status == 503 {
                if retry_attempt >= limits.max_retries {
                    return Err(FetchError::Http(status));
                }
                let retry_after = parse_retry_after(&res);
                self.wait_backoff(&mut retry_attempt, retry_after, limits)
                    .await;
                continue;
            }

            if status == 416 {
                let cr = header_str(&res, CONTENT_RANGE).and_then(|v| parse_content_range(&v));
                let known = cr.and_then(|c| c.size).or(total);
                if let Some(size) = known {
                    if offset >= size {
                        // Already have the whole object.
                        return Ok(DownloadOutcome {
                            url,
                            received: size,
                            total: Some(size),
                            etag,
                            mime,
                        });
                    }
                }
                if offset == 0 {
                    return Err(FetchError::RangeNotSatisfiable);
                }
                reset!(ResetReason::RangeNotSatisfiable);
                continue;
            }

            if !(200..300).contains(&status) {
                if (500..600).contains(&status) && retry_attempt < limits.max_retries {
                    self.wait_backoff(&mut retry_attempt, None, limits).await;
                    continue;
                }
                return Err(FetchError::Http(status));
            }

            if status == 200 && offset > 0 {
                // Server ignored the Range request; the 200 body is the
                // whole object, so restart cleanly instead of appending.
                reset!(ResetReason::RangeIgnored);
            }

            // Header capture comes after any range-ignored reset so the
            // response's own ETag is what the outcome reports.
            if let Some(tag) = header_str(&res, ETAG) {
                etag = Some(tag);
            }
            if let Some(ct) = header_str(&res, CONTENT_TYPE) {
                mime = Some(ct);
            }

            if status == 206 {
                let cr = header_str(&res, CONTENT_RANGE).and_then(|v| parse_content_range(&v));
                if let Some(cr) = &cr {
                    if let Some(size) = cr.size {
                        total = Some(size);
                    }
                    if offset > 0 && cr.start != Some(offset) {
                        reset!(ResetReason::RangeMismatch);
                        continue;
                    }
                }
            } else if total.is_none() {
                if let Some(len) = header_str(&res, CONTENT_LENGTH)
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|l| *l > 0)
                {
                    total = Some(len);
                }
            }

            let mut body = res.bytes_stream();
            let mut body_failed = false;
            while let Some(next) = body.next().await {
                if cancel.is_cancelled() {
                    return Err(FetchError::Aborted);
                }
                match next {
                    Ok(chunk) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        let len = chunk.len() as u64;
                        sink.on_chunk(chunk)
                            .await
                            .map_err(|e| FetchError::SinkFailed(e.to_string()))?;
                        offset += len;
                        sink.on_progress(offset, total);
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return Err(FetchError::Aborted);
                        }
                        if retry_attempt >= limits.max_retries {
                            return Err(FetchError::Network(e.to_string()));
                        }
                        warn!(
                            "download body interrupted at offset {}, retrying: {}",
                            offset, e
                        );
                        self.wait_backoff(&mut retry_attempt, None, limits).await;
                        body_failed = true;
                        break;
                    }
                }
            }
            if body_failed {
                continue;
            }

            if let Some(total_bytes) = total {
                if offset < total_bytes {
                    if retry_attempt >= limits.max_retries {
                        return Err(FetchError::IncompleteBody);
                    }
                    self.wait_backoff(&mut retry_attempt, None, limits).await;
                    continue;
                }
            }

            return Ok(DownloadOutcome {
                url,
                received: offset,
                total,
                etag,
                mime,
            });
        }
    }
}

impl Default for ProtocolClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_forms() {
        let cr = parse_content_range("bytes 100-199/5000").unwrap();
        assert_eq!(cr.start, Some(100));
        assert_eq!(cr.size, Some(5000));

        let cr = parse_content_range("bytes */5242880").unwrap();
        assert_eq!(cr.start, None);
        assert_eq!(cr.size, Some(5242880));

        let cr = parse_content_range("bytes 0-99/*").unwrap();
        assert_eq!(cr.start, Some(0));
        assert_eq!(cr.size, None);

        assert!(parse_content_range("items 0-9/10").is_none());
        assert!(parse_content_range("bytes 9-0/10").is_none());
    }
}
