// Download lifecycle driver. Consumes gateway events, runs the HTTP
// protocol client, falls back to the legacy chunk transport, and lands
// finished payloads in the per-user cache.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{BlobMeta, ContentCache};
use crate::detect::{classify_media, MediaKind};
use crate::error::{FetchError, WaiterError};
use crate::gateway::{FileUrlInfo, GatewayEvent, GatewayRequest, RelayLink, StreamSink};
use crate::policy::PolicyEngine;
use crate::protocol::{
    DownloadLimits, DownloadRequest, DownloadSink, ProtocolClient, ResetReason, UrlRefresher,
};
use crate::scheduler::{TransferIntent, TransferScheduler};
use crate::transfers::{TransferList, TransferStatus};

/// Mutable per-transfer record. Created on `file_download_begin` (or a
/// bare `file_url`), destroyed on any terminal transition.
struct DownloadState {
    name: String,
    size: u64,
    peer: Option<String>,
    room: Option<String>,
    mime: Option<String>,
    etag: Option<String>,
    chunks: Vec<Bytes>,
    received: u64,
    last_percent: u8,
    stream_id: Option<String>,
    fell_back: bool,
}

impl DownloadState {
    fn fresh(name: String, size: u64) -> Self {
        Self {
            name,
            size,
            peer: None,
            room: None,
            mime: None,
            etag: None,
            chunks: Vec::new(),
            received: 0,
            last_percent: 0,
            stream_id: None,
            fell_back: false,
        }
    }
}

/// A finished download handed to save/viewer continuations.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub bytes: Bytes,
    pub name: String,
    pub mime: Option<String>,
}

type DoneResult = Result<CompletedFile, String>;

pub struct DownloadOrchestrator {
    me: Weak<Self>,
    link: Arc<dyn RelayLink>,
    stream: Arc<dyn StreamSink>,
    scheduler: Arc<TransferScheduler>,
    transfers: Arc<TransferList>,
    cache: Arc<ContentCache>,
    policy: Arc<PolicyEngine>,
    client: ProtocolClient,
    limits: DownloadLimits,
    states: Mutex<HashMap<String, DownloadState>>,
    http_cancels: Mutex<HashMap<String, CancellationToken>>,
    done_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<DoneResult>>>>,
}

impl DownloadOrchestrator {
    pub fn new(
        link: Arc<dyn RelayLink>,
        stream: Arc<dyn StreamSink>,
        scheduler: Arc<TransferScheduler>,
        transfers: Arc<TransferList>,
        cache: Arc<ContentCache>,
        policy: Arc<PolicyEngine>,
        client: ProtocolClient,
    ) -> Arc<Self> {
        let limits = DownloadLimits::for_profile(scheduler.profile());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            link,
            stream,
            scheduler,
            transfers,
            cache,
            policy,
            client,
            limits,
            states: Mutex::new(HashMap::new()),
            http_cancels: Mutex::new(HashMap::new()),
            done_waiters: Mutex::new(HashMap::new()),
        })
    }

    pub fn transfers(&self) -> &Arc<TransferList> {
        &self.transfers
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler> {
        &self.scheduler
    }

    /// Ask for a transfer. Foreground requests surface in the UI; the
    /// scheduler decides when the `file_get` actually goes out.
    pub fn request(&self, file_id: &str, intent: TransferIntent) {
        self.scheduler.enqueue(file_id, intent);
    }

    /// Fetch-for-save: cached bytes immediately, otherwise a foreground
    /// download with a continuation resolved on the terminal transition.
    pub async fn fetch(&self, file_id: &str) -> DoneResult {
        if let Some(blob) = self.cache.get(file_id) {
            let name = blob.meta.name.clone().unwrap_or_default();
            return Ok(CompletedFile {
                bytes: Bytes::from(blob.bytes),
                name,
                mime: Some(blob.mime),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.done_waiters
            .lock()
            .entry(file_id.to_string())
            .or_default()
            .push(tx);
        self.scheduler.enqueue(file_id, TransferIntent::Foreground);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err("reset".to_string()),
        }
    }

    /// Bind an incoming transfer to a streaming sink instead of the
    /// in-memory buffer. Must happen before bytes start flowing.
    pub fn attach_stream(&self, file_id: &str, stream_id: &str) {
        let mut states = self.states.lock();
        let state = states
            .entry(file_id.to_string())
            .or_insert_with(|| DownloadState::fresh(String::new(), 0));
        state.stream_id = Some(stream_id.to_string());
    }

    /// Session teardown: cancel HTTP transfers, drop transfer state, and
    /// reject every pending continuation and waiter.
    pub fn reset(&self) {
        for token in self.http_cancels.lock().values() {
            token.cancel();
        }
        self.http_cancels.lock().clear();
        self.states.lock().clear();
        let waiters = std::mem::take(&mut *self.done_waiters.lock());
        for senders in waiters.into_values() {
            for tx in senders {
                let _ = tx.send(Err("reset".to_string()));
            }
        }
        self.scheduler.reset();
    }

    pub async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::FileDownloadBegin {
                file_id,
                name,
                size,
                from,
                room,
                mime,
            } => self.on_begin(&file_id, name, size, from, room, mime),
            GatewayEvent::FileUrl {
                file_id,
                url,
                thumb_url,
                name,
                size,
                mime,
                thumb_mime,
                media_w,
                media_h,
                thumb_w,
                thumb_h,
            } => {
                self.on_url(
                    &file_id,
                    url,
                    FileUrlMeta {
                        thumb_url,
                        name,
                        size,
                        mime,
                        thumb_mime,
                        media_w,
                        media_h,
                        thumb_w,
                        thumb_h,
                    },
                )
                .await
            }
            GatewayEvent::FileChunk { file_id, data } => self.on_legacy_chunk(&file_id, &data),
            GatewayEvent::FileDownloadComplete { file_id } => self.on_legacy_complete(&file_id),
            GatewayEvent::FileError {
                file_id,
                reason,
                peer,
            } => self.on_error(&file_id, reason.as_deref().unwrap_or("error"), peer),
        }
    }

    fn on_begin(
        &self,
        file_id: &str,
        name: Option<String>,
        size: Option<u64>,
        from: Option<String>,
        room: Option<String>,
        mime: Option<String>,
    ) {
        self.scheduler.clear_accept_retry(file_id);
        let name = name.unwrap_or_default();
        let size = size.unwrap_or(0);

        {
            let mut states = self.states.lock();
            // A live stream binding survives the re-begin.
            let stream_id = states.remove(file_id).and_then(|s| s.stream_id);
            let mut state = DownloadState::fresh(name.clone(), size);
            state.peer = from.clone();
            state.room = room.clone();
            state.mime = mime.clone();
            state.stream_id = stream_id;
            states.insert(file_id.to_string(), state);
        }

        if !self.scheduler.is_silent(file_id) {
            self.transfers
                .upsert_download(file_id, &name, size, mime, from, room);
        }
        self.scheduler.touch(file_id);
        debug!("download begin file={} size={}", file_id, size);
    }

    async fn on_url(&self, file_id: &str, url: Option<String>, meta: FileUrlMeta) {
        let url = url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());

        // Refresh answers never start a download.
        if let Some(url) = &url {
            let info = meta.to_info(url.clone());
            if self.scheduler.resolve_waiters(file_id, &info) {
                return;
            }
        } else if self.scheduler.has_waiters(file_id) {
            self.scheduler
                .reject_waiters(file_id, WaiterError::MissingUrl);
            return;
        }

        self.apply_url_meta(file_id, &meta);
        self.scheduler.touch(file_id);

        if self.scheduler.is_silent(file_id) {
            self.run_silent(file_id, url, meta).await;
            return;
        }

        let Some(url) = url else {
            // Legacy transport: the relay streams chunks itself.
            debug!("no transport url, expecting chunked delivery file={}", file_id);
            return;
        };

        let Some(orch) = self.me.upgrade() else {
            return;
        };
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            orch.run_http(&file_id, url).await;
        });
    }

    fn apply_url_meta(&self, file_id: &str, meta: &FileUrlMeta) {
        let mut states = self.states.lock();
        let state = states
            .entry(file_id.to_string())
            .or_insert_with(|| DownloadState::fresh(String::new(), 0));
        if let Some(name) = &meta.name {
            if !name.is_empty() {
                state.name = name.clone();
            }
        }
        if let Some(size) = meta.size {
            if size > 0 {
                state.size = size;
            }
        }
        if meta.mime.is_some() {
            state.mime = meta.mime.clone();
        }
    }

    async fn run_http(&self, file_id: &str, url: String) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let (offset, etag, size) = {
            let states = self.states.lock();
            match states.get(file_id) {
                Some(s) => (s.received, s.etag.clone(), s.size),
                None => (0, None, 0),
            }
        };

        let cancel = CancellationToken::new();
        self.http_cancels
            .lock()
            .insert(file_id.to_string(), cancel.clone());

        let sink = HttpSink {
            orch: me,
            file_id: file_id.to_string(),
        };
        let refresher = FreshUrlRefresher {
            scheduler: Arc::clone(&self.scheduler),
            file_id: file_id.to_string(),
        };
        let request = DownloadRequest {
            url,
            offset,
            etag,
            expected_size: (size > 0).then_some(size),
        };

        let outcome = self
            .client
            .download(request, &self.limits, &sink, Some(&refresher), &cancel)
            .await;
        self.http_cancels.lock().remove(file_id);

        match outcome {
            Ok(outcome) => {
                {
                    let mut states = self.states.lock();
                    if let Some(state) = states.get_mut(file_id) {
                        state.etag = outcome.etag.clone();
                        if state.mime.is_none() {
                            state.mime = outcome.mime.clone();
                        }
                        if state.size == 0 {
                            state.size = outcome.received;
                        }
                    }
                }
                self.finalize(file_id, true);
            }
            Err(FetchError::Aborted) => {
                debug!("http download aborted file={}", file_id);
            }
            Err(e) => {
                let can_fall_back = {
                    let states = self.states.lock();
                    states.get(file_id).map_or(false, |s| !s.fell_back)
                };
                if e.qualifies_for_fallback()
                    && can_fall_back
                    && self.scheduler.http_transport_enabled()
                {
                    warn!("http transfer failed, falling back file={}: {}", file_id, e);
                    self.fall_back(file_id);
                } else {
                    self.fail(file_id, &e.to_string());
                }
            }
        }
    }

    /// Re-issue the request over the legacy chunk transport and disable
    /// the HTTP transport for the rest of the session.
    fn fall_back(&self, file_id: &str) {
        self.scheduler.disable_http_transport();
        {
            let mut states = self.states.lock();
            if let Some(state) = states.get_mut(file_id) {
                state.chunks.clear();
                state.received = 0;
                state.last_percent = 0;
                state.etag = None;
                state.fell_back = true;
            }
        }
        self.transfers.update(file_id, |e| e.progress = 0);
        let sent = self.link.send(&GatewayRequest::FileGet {
            file_id: file_id.to_string(),
            transport: None,
        });
        if sent {
            self.scheduler.touch(file_id);
        } else {
            self.fail(file_id, "fallback_send_failed");
        }
    }

    async fn run_silent(&self, file_id: &str, url: Option<String>, meta: FileUrlMeta) {
        let (name, mime, size) = {
            let states = self.states.lock();
            match states.get(file_id) {
                Some(s) => (s.name.clone(), s.mime.clone(), s.size),
                None => (
                    meta.name.clone().unwrap_or_default(),
                    meta.mime.clone(),
                    meta.size.unwrap_or(0),
                ),
            }
        };
        let kind = classify_media(&name, mime.as_deref(), None);

        if url.is_none() {
            if let Some(thumb_url) = meta.thumb_url.clone() {
                self.fetch_thumbnail(file_id, thumb_url, &meta).await;
                self.scheduler.clear_not_found_retry(file_id);
                self.release_silent(file_id);
                return;
            }
            if kind == MediaKind::Video {
                // The relay generates video thumbnails lazily; poll again.
                self.release_silent(file_id);
                self.scheduler
                    .schedule_not_found_retry(file_id, TransferIntent::SilentPoll);
                return;
            }
            self.scheduler.clear_not_found_retry(file_id);
            self.release_silent(file_id);
            return;
        }

        if !self.policy.should_auto_fetch(self.cache.user_id(), kind, size) {
            debug!("auto-fetch declined file={} kind={:?} size={}", file_id, kind, size);
            self.scheduler.clear_not_found_retry(file_id);
            self.release_silent(file_id);
            return;
        }

        let url = url.unwrap_or_default();
        let buffer = BufferSink::default();
        let cancel = CancellationToken::new();
        self.http_cancels
            .lock()
            .insert(file_id.to_string(), cancel.clone());
        let result = self
            .client
            .download(
                DownloadRequest {
                    url,
                    offset: 0,
                    etag: None,
                    expected_size: (size > 0).then_some(size),
                },
                &self.limits,
                &buffer,
                None,
                &cancel,
            )
            .await;
        self.http_cancels.lock().remove(file_id);

        match result {
            Ok(outcome) => {
                let bytes = buffer.take();
                let mime = mime.or(outcome.mime);
                if self.policy.should_cache_preview(
                    self.cache.user_id(),
                    &name,
                    mime.as_deref(),
                    bytes.len() as u64,
                ) {
                    self.cache.put(
                        file_id,
                        &bytes,
                        BlobMeta {
                            mime,
                            name: (!name.is_empty()).then(|| name.clone()),
                            media_width: meta.media_w,
                            media_height: meta.media_h,
                            ..BlobMeta::default()
                        },
                    );
                    self.spawn_cleanup();
                }
                info!("silent fetch complete file={} bytes={}", file_id, bytes.len());
            }
            Err(e) => debug!("silent fetch failed file={}: {}", file_id, e),
        }
        self.scheduler.clear_not_found_retry(file_id);
        self.release_silent(file_id);
    }

    async fn fetch_thumbnail(&self, file_id: &str, thumb_url: String, meta: &FileUrlMeta) {
        let buffer = BufferSink::default();
        let cancel = CancellationToken::new();
        let result = self
            .client
            .download(
                DownloadRequest::new(thumb_url),
                &self.limits,
                &buffer,
                None,
                &cancel,
            )
            .await;
        match result {
            Ok(outcome) => {
                let bytes = buffer.take();
                let mime = meta.thumb_mime.clone().or(outcome.mime);
                let name = meta.name.clone().unwrap_or_default();
                if self.policy.should_cache_preview(
                    self.cache.user_id(),
                    &name,
                    mime.as_deref().or(Some("image/jpeg")),
                    bytes.len() as u64,
                ) {
                    self.cache.put(
                        &format!("thumb:{file_id}"),
                        &bytes,
                        BlobMeta {
                            mime,
                            name: (!name.is_empty()).then_some(name),
                            width: meta.thumb_w,
                            height: meta.thumb_h,
                            media_width: meta.media_w,
                            media_height: meta.media_h,
                        },
                    );
                    self.spawn_cleanup();
                }
                debug!("thumbnail cached file={} bytes={}", file_id, bytes.len());
            }
            Err(e) => debug!("thumbnail fetch failed file={}: {}", file_id, e),
        }
    }

    fn release_silent(&self, file_id: &str) {
        self.states.lock().remove(file_id);
        self.scheduler.release(file_id);
    }

    fn on_legacy_chunk(&self, file_id: &str, data: &str) {
        let chunk = match BASE64.decode(data) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("chunk decode failed file={}: {}", file_id, e);
                self.fail(file_id, "decode_failed");
                return;
            }
        };
        if let Err(reason) = self.absorb(file_id, chunk) {
            self.fail(file_id, reason);
            return;
        }
        self.note_progress(file_id);
        self.scheduler.touch(file_id);
    }

    fn on_legacy_complete(&self, file_id: &str) {
        self.finalize(file_id, false);
    }

    /// Terminal success path for both transports.
    fn finalize(&self, file_id: &str, via_http: bool) {
        let Some(state) = self.states.lock().remove(file_id) else {
            self.scheduler.release(file_id);
            return;
        };
        let silent = self.scheduler.is_silent(file_id);

        if let Some(stream_id) = &state.stream_id {
            self.stream.end(stream_id);
        }

        let mut buf = BytesMut::with_capacity(state.received as usize);
        for chunk in &state.chunks {
            buf.extend_from_slice(chunk);
        }
        let bytes = buf.freeze();

        info!(
            "download complete file={} bytes={} via={}",
            file_id,
            state.received,
            if via_http { "http" } else { "chunks" }
        );

        self.transfers.update(file_id, |e| {
            e.status = TransferStatus::Complete;
            e.progress = 100;
            e.error = None;
        });

        if via_http && !silent {
            let _ = self.link.send(&GatewayRequest::FileDownloaded {
                file_id: file_id.to_string(),
            });
        }

        self.resolve_done(
            file_id,
            Ok(CompletedFile {
                bytes: bytes.clone(),
                name: state.name.clone(),
                mime: state.mime.clone(),
            }),
        );

        if state.stream_id.is_none()
            && self.policy.should_cache_full(
                self.cache.user_id(),
                &state.name,
                state.mime.as_deref(),
                bytes.len() as u64,
            )
        {
            self.cache.put(
                file_id,
                &bytes,
                BlobMeta {
                    mime: state.mime.clone(),
                    name: (!state.name.is_empty()).then(|| state.name.clone()),
                    ..BlobMeta::default()
                },
            );
            self.spawn_cleanup();
        }

        self.scheduler.clear_not_found_retry(file_id);
        self.scheduler.release(file_id);
    }

    fn on_error(&self, file_id: &str, reason: &str, peer: Option<String>) {
        if reason == "not_found" {
            let upload_active = self.link.is_upload_active(file_id)
                || peer
                    .as_deref()
                    .map_or(false, |p| self.link.is_upload_active(p));
            let entry_live = self
                .transfers
                .status_of(file_id)
                .map_or(false, |s| s.in_progress());
            if upload_active || entry_live {
                let intent = self
                    .scheduler
                    .intent_of(file_id)
                    .unwrap_or(TransferIntent::Foreground);
                // The counterpart transfer has not landed on the relay
                // yet; keep the entry alive and come back, until the
                // retry budget runs out.
                if self.scheduler.schedule_not_found_retry(file_id, intent) {
                    debug!("not_found deferred file={}", file_id);
                    self.transfers.update(file_id, |e| {
                        if e.status == TransferStatus::Downloading {
                            e.status = TransferStatus::Offering;
                        }
                    });
                    self.states.lock().remove(file_id);
                    self.scheduler.release(file_id);
                    return;
                }
            }
        }

        self.fail(file_id, reason);
    }

    fn fail(&self, file_id: &str, reason: &str) {
        warn!("download failed file={} reason={}", file_id, reason);
        if let Some(token) = self.http_cancels.lock().remove(file_id) {
            token.cancel();
        }
        let state = self.states.lock().remove(file_id);
        if let Some(stream_id) = state.as_ref().and_then(|s| s.stream_id.as_deref()) {
            self.stream.error(stream_id, reason);
        }
        self.transfers.update(file_id, |e| {
            e.status = TransferStatus::Error;
            e.error = Some(reason.to_string());
        });
        self.resolve_done(file_id, Err(reason.to_string()));
        self.scheduler
            .reject_waiters(file_id, WaiterError::DownloadFailed);
        self.scheduler.clear_not_found_retry(file_id);
        self.scheduler.release(file_id);
    }

    fn resolve_done(&self, file_id: &str, result: DoneResult) {
        let senders = self.done_waiters.lock().remove(file_id);
        if let Some(senders) = senders {
            for tx in senders {
                let _ = tx.send(result.clone());
            }
        }
    }

    fn spawn_cleanup(&self) {
        let Some(orch) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let user_id = orch.cache.user_id().to_string();
            orch.policy.enforce_cache_policy(&user_id, &orch.cache, true);
        });
    }

    fn absorb(&self, file_id: &str, chunk: Bytes) -> Result<(), &'static str> {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(file_id) else {
            return Err("missing_state");
        };
        state.received += chunk.len() as u64;
        if let Some(stream_id) = &state.stream_id {
            if !self.stream.write(stream_id, chunk) {
                return Err("stream_failed");
            }
        } else {
            state.chunks.push(chunk);
        }
        Ok(())
    }

    fn note_progress(&self, file_id: &str) {
        let percent = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(file_id) else {
                return;
            };
            if state.size == 0 {
                return;
            }
            let percent = ((state.received * 100) / state.size).min(100) as u8;
            if percent == state.last_percent {
                return;
            }
            state.last_percent = percent;
            percent
        };
        self.transfers.update(file_id, |e| e.progress = percent);
    }

    fn rewind(&self, file_id: &str) -> anyhow::Result<()> {
        let broken_stream = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(file_id) else {
                return Err(anyhow!("missing_state"));
            };
            state.chunks.clear();
            state.received = 0;
            state.last_percent = 0;
            state.etag = None;
            state.stream_id.take()
        };
        if let Some(stream_id) = broken_stream {
            // Bytes already left through the stream; it cannot rewind.
            self.stream.error(&stream_id, "reset");
        }
        self.transfers.update(file_id, |e| e.progress = 0);
        Ok(())
    }
}

struct FileUrlMeta {
    thumb_url: Option<String>,
    name: Option<String>,
    size: Option<u64>,
    mime: Option<String>,
    thumb_mime: Option<String>,
    media_w: Option<u32>,
    media_h: Option<u32>,
    thumb_w: Option<u32>,
    thumb_h: Option<u32>,
}

impl FileUrlMeta {
    fn to_info(&self, url: String) -> FileUrlInfo {
        FileUrlInfo {
            url,
            name: self.name.clone().unwrap_or_default(),
            size: self.size.unwrap_or(0),
            mime: self.mime.clone(),
            thumb_url: self.thumb_url.clone(),
            thumb_mime: self.thumb_mime.clone(),
            media_w: self.media_w,
            media_h: self.media_h,
            thumb_w: self.thumb_w,
            thumb_h: self.thumb_h,
        }
    }
}

struct HttpSink {
    orch: Arc<DownloadOrchestrator>,
    file_id: String,
}

#[async_trait]
impl DownloadSink for HttpSink {
    async fn on_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.orch
            .absorb(&self.file_id, chunk)
            .map_err(|reason| anyhow!(reason))
    }

    fn on_progress(&self, _received: u64, _total: Option<u64>) {
        self.orch.note_progress(&self.file_id);
        self.orch.scheduler.touch(&self.file_id);
    }

    fn on_reset(&self, reason: ResetReason) -> anyhow::Result<()> {
        debug!("transfer rewound file={} reason={}", self.file_id, reason.as_str());
        self.orch.rewind(&self.file_id)
    }
}

struct FreshUrlRefresher {
    scheduler: Arc<TransferScheduler>,
    file_id: String,
}

#[async_trait]
impl UrlRefresher for FreshUrlRefresher {
    async fn refresh(&self, status: u16, offset: u64) -> anyhow::Result<String> {
        debug!(
            "requesting fresh url file={} after http_{} offset={}",
            self.file_id, status, offset
        );
        let info = self
            .scheduler
            .await_fresh_url(&self.file_id)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(info.url)
    }
}

/// Collects a whole body in memory; used for thumbnails and silent
/// previews that are policy-capped to a few megabytes.
#[derive(Default)]
struct BufferSink {
    buf: Mutex<BytesMut>,
}

impl BufferSink {
    fn take(&self) -> Bytes {
        std::mem::take(&mut *self.buf.lock()).freeze()
    }
}

#[async_trait]
impl DownloadSink for BufferSink {
    async fn on_chunk(&self, chunk: Bytes) -> anyhow::Result<()> {
        self.buf.lock().extend_from_slice(&chunk);
        Ok(())
    }

    fn on_reset(&self, _reason: ResetReason) -> anyhow::Result<()> {
        self.buf.lock().clear();
        Ok(())
    }
}
