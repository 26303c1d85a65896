// Scheduler + orchestrator lifecycle against a fake relay link and a
// real axum fixture for the HTTP transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;

use attachment_engine::orchestrator::DownloadOrchestrator;
use attachment_engine::policy::PolicyEngine;
use attachment_engine::protocol::ProtocolClient;
use attachment_engine::scheduler::{TransferIntent, TransferScheduler};
use attachment_engine::transfers::{TransferList, TransferStatus};
use attachment_engine::{
    ContentCache, DeviceProfile, GatewayEvent, GatewayRequest, PrefsStore, RelayLink, StreamSink,
    Transport,
};

struct FakeLink {
    connected: AtomicBool,
    authed: AtomicBool,
    upload_active: AtomicBool,
    sends: Mutex<Vec<GatewayRequest>>,
}

impl FakeLink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            authed: AtomicBool::new(true),
            upload_active: AtomicBool::new(false),
            sends: Mutex::new(Vec::new()),
        })
    }

    fn sends(&self) -> Vec<GatewayRequest> {
        self.sends.lock().clone()
    }
}

impl RelayLink for FakeLink {
    fn send(&self, req: &GatewayRequest) -> bool {
        self.sends.lock().push(req.clone());
        true
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn is_authed(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }
    fn is_upload_active(&self, _file_id: &str) -> bool {
        self.upload_active.load(Ordering::SeqCst)
    }
}

struct NullStream;

impl StreamSink for NullStream {
    fn write(&self, _stream_id: &str, _chunk: Bytes) -> bool {
        true
    }
    fn end(&self, _stream_id: &str) {}
    fn error(&self, _stream_id: &str, _reason: &str) {}
}

#[derive(Default)]
struct RecordingStream {
    writes: Mutex<Vec<(String, Bytes)>>,
    ended: Mutex<Vec<String>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl StreamSink for RecordingStream {
    fn write(&self, stream_id: &str, chunk: Bytes) -> bool {
        self.writes.lock().push((stream_id.to_string(), chunk));
        true
    }
    fn end(&self, stream_id: &str) {
        self.ended.lock().push(stream_id.to_string());
    }
    fn error(&self, stream_id: &str, reason: &str) {
        self.errors
            .lock()
            .push((stream_id.to_string(), reason.to_string()));
    }
}

struct Harness {
    link: Arc<FakeLink>,
    orch: Arc<DownloadOrchestrator>,
    transfers: Arc<TransferList>,
    cache: Arc<ContentCache>,
    _root: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with_stream(Arc::new(NullStream))
}

fn harness_with_stream(stream: Arc<dyn StreamSink>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let link = FakeLink::new();
    let scheduler = TransferScheduler::new(DeviceProfile::default(), link.clone(), || true);
    let transfers = Arc::new(TransferList::new());
    let cache = Arc::new(ContentCache::open(root.path(), "tester").unwrap());
    let policy = Arc::new(PolicyEngine::new(PrefsStore::new(root.path().join("prefs"))));
    let orch = DownloadOrchestrator::new(
        link.clone(),
        stream,
        scheduler,
        transfers.clone(),
        cache.clone(),
        policy,
        ProtocolClient::new(),
    );
    Harness {
        link,
        orch,
        transfers,
        cache,
        _root: root,
    }
}

fn begin_event(file_id: &str, name: &str, size: u64) -> GatewayEvent {
    GatewayEvent::FileDownloadBegin {
        file_id: file_id.into(),
        name: Some(name.into()),
        size: Some(size),
        from: Some("peer1".into()),
        room: None,
        mime: None,
    }
}

fn url_event(file_id: &str, url: Option<String>, name: &str, size: u64) -> GatewayEvent {
    GatewayEvent::FileUrl {
        file_id: file_id.into(),
        url,
        thumb_url: None,
        name: Some(name.into()),
        size: Some(size),
        mime: None,
        thumb_mime: None,
        media_w: None,
        media_h: None,
        thumb_w: None,
        thumb_h: None,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_download_completes_notifies_and_caches() {
    let h = harness();
    let body: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();

    let app = Router::new().route("/file", {
        let body = body.clone();
        get(move || {
            let body = body.clone();
            async move { (StatusCode::OK, body) }
        })
    });
    let addr = spawn_server(app).await;

    h.orch.request("f1", TransferIntent::Foreground);
    assert!(matches!(
        h.link.sends()[0],
        GatewayRequest::FileGet {
            transport: Some(Transport::Http),
            ..
        }
    ));

    h.orch.handle_event(begin_event("f1", "notes.txt", 4096)).await;
    assert_eq!(h.transfers.status_of("f1"), Some(TransferStatus::Downloading));

    h.orch
        .handle_event(url_event(
            "f1",
            Some(format!("http://{addr}/file")),
            "notes.txt",
            4096,
        ))
        .await;

    let transfers = h.transfers.clone();
    wait_for(move || transfers.status_of("f1") == Some(TransferStatus::Complete)).await;

    let entry = h.transfers.get("f1").unwrap();
    assert_eq!(entry.progress, 100);
    assert_eq!(entry.error, None);

    // Relay learns about the completed HTTP transfer.
    let link = h.link.clone();
    wait_for(move || {
        link.sends()
            .iter()
            .any(|r| matches!(r, GatewayRequest::FileDownloaded { file_id } if file_id == "f1"))
    })
    .await;

    let cache = h.cache.clone();
    wait_for(move || cache.contains("f1")).await;
    let blob = h.cache.get("f1").unwrap();
    assert_eq!(blob.bytes, body);
    assert_eq!(blob.mime, "text/plain");

    assert_eq!(h.orch.scheduler().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_failure_falls_back_to_chunked_transport() {
    let h = harness();
    let payload = b"fallback payload delivered in chunks over the legacy transport";
    let size = payload.len() as u64;
    let app = Router::new().route("/gone", get(|| async { (StatusCode::NOT_FOUND, Vec::new()) }));
    let addr = spawn_server(app).await;

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.handle_event(begin_event("f1", "big.bin", size)).await;
    h.orch
        .handle_event(url_event(
            "f1",
            Some(format!("http://{addr}/gone")),
            "big.bin",
            size,
        ))
        .await;

    // Second file_get goes out without the http transport marker.
    let link = h.link.clone();
    wait_for(move || {
        link.sends()
            .iter()
            .any(|r| matches!(r, GatewayRequest::FileGet { transport: None, .. }))
    })
    .await;

    assert!(!h.orch.scheduler().http_transport_enabled());
    assert_ne!(h.transfers.status_of("f1"), Some(TransferStatus::Error));

    // The legacy chunk path then finishes the transfer.
    let half = payload.len() / 2;
    h.orch
        .handle_event(GatewayEvent::FileChunk {
            file_id: "f1".into(),
            data: BASE64.encode(&payload[..half]),
        })
        .await;
    h.orch
        .handle_event(GatewayEvent::FileChunk {
            file_id: "f1".into(),
            data: BASE64.encode(&payload[half..]),
        })
        .await;
    h.orch
        .handle_event(GatewayEvent::FileDownloadComplete {
            file_id: "f1".into(),
        })
        .await;

    assert_eq!(h.transfers.status_of("f1"), Some(TransferStatus::Complete));
    let blob = h.cache.get("f1").unwrap();
    assert_eq!(blob.bytes, payload);
}

#[tokio::test]
async fn legacy_chunk_flow_completes_and_caches() {
    let h = harness();
    let payload = b"\x89PNG\r\n\x1a\n tiny png-ish payload";

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch
        .handle_event(begin_event("f1", "pic.png", payload.len() as u64))
        .await;
    // No transport URL: the relay streams chunks itself.
    h.orch
        .handle_event(url_event("f1", None, "pic.png", payload.len() as u64))
        .await;

    let half = payload.len() / 2;
    h.orch
        .handle_event(GatewayEvent::FileChunk {
            file_id: "f1".into(),
            data: BASE64.encode(&payload[..half]),
        })
        .await;
    let entry = h.transfers.get("f1").unwrap();
    assert!(entry.progress > 0 && entry.progress < 100);

    h.orch
        .handle_event(GatewayEvent::FileChunk {
            file_id: "f1".into(),
            data: BASE64.encode(&payload[half..]),
        })
        .await;
    h.orch
        .handle_event(GatewayEvent::FileDownloadComplete {
            file_id: "f1".into(),
        })
        .await;

    let entry = h.transfers.get("f1").unwrap();
    assert_eq!(entry.status, TransferStatus::Complete);
    assert_eq!(entry.progress, 100);

    let blob = h.cache.get("f1").unwrap();
    assert_eq!(blob.bytes, payload);
    assert_eq!(blob.mime, "image/png");
    assert_eq!(h.orch.scheduler().in_flight_count(), 0);
}

#[tokio::test]
async fn not_found_during_counterpart_upload_is_not_terminal() {
    let h = harness();

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.handle_event(begin_event("f1", "doc.pdf", 1000)).await;

    h.link.upload_active.store(true, Ordering::SeqCst);
    h.orch
        .handle_event(GatewayEvent::FileError {
            file_id: "f1".into(),
            reason: Some("not_found".into()),
            peer: None,
        })
        .await;

    let entry = h.transfers.get("f1").unwrap();
    assert_eq!(entry.status, TransferStatus::Offering);
    assert_eq!(entry.error, None);
    assert!(!h.orch.scheduler().is_in_flight("f1"));
}

#[tokio::test]
async fn other_errors_are_terminal() {
    let h = harness();

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.handle_event(begin_event("f1", "doc.pdf", 1000)).await;
    h.orch
        .handle_event(GatewayEvent::FileError {
            file_id: "f1".into(),
            reason: Some("revoked".into()),
            peer: None,
        })
        .await;

    let entry = h.transfers.get("f1").unwrap();
    assert_eq!(entry.status, TransferStatus::Error);
    assert_eq!(entry.error.as_deref(), Some("revoked"));
    assert_eq!(h.orch.scheduler().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_serves_cached_bytes_without_network() {
    let h = harness();
    h.cache.put(
        "f1",
        b"cached-bytes",
        attachment_engine::BlobMeta {
            mime: Some("text/plain".into()),
            name: Some("note.txt".into()),
            ..Default::default()
        },
    );

    let file = h.orch.fetch("f1").await.unwrap();
    assert_eq!(file.bytes.as_ref(), b"cached-bytes");
    assert_eq!(file.name, "note.txt");
    // Nothing went over the wire.
    assert!(h.link.sends().is_empty());
}

#[tokio::test]
async fn reset_rejects_pending_fetch() {
    let h = harness();

    let orch = h.orch.clone();
    let pending = tokio::spawn(async move { orch.fetch("f1").await });
    tokio::task::yield_now().await;

    h.orch.reset();
    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err(), "reset");
    assert_eq!(h.orch.scheduler().in_flight_count(), 0);
}

#[tokio::test]
async fn begin_overwrites_stale_state_and_clears_offer() {
    let h = harness();

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.handle_event(begin_event("f1", "old.bin", 10)).await;
    h.transfers.update("f1", |e| {
        e.status = TransferStatus::Error;
        e.error = Some("stale".into());
    });

    h.orch.handle_event(begin_event("f1", "new.bin", 20)).await;
    let entry = h.transfers.get("f1").unwrap();
    assert_eq!(entry.name, "new.bin");
    assert_eq!(entry.size, 20);
    assert_eq!(entry.status, TransferStatus::Downloading);
    assert_eq!(entry.error, None);
}

#[tokio::test]
async fn not_found_with_spent_budget_is_terminal() {
    let h = harness();

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.handle_event(begin_event("f1", "doc.pdf", 1000)).await;
    h.link.upload_active.store(true, Ordering::SeqCst);

    // Deferral budget is 6; burn all of it so the next not_found has
    // nowhere left to go.
    for _ in 0..6 {
        assert!(h
            .orch
            .scheduler()
            .schedule_not_found_retry("f1", TransferIntent::Foreground));
    }

    h.orch
        .handle_event(GatewayEvent::FileError {
            file_id: "f1".into(),
            reason: Some("not_found".into()),
            peer: None,
        })
        .await;

    let entry = h.transfers.get("f1").unwrap();
    assert_eq!(entry.status, TransferStatus::Error);
    assert_eq!(entry.error.as_deref(), Some("not_found"));
    assert_eq!(h.orch.scheduler().in_flight_count(), 0);
}

#[tokio::test]
async fn attached_stream_relays_chunks_and_ends() {
    let stream = Arc::new(RecordingStream::default());
    let h = harness_with_stream(stream.clone());
    let payload = b"streamed bytes never touch the in-memory buffer";

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.attach_stream("f1", "s1");
    h.orch
        .handle_event(begin_event("f1", "clip.bin", payload.len() as u64))
        .await;
    h.orch
        .handle_event(url_event("f1", None, "clip.bin", payload.len() as u64))
        .await;

    h.orch
        .handle_event(GatewayEvent::FileChunk {
            file_id: "f1".into(),
            data: BASE64.encode(payload),
        })
        .await;
    h.orch
        .handle_event(GatewayEvent::FileDownloadComplete {
            file_id: "f1".into(),
        })
        .await;

    {
        let writes = stream.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "s1");
        assert_eq!(writes[0].1.as_ref(), &payload[..]);
    }
    assert_eq!(stream.ended.lock().as_slice(), ["s1"]);
    assert!(stream.errors.lock().is_empty());
    assert_eq!(h.transfers.status_of("f1"), Some(TransferStatus::Complete));
    // Streamed bytes are relayed, not buffered, so nothing is cached.
    assert!(!h.cache.contains("f1"));
}

#[tokio::test]
async fn attached_stream_sees_terminal_error() {
    let stream = Arc::new(RecordingStream::default());
    let h = harness_with_stream(stream.clone());

    h.orch.request("f1", TransferIntent::Foreground);
    h.orch.attach_stream("f1", "s1");
    h.orch.handle_event(begin_event("f1", "clip.bin", 100)).await;
    h.orch
        .handle_event(GatewayEvent::FileChunk {
            file_id: "f1".into(),
            data: BASE64.encode(b"partial"),
        })
        .await;

    h.orch
        .handle_event(GatewayEvent::FileError {
            file_id: "f1".into(),
            reason: Some("revoked".into()),
            peer: None,
        })
        .await;

    assert_eq!(
        stream.errors.lock().as_slice(),
        [("s1".to_string(), "revoked".to_string())]
    );
    assert!(stream.ended.lock().is_empty());
    assert_eq!(h.transfers.status_of("f1"), Some(TransferStatus::Error));
}
