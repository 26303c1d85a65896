// Wire types and collaborator seams for the relay gateway.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages this engine sends to the relay over the gateway channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayRequest {
    FileGet {
        file_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<Transport>,
    },
    FileDownloaded {
        file_id: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Http,
}

/// Messages the relay delivers for file transfers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    FileDownloadBegin {
        file_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        mime: Option<String>,
    },
    FileUrl {
        file_id: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        thumb_url: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default)]
        mime: Option<String>,
        #[serde(default)]
        thumb_mime: Option<String>,
        #[serde(default)]
        media_w: Option<u32>,
        #[serde(default)]
        media_h: Option<u32>,
        #[serde(default)]
        thumb_w: Option<u32>,
        #[serde(default)]
        thumb_h: Option<u32>,
    },
    FileChunk {
        file_id: String,
        /// Base64-encoded payload.
        data: String,
    },
    FileDownloadComplete {
        file_id: String,
    },
    FileError {
        file_id: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        peer: Option<String>,
    },
}

impl GatewayEvent {
    pub fn file_id(&self) -> &str {
        match self {
            GatewayEvent::FileDownloadBegin { file_id, .. }
            | GatewayEvent::FileUrl { file_id, .. }
            | GatewayEvent::FileChunk { file_id, .. }
            | GatewayEvent::FileDownloadComplete { file_id }
            | GatewayEvent::FileError { file_id, .. } => file_id,
        }
    }
}

/// Resolved transport URL plus the server-side metadata that arrived with it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUrlInfo {
    pub url: String,
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    pub thumb_url: Option<String>,
    pub thumb_mime: Option<String>,
    pub media_w: Option<u32>,
    pub media_h: Option<u32>,
    pub thumb_w: Option<u32>,
    pub thumb_h: Option<u32>,
}

/// Synchronous view of the gateway/transport collaborator. The engine only
/// ever pushes payloads and reads connection state; everything else about
/// the chat protocol is out of scope.
pub trait RelayLink: Send + Sync {
    /// Push a payload onto the wire; `false` means it was not accepted.
    fn send(&self, req: &GatewayRequest) -> bool;
    fn is_connected(&self) -> bool;
    fn is_authed(&self) -> bool;
    /// Whether an outbound upload for this file is still in progress.
    fn is_upload_active(&self, file_id: &str) -> bool;
}

/// Downstream sink for transfers that stream instead of buffering.
pub trait StreamSink: Send + Sync {
    /// Relay a chunk; `false` means the sink is broken.
    fn write(&self, stream_id: &str, chunk: Bytes) -> bool;
    fn end(&self, stream_id: &str);
    fn error(&self, stream_id: &str, reason: &str);
}
