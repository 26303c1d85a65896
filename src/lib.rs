//! Resumable attachment fetch engine for relay-served files.
//!
//! The relay hands out short-lived HTTP URLs for attachments; this crate
//! downloads them with Range resume, bounded concurrency, and a per-user
//! content cache, falling back to the relay's legacy chunked transport
//! when HTTP is not viable.

pub mod cache;
pub mod config;
pub mod detect;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod protocol;
pub mod scheduler;
pub mod transfers;

pub use cache::{BlobMeta, CacheUsage, CachedBlob, ContentCache};
pub use config::{AutoFetchPrefs, CachePrefs, DeviceProfile, NetworkClass, PrefsStore};
pub use detect::{classify_media, MediaKind};
pub use error::{FetchError, StorageError, WaiterError};
pub use gateway::{FileUrlInfo, GatewayEvent, GatewayRequest, RelayLink, StreamSink, Transport};
pub use orchestrator::{CompletedFile, DownloadOrchestrator};
pub use policy::{should_auto_fetch, should_cache_full, should_cache_preview, PolicyEngine};
pub use protocol::{
    DownloadLimits, DownloadOutcome, DownloadRequest, DownloadSink, ProtocolClient, UrlRefresher,
};
pub use scheduler::{TransferIntent, TransferScheduler};
pub use transfers::{TransferDirection, TransferEntry, TransferList, TransferStatus};
