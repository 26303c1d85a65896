// Resumable HTTP transfer protocol: Range/If-Range resume with backoff.

pub mod client;

pub use client::{
    DownloadLimits, DownloadOutcome, DownloadRequest, DownloadSink, ProtocolClient, ResetReason,
    UrlRefresher,
};
