// Per-user content-addressed blob store with recency/size/TTL eviction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::index::{CacheIndex, CacheIndexEntry};
use crate::config::sanitize_id;
use crate::detect::reconcile_mime;
use crate::error::StorageError;

/// Cache generation; bumping it orphans all prior on-disk state.
const GENERATION: &str = "v1";

/// Most entries evicted per quota-recovery pass.
const QUOTA_EVICT_MAX: usize = 8;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Metadata carried alongside a cached payload (the "headers" of the store).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CachedBlob {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub size: u64,
    pub meta: BlobMeta,
}

/// Usage summary for the storage-management surface; `removed` is non-zero
/// only for cleanup calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUsage {
    pub total_bytes: u64,
    pub count: usize,
    pub oldest_ts: Option<u64>,
    pub newest_ts: Option<u64>,
    pub removed: usize,
}

/// One user's slice of the blob cache. Constructed once per authenticated
/// session; never shared across users.
pub struct ContentCache {
    user_id: String,
    dir: PathBuf,
    index: Mutex<CacheIndex>,
}

impl ContentCache {
    pub fn open(root: &Path, user_id: &str) -> Result<Self, StorageError> {
        let uid = sanitize_id(user_id);
        let gen_root = root.join(format!("files_{GENERATION}"));
        let dir = gen_root.join(&uid);
        fs::create_dir_all(&dir)?;
        let index = CacheIndex::load(gen_root.join(format!("index_{uid}.json")));
        Ok(Self {
            user_id: user_id.trim().to_string(),
            dir,
            index: Mutex::new(index),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn blob_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", sanitize_id(file_id)))
    }

    fn meta_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", sanitize_id(file_id)))
    }

    fn delete_payload(&self, file_id: &str) {
        let _ = fs::remove_file(self.blob_path(file_id));
        let _ = fs::remove_file(self.meta_path(file_id));
    }

    fn write_payload(&self, file_id: &str, blob: &[u8], meta: &BlobMeta) -> Result<(), StorageError> {
        fs::write(self.blob_path(file_id), blob)?;
        let raw = serde_json::to_vec(meta).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        fs::write(self.meta_path(file_id), raw)?;
        Ok(())
    }

    /// Store a blob. Best-effort: on a write failure the oldest entries are
    /// evicted to make room and the write retried once, then the failure is
    /// swallowed; a cache miss later is acceptable, a failed download is
    /// not.
    pub fn put(&self, file_id: &str, blob: &[u8], meta: BlobMeta) {
        let file_id = file_id.trim();
        if file_id.is_empty() {
            return;
        }

        let mut result = self.write_payload(file_id, blob, &meta);
        if result.is_err() {
            let victims = {
                let mut index = self.index.lock();
                let mut freed = 0u64;
                let mut victims = Vec::new();
                while freed < blob.len() as u64 && victims.len() < QUOTA_EVICT_MAX {
                    let mut tail = index.take_oldest(1);
                    let Some(victim) = tail.pop() else { break };
                    freed += victim.size;
                    victims.push(victim);
                }
                if !victims.is_empty() {
                    index.save();
                }
                victims
            };
            for victim in &victims {
                self.delete_payload(&victim.file_id);
            }
            debug!(
                "cache put retry after evicting {} entries user={}",
                victims.len(),
                self.user_id
            );
            result = self.write_payload(file_id, blob, &meta);
        }

        match result {
            Ok(()) => {
                let evicted = {
                    let mut index = self.index.lock();
                    let evicted = index.touch(CacheIndexEntry {
                        file_id: file_id.to_string(),
                        ts: now_ms(),
                        size: blob.len() as u64,
                        mime: meta.mime.clone(),
                        name: meta.name.clone(),
                        width: meta.width,
                        height: meta.height,
                        media_width: meta.media_width,
                        media_height: meta.media_height,
                    });
                    index.save();
                    evicted
                };
                for entry in &evicted {
                    self.delete_payload(&entry.file_id);
                }
            }
            Err(e) => warn!("cache put failed user={} file={}: {}", self.user_id, file_id, e),
        }
    }

    /// Fetch a blob and its reconciled metadata. Touches the recency index.
    /// A store miss for an indexed id drops the stale row.
    pub fn get(&self, file_id: &str) -> Option<CachedBlob> {
        let file_id = file_id.trim();
        if file_id.is_empty() {
            return None;
        }

        let bytes = match fs::read(self.blob_path(file_id)) {
            Ok(bytes) => bytes,
            Err(_) => {
                let mut index = self.index.lock();
                if index.remove(file_id).is_some() {
                    debug!("cache self-heal: dropped stale index row file={}", file_id);
                    index.save();
                }
                return None;
            }
        };

        let meta: BlobMeta = fs::read(self.meta_path(file_id))
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();

        let (hint, name) = {
            let mut index = self.index.lock();
            let hint = index
                .get(file_id)
                .and_then(|e| e.mime.clone())
                .or_else(|| meta.mime.clone());
            let name = index
                .get(file_id)
                .and_then(|e| e.name.clone())
                .or_else(|| meta.name.clone());
            if !index.touch_existing(file_id, now_ms()) {
                // Payload exists but the row was lost; re-seed it.
                index.touch(CacheIndexEntry {
                    file_id: file_id.to_string(),
                    ts: now_ms(),
                    size: bytes.len() as u64,
                    mime: meta.mime.clone(),
                    name: meta.name.clone(),
                    width: meta.width,
                    height: meta.height,
                    media_width: meta.media_width,
                    media_height: meta.media_height,
                });
            }
            index.save();
            (hint, name)
        };

        let mime = reconcile_mime(hint.as_deref(), name.as_deref(), &bytes);
        let size = bytes.len() as u64;
        Some(CachedBlob {
            bytes,
            mime,
            size,
            meta,
        })
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.index.lock().get(file_id.trim()).is_some()
    }

    /// Two-phase eviction: drop rows older than `ttl_ms`, then, if the
    /// remainder still exceeds `max_bytes`, keep the most-recently-touched
    /// prefix that fits. Idempotent.
    pub fn cleanup(&self, max_bytes: u64, ttl_ms: u64) -> CacheUsage {
        let now = now_ms();
        let victims = {
            let mut index = self.index.lock();
            let mut victims: Vec<CacheIndexEntry> = Vec::new();

            if ttl_ms > 0 {
                let entries = index.entries().to_vec();
                for entry in entries {
                    if now.saturating_sub(entry.ts) >= ttl_ms {
                        if let Some(removed) = index.remove(&entry.file_id) {
                            victims.push(removed);
                        }
                    }
                }
            }

            if max_bytes > 0 && index.total_bytes() > max_bytes {
                let mut kept = 0u64;
                let mut cut = index.entries().len();
                for (i, entry) in index.entries().iter().enumerate() {
                    if kept + entry.size > max_bytes {
                        cut = i;
                        break;
                    }
                    kept += entry.size;
                }
                let over: Vec<String> = index.entries()[cut..]
                    .iter()
                    .map(|e| e.file_id.clone())
                    .collect();
                for file_id in over {
                    if let Some(removed) = index.remove(&file_id) {
                        victims.push(removed);
                    }
                }
            }

            if !victims.is_empty() {
                index.save();
            }
            victims
        };

        for victim in &victims {
            self.delete_payload(&victim.file_id);
        }
        if !victims.is_empty() {
            debug!(
                "cache cleanup user={} removed={} max_bytes={} ttl_ms={}",
                self.user_id,
                victims.len(),
                max_bytes,
                ttl_ms
            );
        }

        let mut usage = self.usage();
        usage.removed = victims.len();
        usage
    }

    /// Usage snapshot served entirely from the index.
    pub fn usage(&self) -> CacheUsage {
        let index = self.index.lock();
        let entries = index.entries();
        CacheUsage {
            total_bytes: index.total_bytes(),
            count: entries.len(),
            oldest_ts: entries.iter().map(|e| e.ts).min(),
            newest_ts: entries.iter().map(|e| e.ts).max(),
            removed: 0,
        }
    }

    /// Index rows, most-recently-touched first (storage-management surface).
    pub fn list(&self) -> Vec<CacheIndexEntry> {
        self.index.lock().entries().to_vec()
    }

    /// Drop a single object (and its index row) outright.
    pub fn remove(&self, file_id: &str) {
        let removed = {
            let mut index = self.index.lock();
            let removed = index.remove(file_id.trim());
            if removed.is_some() {
                index.save();
            }
            removed
        };
        if removed.is_some() {
            self.delete_payload(file_id.trim());
        }
    }
}
