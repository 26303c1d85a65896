// Compact per-user recency index: one capped JSON document, MRU-first.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard cap on index rows (and therefore cached objects) per user.
pub const MAX_ENTRIES: usize = 80;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheIndexEntry {
    pub file_id: String,
    /// Last-touched wall time, ms since epoch.
    pub ts: u64,
    pub size: u64,
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

#[derive(Serialize, Deserialize)]
struct IndexDoc {
    v: u32,
    entries: Vec<CacheIndexEntry>,
}

/// In-memory copy of one user's index document. All mutation happens under
/// the store's lock; `save` is called in the same critical section so the
/// persisted document never lags a concurrent touch.
#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    entries: Vec<CacheIndexEntry>,
}

impl CacheIndex {
    pub fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<IndexDoc>(&raw) {
                Ok(doc) if doc.v == INDEX_VERSION => doc.entries,
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!("cache index {} unreadable: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        let mut idx = Self { path, entries };
        idx.entries.truncate(MAX_ENTRIES);
        idx
    }

    pub fn save(&self) {
        let doc = IndexDoc {
            v: INDEX_VERSION,
            entries: self.entries.clone(),
        };
        match serde_json::to_vec(&doc) {
            Ok(raw) => {
                if let Err(e) = fs::write(&self.path, raw) {
                    warn!("cache index write {} failed: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("cache index encode failed: {}", e),
        }
    }

    /// Move (or insert) an entry to the front. Returns the rows pushed out
    /// past the cap; the caller is responsible for deleting their payloads.
    pub fn touch(&mut self, entry: CacheIndexEntry) -> Vec<CacheIndexEntry> {
        self.entries.retain(|e| e.file_id != entry.file_id);
        self.entries.insert(0, entry);
        if self.entries.len() > MAX_ENTRIES {
            self.entries.split_off(MAX_ENTRIES)
        } else {
            Vec::new()
        }
    }

    /// Refresh only the timestamp of an existing row, keeping its metadata.
    pub fn touch_existing(&mut self, file_id: &str, now_ms: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.file_id == file_id) else {
            return false;
        };
        let mut entry = self.entries.remove(pos);
        entry.ts = now_ms;
        self.entries.insert(0, entry);
        true
    }

    pub fn remove(&mut self, file_id: &str) -> Option<CacheIndexEntry> {
        let pos = self.entries.iter().position(|e| e.file_id == file_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, file_id: &str) -> Option<&CacheIndexEntry> {
        self.entries.iter().find(|e| e.file_id == file_id)
    }

    pub fn entries(&self) -> &[CacheIndexEntry] {
        &self.entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Take up to `max` rows from the recency tail, least-recent first.
    pub fn take_oldest(&mut self, max: usize) -> Vec<CacheIndexEntry> {
        let keep = self.entries.len().saturating_sub(max);
        let mut tail = self.entries.split_off(keep);
        tail.reverse();
        tail
    }
}
