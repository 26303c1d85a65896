// UI-facing transfer list. Read model only; all mutation goes through
// match-by-id plus a pure patch closure.

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Offering,
    Uploading,
    Downloading,
    Uploaded,
    Complete,
    Error,
    Rejected,
}

impl TransferStatus {
    /// Statuses that mean the counterpart transfer is still live, which
    /// makes a `not_found` from the relay non-terminal.
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            TransferStatus::Offering | TransferStatus::Uploading | TransferStatus::Downloading
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferEntry {
    /// Client-local handle, stable across server id changes.
    pub local_id: u64,
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub direction: TransferDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub status: TransferStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared transfer list. Lock scope never outlives a single call.
pub struct TransferList {
    entries: RwLock<Vec<TransferEntry>>,
    next_local_id: RwLock<u64>,
}

impl TransferList {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_local_id: RwLock::new(1),
        }
    }

    fn alloc_local_id(&self) -> u64 {
        let mut next = self.next_local_id.write();
        let id = *next;
        *next += 1;
        id
    }

    /// Insert a fresh incoming-download entry, replacing a stale offer for
    /// the same id.
    pub fn upsert_download(
        &self,
        file_id: &str,
        name: &str,
        size: u64,
        mime: Option<String>,
        peer: Option<String>,
        room: Option<String>,
    ) -> u64 {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.id == file_id) {
            existing.name = name.to_string();
            existing.size = size;
            if mime.is_some() {
                existing.mime = mime;
            }
            existing.status = TransferStatus::Downloading;
            existing.progress = 0;
            existing.error = None;
            return existing.local_id;
        }
        let local_id = self.alloc_local_id();
        entries.push(TransferEntry {
            local_id,
            id: file_id.to_string(),
            name: name.to_string(),
            size,
            mime,
            direction: TransferDirection::Incoming,
            peer,
            room,
            status: TransferStatus::Downloading,
            progress: 0,
            url: None,
            error: None,
        });
        local_id
    }

    /// Apply a pure patch to the entry with this id. Returns whether an
    /// entry matched.
    pub fn update<F>(&self, file_id: &str, patch: F) -> bool
    where
        F: FnOnce(&mut TransferEntry),
    {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.id == file_id) {
            Some(entry) => {
                patch(entry);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, file_id: &str) -> Option<TransferEntry> {
        self.entries.read().iter().find(|e| e.id == file_id).cloned()
    }

    pub fn status_of(&self, file_id: &str) -> Option<TransferStatus> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == file_id)
            .map(|e| e.status)
    }

    pub fn remove(&self, file_id: &str) -> Option<TransferEntry> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.id == file_id)?;
        Some(entries.remove(pos))
    }

    pub fn snapshot(&self) -> Vec<TransferEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for TransferList {
    fn default() -> Self {
        Self::new()
    }
}
