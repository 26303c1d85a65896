// Cache policy: pure decision functions over size, kind, and user caps.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::store::now_ms;
use crate::cache::ContentCache;
use crate::config::{
    AutoFetchPrefs, CachePrefs, PrefsStore, PREVIEW_AUTO_MAX_BYTES, PREVIEW_CACHE_MEDIA_CAP,
    PREVIEW_CACHE_VIDEO_CAP,
};
use crate::detect::{classify_media, MediaKind};

/// Is this object small enough to fetch without the user asking?
/// The per-kind cap is further bounded by the global preview ceiling.
pub fn should_auto_fetch(kind: MediaKind, size: u64, prefs: &AutoFetchPrefs) -> bool {
    if size == 0 {
        return false;
    }
    let cap = match kind {
        MediaKind::Image => prefs.photo_max_bytes,
        MediaKind::Video => prefs.video_max_bytes,
        MediaKind::Audio | MediaKind::Other => prefs.file_max_bytes,
    };
    if cap == 0 {
        return false;
    }
    size <= cap.min(PREVIEW_AUTO_MAX_BYTES)
}

/// Is this object worth keeping as a preview? Small media only, under a
/// hard per-kind ceiling and the user's cache budget.
pub fn should_cache_preview(
    name: &str,
    mime: Option<&str>,
    size: u64,
    prefs: &CachePrefs,
) -> bool {
    if prefs.max_bytes == 0 || size == 0 {
        return false;
    }
    let kind = classify_media(name, mime, None);
    if kind == MediaKind::Other {
        return false;
    }
    let hard_cap = if kind == MediaKind::Video {
        PREVIEW_CACHE_VIDEO_CAP
    } else {
        PREVIEW_CACHE_MEDIA_CAP
    };
    size <= hard_cap.min(prefs.max_bytes)
}

/// Is a fully downloaded object worth persisting at all?
pub fn should_cache_full(name: &str, mime: Option<&str>, size: u64, prefs: &CachePrefs) -> bool {
    if prefs.max_bytes == 0 || size == 0 || size > prefs.max_bytes {
        return false;
    }
    !name.trim().is_empty() || mime.map_or(false, |m| !m.trim().is_empty())
}

/// Per-user policy front-end: caches the persisted preference documents and
/// re-reads them when told they changed.
pub struct PolicyEngine {
    store: PrefsStore,
    cached: Mutex<HashMap<String, (AutoFetchPrefs, CachePrefs)>>,
}

impl PolicyEngine {
    pub fn new(store: PrefsStore) -> Self {
        Self {
            store,
            cached: Mutex::new(HashMap::new()),
        }
    }

    fn prefs_for(&self, user_id: &str) -> (AutoFetchPrefs, CachePrefs) {
        let mut cached = self.cached.lock();
        cached
            .entry(user_id.to_string())
            .or_insert_with(|| {
                (
                    self.store.load_auto_fetch(user_id),
                    self.store.load_cache(user_id),
                )
            })
            .clone()
    }

    /// Drop the cached copy so the next decision re-reads the documents.
    /// Call when the persisted preference for `user_id` changed.
    pub fn invalidate(&self, user_id: &str) {
        self.cached.lock().remove(user_id);
    }

    pub fn set_auto_fetch(&self, user_id: &str, prefs: &AutoFetchPrefs) {
        self.store.save_auto_fetch(user_id, prefs);
        self.invalidate(user_id);
    }

    pub fn set_cache_prefs(&self, user_id: &str, prefs: &CachePrefs) {
        self.store.save_cache(user_id, prefs);
        self.invalidate(user_id);
    }

    pub fn should_auto_fetch(&self, user_id: &str, kind: MediaKind, size: u64) -> bool {
        let (auto, _) = self.prefs_for(user_id);
        should_auto_fetch(kind, size, &auto)
    }

    pub fn should_cache_preview(&self, user_id: &str, name: &str, mime: Option<&str>, size: u64) -> bool {
        let (_, cache) = self.prefs_for(user_id);
        should_cache_preview(name, mime, size, &cache)
    }

    pub fn should_cache_full(&self, user_id: &str, name: &str, mime: Option<&str>, size: u64) -> bool {
        let (_, cache) = self.prefs_for(user_id);
        should_cache_full(name, mime, size, &cache)
    }

    /// Trim the user's cache to budget/TTL. `force` runs the trim even when
    /// the periodic cadence has not elapsed (used right after writes);
    /// the cadence timestamp is only advanced on a due periodic run.
    pub fn enforce_cache_policy(&self, user_id: &str, cache: &ContentCache, force: bool) {
        let (_, prefs) = self.prefs_for(user_id);
        let now = now_ms();
        let due = prefs.auto_clean_ms > 0
            && now.saturating_sub(prefs.last_clean_at) >= prefs.auto_clean_ms;
        if !force && !due {
            return;
        }
        let usage = cache.cleanup(prefs.max_bytes, prefs.auto_clean_ms);
        debug!(
            "cache policy user={} removed={} total_bytes={}",
            user_id, usage.removed, usage.total_bytes
        );
        if due {
            let mut next = prefs;
            next.last_clean_at = now;
            self.store.save_cache(user_id, &next);
            self.invalidate(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn auto_fetch_respects_kind_caps_and_ceiling() {
        let prefs = AutoFetchPrefs::default();
        assert!(should_auto_fetch(MediaKind::Image, MB, &prefs));
        assert!(!should_auto_fetch(MediaKind::Image, MB + 1, &prefs));
        // Video pref is 15 MB but the global preview ceiling is 8 MB.
        assert!(should_auto_fetch(MediaKind::Video, 8 * MB, &prefs));
        assert!(!should_auto_fetch(MediaKind::Video, 8 * MB + 1, &prefs));
        assert!(!should_auto_fetch(MediaKind::Other, 0, &prefs));

        let off = AutoFetchPrefs {
            photo_max_bytes: 0,
            ..prefs
        };
        assert!(!should_auto_fetch(MediaKind::Image, 100, &off));
    }

    #[test]
    fn preview_cache_is_media_only_with_hard_caps() {
        let prefs = CachePrefs::default();
        assert!(should_cache_preview("a.jpg", None, 2 * MB, &prefs));
        assert!(!should_cache_preview("a.zip", None, 2 * MB, &prefs));
        assert!(should_cache_preview("a.mp4", None, 6 * MB, &prefs));
        assert!(!should_cache_preview("a.mp4", None, 6 * MB + 1, &prefs));
        assert!(!should_cache_preview("a.png", None, 24 * MB + 1, &prefs));

        let disabled = CachePrefs {
            max_bytes: 0,
            ..prefs
        };
        assert!(!should_cache_preview("a.jpg", None, MB, &disabled));
    }

    #[test]
    fn full_cache_needs_budget_and_identity() {
        let prefs = CachePrefs::default();
        assert!(should_cache_full("doc.pdf", None, MB, &prefs));
        assert!(should_cache_full("", Some("image/png"), MB, &prefs));
        assert!(!should_cache_full("", None, MB, &prefs));
        assert!(!should_cache_full("doc.pdf", None, prefs.max_bytes + 1, &prefs));
    }

    #[test]
    fn engine_rereads_after_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrefsStore::new(dir.path());
        let engine = PolicyEngine::new(PrefsStore::new(dir.path()));

        assert!(engine.should_auto_fetch("u1", MediaKind::Image, MB));

        store.save_auto_fetch(
            "u1",
            &AutoFetchPrefs {
                photo_max_bytes: 100,
                ..AutoFetchPrefs::default()
            },
        );
        // Stale copy until invalidated.
        assert!(engine.should_auto_fetch("u1", MediaKind::Image, MB));
        engine.invalidate("u1");
        assert!(!engine.should_auto_fetch("u1", MediaKind::Image, MB));
    }
}
