// Device heuristics, transfer limits, and per-user persisted preferences.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Global ceiling for any silent/preview auto-fetch, regardless of user caps.
pub const PREVIEW_AUTO_MAX_BYTES: u64 = 8 * MB;

/// Hard per-kind ceilings for preview caching.
pub const PREVIEW_CACHE_VIDEO_CAP: u64 = 6 * MB;
pub const PREVIEW_CACHE_MEDIA_CAP: u64 = 24 * MB;

/// Upper clamp for per-kind auto-fetch caps loaded from disk.
const AUTO_FETCH_CAP_CLAMP: u64 = 250 * MB;

/// Absolute deadline for a fresh-URL waiter.
pub const URL_REFRESH_TIMEOUT: Duration = Duration::from_millis(12_000);

/// Minimum wall-time between liveness-timer re-arms for one file.
pub const LIVENESS_TOUCH_MIN_INTERVAL: Duration = Duration::from_millis(1_500);

/// Coarse network quality classes as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    Fast,
    Slow,
}

/// Capacities and timing derived once from device/network heuristics.
///
/// These are soft admission-control numbers, not OS-level limits; all
/// scheduler logic stays correct at `max_concurrent == 1`.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub constrained: bool,
    pub slow_network: bool,
    pub prefetch_allowed: bool,
    pub max_concurrent: usize,
    pub max_prefetch: usize,
    pub liveness_timeout: Duration,
    pub not_found_base_delay: Duration,
    /// Base backoff delay for the HTTP protocol client.
    pub base_delay: Duration,
}

impl DeviceProfile {
    pub fn detect(
        memory_gb: f64,
        network: NetworkClass,
        save_data: bool,
        mobile_like: bool,
    ) -> Self {
        let slow_network = save_data || network == NetworkClass::Slow;
        let constrained = mobile_like || memory_gb <= 4.0 || slow_network;
        let max_concurrent = if constrained {
            if slow_network {
                5
            } else {
                7
            }
        } else {
            10
        };
        let (pre_min, pre_max) = if slow_network { (3, 4) } else { (5, 7) };
        let max_prefetch =
            ((max_concurrent as f64 * 0.7).round() as usize).clamp(pre_min, pre_max);
        let liveness_timeout = Duration::from_millis(if slow_network {
            45_000
        } else if constrained {
            35_000
        } else {
            25_000
        });
        let not_found_base_delay = Duration::from_millis(if slow_network {
            1_400
        } else if constrained {
            1_100
        } else {
            850
        });
        let base_delay = Duration::from_millis(if slow_network {
            900
        } else if constrained {
            650
        } else {
            400
        });
        Self {
            constrained,
            slow_network,
            prefetch_allowed: !save_data,
            max_concurrent,
            max_prefetch,
            liveness_timeout,
            not_found_base_delay,
            base_delay,
        }
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::detect(8.0, NetworkClass::Fast, false, false)
    }
}

/// Per-kind size caps for silent auto-fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutoFetchPrefs {
    pub photo_max_bytes: u64,
    pub video_max_bytes: u64,
    pub file_max_bytes: u64,
}

impl Default for AutoFetchPrefs {
    fn default() -> Self {
        Self {
            photo_max_bytes: MB,
            video_max_bytes: 15 * MB,
            file_max_bytes: 3 * MB,
        }
    }
}

impl AutoFetchPrefs {
    fn normalized(mut self) -> Self {
        self.photo_max_bytes = self.photo_max_bytes.min(AUTO_FETCH_CAP_CLAMP);
        self.video_max_bytes = self.video_max_bytes.min(AUTO_FETCH_CAP_CLAMP);
        self.file_max_bytes = self.file_max_bytes.min(AUTO_FETCH_CAP_CLAMP);
        self
    }
}

pub const CACHE_SIZE_PRESETS: [u64; 4] = [GB, 5 * GB, 10 * GB, 30 * GB];
pub const CACHE_CLEAN_PRESETS_MS: [u64; 4] = [0, DAY_MS, 7 * DAY_MS, 30 * DAY_MS];

/// Per-user cache budget and auto-clean cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CachePrefs {
    pub max_bytes: u64,
    pub auto_clean_ms: u64,
    pub last_clean_at: u64,
}

impl Default for CachePrefs {
    fn default() -> Self {
        Self {
            max_bytes: 5 * GB,
            auto_clean_ms: 7 * DAY_MS,
            last_clean_at: 0,
        }
    }
}

impl CachePrefs {
    /// Values outside the preset sets come from corrupted storage; snap
    /// them to defaults rather than trusting them.
    fn normalized(mut self) -> Self {
        if !CACHE_SIZE_PRESETS.contains(&self.max_bytes) {
            self.max_bytes = CachePrefs::default().max_bytes;
        }
        if !CACHE_CLEAN_PRESETS_MS.contains(&self.auto_clean_ms) {
            self.auto_clean_ms = CachePrefs::default().auto_clean_ms;
        }
        self
    }
}

pub(crate) fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                (b as char).to_string()
            } else {
                format!("%{b:02x}")
            }
        })
        .collect()
}

/// Small per-user JSON documents under a preference directory.
#[derive(Debug, Clone)]
pub struct PrefsStore {
    dir: PathBuf,
}

impl PrefsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, prefix: &str, user_id: &str) -> PathBuf {
        self.dir
            .join(format!("{prefix}_v1_{}.json", sanitize_id(user_id)))
    }

    fn load<T: Default + for<'de> Deserialize<'de>>(&self, prefix: &str, user_id: &str) -> T {
        let path = self.path(prefix, user_id);
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!("prefs {} unreadable: {}", path.display(), e);
                T::default()
            }),
            Err(_) => T::default(),
        }
    }

    fn save<T: Serialize>(&self, prefix: &str, user_id: &str, prefs: &T) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("prefs dir create failed: {}", e);
            return;
        }
        let path = self.path(prefix, user_id);
        match serde_json::to_vec(prefs) {
            Ok(raw) => {
                if let Err(e) = fs::write(&path, raw) {
                    warn!("prefs write {} failed: {}", path.display(), e);
                }
            }
            Err(e) => warn!("prefs encode failed: {}", e),
        }
    }

    pub fn load_auto_fetch(&self, user_id: &str) -> AutoFetchPrefs {
        self.load::<AutoFetchPrefs>("auto_fetch_prefs", user_id)
            .normalized()
    }

    pub fn save_auto_fetch(&self, user_id: &str, prefs: &AutoFetchPrefs) {
        self.save("auto_fetch_prefs", user_id, &prefs.clone().normalized());
    }

    pub fn load_cache(&self, user_id: &str) -> CachePrefs {
        self.load::<CachePrefs>("cache_prefs", user_id).normalized()
    }

    pub fn save_cache(&self, user_id: &str, prefs: &CachePrefs) {
        self.save("cache_prefs", user_id, &prefs.clone().normalized());
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
