// Transfer admission control: two-class queues, bounded in-flight set,
// liveness timers, and correlation records for fresh-URL requests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DeviceProfile, LIVENESS_TOUCH_MIN_INTERVAL, URL_REFRESH_TIMEOUT};
use crate::error::WaiterError;
use crate::gateway::{FileUrlInfo, GatewayRequest, RelayLink, Transport};

const NOT_FOUND_MAX_ATTEMPTS: u32 = 6;
const NOT_FOUND_MAX_DELAY: Duration = Duration::from_secs(20);
const ACCEPT_BASE_DELAY: Duration = Duration::from_millis(1_200);
const ACCEPT_MAX_DELAY: Duration = Duration::from_secs(15);
const ACCEPT_MAX_ATTEMPTS: u32 = 4;

/// Why a transfer was requested. Determines queue class, concurrency
/// budget, and whether the transfer surfaces in the UI at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferIntent {
    /// User asked for it; high queue, never gated.
    Foreground,
    /// Speculative warm-up; prefetch queue, gated on visibility.
    Prefetch,
    /// Silent poll for previews/thumbnails; prefetch queue, no UI entry.
    SilentPoll,
}

impl TransferIntent {
    pub fn prefetch_class(&self) -> bool {
        matches!(self, TransferIntent::Prefetch | TransferIntent::SilentPoll)
    }

    pub fn silent(&self) -> bool {
        matches!(self, TransferIntent::SilentPoll)
    }
}

struct InFlight {
    intent: TransferIntent,
    liveness: CancellationToken,
    gen: u64,
    last_touch: Instant,
}

struct RetryState {
    attempts: u32,
    token: CancellationToken,
}

type WaiterResult = Result<FileUrlInfo, WaiterError>;

struct UrlWaiter {
    senders: Vec<oneshot::Sender<WaiterResult>>,
    deadline: CancellationToken,
}

#[derive(Default)]
struct SchedState {
    high: VecDeque<String>,
    prefetch: VecDeque<String>,
    queued: HashMap<String, TransferIntent>,
    in_flight: HashMap<String, InFlight>,
    not_found_retries: HashMap<String, RetryState>,
    accept_retries: HashMap<String, RetryState>,
    waiters: HashMap<String, UrlWaiter>,
    http_disabled: bool,
    gen_counter: u64,
}

/// Decides when each transfer is allowed to start and keeps stalled ones
/// from pinning their slots. All shared state lives behind one mutex;
/// guards are never held across an await.
pub struct TransferScheduler {
    me: Weak<Self>,
    profile: DeviceProfile,
    link: Arc<dyn RelayLink>,
    ui_visible: Box<dyn Fn() -> bool + Send + Sync>,
    state: Mutex<SchedState>,
}

fn jittered(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let delay = base.saturating_mul(exp).min(cap);
    delay + delay.mul_f64(rand::thread_rng().gen_range(0.15..0.30))
}

impl TransferScheduler {
    pub fn new(
        profile: DeviceProfile,
        link: Arc<dyn RelayLink>,
        ui_visible: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            profile,
            link,
            ui_visible: Box::new(ui_visible),
            state: Mutex::new(SchedState::default()),
        })
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// One-way switch for this session: after a transport fallback every
    /// `file_get` goes out without the HTTP transport marker.
    pub fn disable_http_transport(&self) {
        let mut state = self.state.lock();
        if !state.http_disabled {
            warn!("http transport disabled for this session");
            state.http_disabled = true;
        }
    }

    pub fn http_transport_enabled(&self) -> bool {
        !self.state.lock().http_disabled
    }

    fn transport(state: &SchedState) -> Option<Transport> {
        if state.http_disabled {
            None
        } else {
            Some(Transport::Http)
        }
    }

    /// Queue a transfer. Duplicates of anything queued or in flight are
    /// dropped, as are prefetch-class requests when prefetching is off or
    /// the UI is hidden.
    pub fn enqueue(&self, file_id: &str, intent: TransferIntent) {
        let file_id = file_id.trim();
        if file_id.is_empty() {
            return;
        }
        if intent.prefetch_class() && (!self.profile.prefetch_allowed || !(self.ui_visible)()) {
            debug!("prefetch suppressed file={}", file_id);
            return;
        }
        {
            let mut state = self.state.lock();
            if state.queued.contains_key(file_id) || state.in_flight.contains_key(file_id) {
                return;
            }
            state.queued.insert(file_id.to_string(), intent);
            if intent.prefetch_class() {
                state.prefetch.push_back(file_id.to_string());
            } else {
                state.high.push_back(file_id.to_string());
            }
        }
        self.drain();
    }

    /// Move queued transfers into flight up to the concurrency budgets.
    /// High class fills to `max_concurrent`; prefetch class additionally
    /// honors `max_prefetch`.
    pub fn drain(&self) {
        if !self.link.is_connected() || !self.link.is_authed() {
            return;
        }

        let candidates = {
            let mut state = self.state.lock();
            let mut picked: Vec<(String, TransferIntent, CancellationToken, u64)> = Vec::new();
            loop {
                let in_flight = state.in_flight.len();
                if in_flight >= self.profile.max_concurrent {
                    break;
                }
                let prefetch_in_flight = state
                    .in_flight
                    .values()
                    .filter(|f| f.intent.prefetch_class())
                    .count();
                let next = if let Some(id) = state.high.pop_front() {
                    id
                } else if prefetch_in_flight < self.profile.max_prefetch {
                    match state.prefetch.pop_front() {
                        Some(id) => id,
                        None => break,
                    }
                } else {
                    break;
                };
                let Some(intent) = state.queued.remove(&next) else {
                    continue;
                };
                state.gen_counter += 1;
                let gen = state.gen_counter;
                let token = CancellationToken::new();
                state.in_flight.insert(
                    next.clone(),
                    InFlight {
                        intent,
                        liveness: token.clone(),
                        gen,
                        last_touch: Instant::now(),
                    },
                );
                picked.push((next, intent, token, gen));
            }
            picked
        };

        for (file_id, intent, token, gen) in candidates {
            self.start(&file_id, intent, token, gen);
        }
    }

    fn start(&self, file_id: &str, intent: TransferIntent, token: CancellationToken, gen: u64) {
        if self.link.is_upload_active(file_id) {
            // The counterpart upload has not finished; asking now would
            // race it. Give the slot back and come back later.
            debug!("start deferred, upload active file={}", file_id);
            token.cancel();
            self.state.lock().in_flight.remove(file_id);
            self.schedule_not_found_retry(file_id, intent);
            self.drain();
            return;
        }

        let transport = Self::transport(&self.state.lock());
        let sent = self.link.send(&GatewayRequest::FileGet {
            file_id: file_id.to_string(),
            transport,
        });
        if !sent {
            warn!("file_get send failed file={}", file_id);
            token.cancel();
            let mut state = self.state.lock();
            state.in_flight.remove(file_id);
            state.queued.insert(file_id.to_string(), intent);
            if intent.prefetch_class() {
                state.prefetch.push_front(file_id.to_string());
            } else {
                state.high.push_front(file_id.to_string());
            }
            return;
        }

        debug!("transfer started file={} intent={:?}", file_id, intent);
        self.arm_liveness(file_id, token, gen);
    }

    fn arm_liveness(&self, file_id: &str, token: CancellationToken, gen: u64) {
        let Some(scheduler) = self.me.upgrade() else {
            return;
        };
        let file_id = file_id.to_string();
        let timeout = self.profile.liveness_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let fired = {
                        let mut state = scheduler.state.lock();
                        match state.in_flight.get(&file_id) {
                            Some(f) if f.gen == gen => {
                                state.in_flight.remove(&file_id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if fired {
                        warn!("transfer liveness timeout file={}", file_id);
                        scheduler.drain();
                    }
                }
            }
        });
    }

    /// Progress signal: re-arms the liveness timer, at most once per
    /// 1500ms per file.
    pub fn touch(&self, file_id: &str) {
        let rearm = {
            let mut state = self.state.lock();
            let Some(flight) = state.in_flight.get_mut(file_id) else {
                return;
            };
            if flight.last_touch.elapsed() < LIVENESS_TOUCH_MIN_INTERVAL {
                return;
            }
            flight.liveness.cancel();
            state.gen_counter += 1;
            let gen = state.gen_counter;
            let token = CancellationToken::new();
            let Some(flight) = state.in_flight.get_mut(file_id) else {
                return;
            };
            flight.liveness = token.clone();
            flight.gen = gen;
            flight.last_touch = Instant::now();
            (token, gen)
        };
        self.arm_liveness(file_id, rearm.0, rearm.1);
    }

    /// Release the in-flight slot on a terminal transition and pull the
    /// next queued transfer in. Does not touch the not-found retry chain;
    /// callers end that explicitly when the transfer is truly done.
    pub fn release(&self, file_id: &str) {
        let removed = {
            let mut state = self.state.lock();
            if let Some(flight) = state.in_flight.remove(file_id) {
                flight.liveness.cancel();
                true
            } else {
                false
            }
        };
        if removed {
            self.drain();
        }
    }

    pub fn is_in_flight(&self, file_id: &str) -> bool {
        self.state.lock().in_flight.contains_key(file_id)
    }

    pub fn is_queued(&self, file_id: &str) -> bool {
        self.state.lock().queued.contains_key(file_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Whether this transfer runs without a UI entry.
    pub fn is_silent(&self, file_id: &str) -> bool {
        self.state
            .lock()
            .in_flight
            .get(file_id)
            .map_or(false, |f| f.intent.silent())
    }

    pub fn intent_of(&self, file_id: &str) -> Option<TransferIntent> {
        self.state.lock().in_flight.get(file_id).map(|f| f.intent)
    }

    /// Defer a transfer whose object is not available yet. Bounded
    /// attempts with exponential backoff and jitter; returns false once
    /// the attempts are spent.
    pub fn schedule_not_found_retry(&self, file_id: &str, intent: TransferIntent) -> bool {
        let (attempts, token) = {
            let mut state = self.state.lock();
            let attempts = match state.not_found_retries.get(file_id) {
                Some(existing) => {
                    existing.token.cancel();
                    existing.attempts + 1
                }
                None => 0,
            };
            if attempts >= NOT_FOUND_MAX_ATTEMPTS {
                state.not_found_retries.remove(file_id);
                return false;
            }
            let token = CancellationToken::new();
            state.not_found_retries.insert(
                file_id.to_string(),
                RetryState {
                    attempts,
                    token: token.clone(),
                },
            );
            (attempts, token)
        };

        let delay = jittered(self.profile.not_found_base_delay, attempts, NOT_FOUND_MAX_DELAY);
        debug!(
            "not_found retry armed file={} attempt={} delay_ms={}",
            file_id,
            attempts,
            delay.as_millis()
        );
        let Some(scheduler) = self.me.upgrade() else {
            return false;
        };
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !scheduler.link.is_connected() || !scheduler.link.is_authed() {
                        debug!("not_found retry dropped offline file={}", file_id);
                        scheduler.state.lock().not_found_retries.remove(&file_id);
                        return;
                    }
                    if scheduler.link.is_upload_active(&file_id) {
                        scheduler.schedule_not_found_retry(&file_id, intent);
                        return;
                    }
                    // The record stays behind so a repeat not_found resumes
                    // this attempt count instead of starting a fresh budget.
                    scheduler.enqueue(&file_id, intent);
                }
            }
        });
        true
    }

    pub fn clear_not_found_retry(&self, file_id: &str) {
        if let Some(retry) = self.state.lock().not_found_retries.remove(file_id) {
            retry.token.cancel();
        }
    }

    /// Nudge a transfer the relay accepted but never started. Fires a few
    /// times, then gives up; self-clears when the download shows up.
    pub fn schedule_accept_retry(&self, file_id: &str) {
        let (attempts, token) = {
            let mut state = self.state.lock();
            let attempts = match state.accept_retries.get(file_id) {
                Some(existing) => {
                    existing.token.cancel();
                    existing.attempts + 1
                }
                None => 0,
            };
            if attempts >= ACCEPT_MAX_ATTEMPTS {
                state.accept_retries.remove(file_id);
                return;
            }
            let token = CancellationToken::new();
            state.accept_retries.insert(
                file_id.to_string(),
                RetryState {
                    attempts,
                    token: token.clone(),
                },
            );
            (attempts, token)
        };

        let delay = jittered(ACCEPT_BASE_DELAY, attempts, ACCEPT_MAX_DELAY);
        let Some(scheduler) = self.me.upgrade() else {
            return;
        };
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if scheduler.is_in_flight(&file_id) {
                        scheduler.state.lock().accept_retries.remove(&file_id);
                        return;
                    }
                    debug!("accept retry re-enqueue file={}", file_id);
                    scheduler.enqueue(&file_id, TransferIntent::Foreground);
                }
            }
        });
    }

    pub fn clear_accept_retry(&self, file_id: &str) {
        if let Some(retry) = self.state.lock().accept_retries.remove(file_id) {
            retry.token.cancel();
        }
    }

    /// Ask the relay for a fresh transport URL and wait for the answer.
    /// Concurrent callers for one file share a single request; every
    /// waiter is resolved or rejected exactly once, with a hard deadline.
    pub async fn await_fresh_url(&self, file_id: &str) -> WaiterResult {
        let (tx, rx) = oneshot::channel();
        let (first, deadline) = {
            let mut state = self.state.lock();
            let waiter = state
                .waiters
                .entry(file_id.to_string())
                .or_insert_with(|| UrlWaiter {
                    senders: Vec::new(),
                    deadline: CancellationToken::new(),
                });
            waiter.senders.push(tx);
            let first = waiter.senders.len() == 1;
            (first, waiter.deadline.clone())
        };

        if first {
            let transport = Self::transport(&self.state.lock());
            let sent = self.link.send(&GatewayRequest::FileGet {
                file_id: file_id.to_string(),
                transport,
            });
            if !sent {
                self.reject_waiters(file_id, WaiterError::SendFailed);
            } else if let Some(scheduler) = self.me.upgrade() {
                let file_id = file_id.to_string();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = deadline.cancelled() => {}
                        _ = tokio::time::sleep(URL_REFRESH_TIMEOUT) => {
                            scheduler.reject_waiters(&file_id, WaiterError::Timeout);
                        }
                    }
                });
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WaiterError::Reset),
        }
    }

    /// Deliver a fresh URL to all pending waiters. Returns true when any
    /// waiter consumed it, in which case the event was a refresh answer
    /// and not the start of a download.
    pub fn resolve_waiters(&self, file_id: &str, info: &FileUrlInfo) -> bool {
        let waiter = {
            let mut state = self.state.lock();
            state.waiters.remove(file_id)
        };
        let Some(waiter) = waiter else {
            return false;
        };
        waiter.deadline.cancel();
        let any = !waiter.senders.is_empty();
        for sender in waiter.senders {
            let _ = sender.send(Ok(info.clone()));
        }
        any
    }

    pub fn reject_waiters(&self, file_id: &str, error: WaiterError) {
        let waiter = {
            let mut state = self.state.lock();
            state.waiters.remove(file_id)
        };
        if let Some(waiter) = waiter {
            waiter.deadline.cancel();
            for sender in waiter.senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    pub fn has_waiters(&self, file_id: &str) -> bool {
        self.state.lock().waiters.contains_key(file_id)
    }

    /// Session teardown: everything queued, in flight, or waiting is
    /// dropped; pending waiters are rejected.
    pub fn reset(&self) {
        let (flights, retries, accepts, waiters) = {
            let mut state = self.state.lock();
            state.high.clear();
            state.prefetch.clear();
            state.queued.clear();
            (
                std::mem::take(&mut state.in_flight),
                std::mem::take(&mut state.not_found_retries),
                std::mem::take(&mut state.accept_retries),
                std::mem::take(&mut state.waiters),
            )
        };
        for flight in flights.values() {
            flight.liveness.cancel();
        }
        for retry in retries.values().chain(accepts.values()) {
            retry.token.cancel();
        }
        for waiter in waiters.into_values() {
            waiter.deadline.cancel();
            for sender in waiter.senders {
                let _ = sender.send(Err(WaiterError::Reset));
            }
        }
        debug!("scheduler reset");
    }
}
