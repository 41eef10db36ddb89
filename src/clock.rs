//! Logical clock with time travel.
//!
//! Every time-dependent decision in the mock (expiry, lock timeouts, replica
//! visibility, persistence lag) reads [`Chrono::now`] instead of the wall
//! clock. Tests move the clock forward with [`Chrono::time_travel`], and any
//! timer armed through [`Chrono::after_fn`] re-evaluates its deadline against
//! the shifted time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::logging::trace;

/// Shared logical clock. Cloning is cheap and every clone observes the same shift.
#[derive(Clone)]
pub struct Chrono {
    inner: Arc<ChronoInner>,
}

struct ChronoInner {
    shift_nanos: AtomicU64,
    last_nanos: AtomicU64,
    shifted: watch::Sender<u64>,
    timers: Mutex<HashMap<u64, SystemTime>>,
    next_timer: AtomicU64,
}

impl Default for Chrono {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Chrono {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chrono")
            .field("shift", &self.time_shift())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

fn wall_nanos() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX)
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl Chrono {
    /// Create a clock with no shift applied.
    pub fn new() -> Self {
        let (shifted, _) = watch::channel(0);
        Self {
            inner: Arc::new(ChronoInner {
                shift_nanos: AtomicU64::new(0),
                last_nanos: AtomicU64::new(0),
                shifted,
                timers: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    /// Current logical time. Never goes backwards, even if the wall clock does.
    pub fn now(&self) -> SystemTime {
        let candidate = wall_nanos().saturating_add(self.inner.shift_nanos.load(Ordering::SeqCst));
        let previous = self.inner.last_nanos.fetch_max(candidate, Ordering::SeqCst);
        UNIX_EPOCH + Duration::from_nanos(previous.max(candidate))
    }

    /// Total amount of time travelled so far.
    pub fn time_shift(&self) -> Duration {
        Duration::from_nanos(self.inner.shift_nanos.load(Ordering::SeqCst))
    }

    /// Move logical time forward by `amount` and wake every pending timer.
    pub fn time_travel(&self, amount: Duration) {
        let delta = duration_nanos(amount);
        let previous = self.inner.shift_nanos.fetch_add(delta, Ordering::SeqCst);
        let shift = previous.saturating_add(delta);
        trace!(shift_ms = shift / 1_000_000, "time travelled");
        self.inner.shifted.send_replace(shift);
    }

    /// Number of timers armed through [`Chrono::after_fn`] that have not fired.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Wait until logical time reaches `now() + delay`.
    pub async fn sleep(&self, delay: Duration) {
        let deadline = self.now() + delay;
        self.sleep_until(deadline).await;
    }

    async fn sleep_until(&self, deadline: SystemTime) {
        let mut shifted = self.inner.shifted.subscribe();
        loop {
            let remaining = deadline
                .duration_since(self.now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                changed = shifted.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(remaining).await;
                    }
                }
            }
        }
    }

    /// Run `f` once logical time passes `now() + delay`.
    ///
    /// Must be called from within a tokio runtime. The returned [`Timer`] can
    /// cancel the callback; dropping it leaves the timer armed.
    pub fn after_fn<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = self.now() + delay;
        let id = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        self.inner.timers.lock().insert(id, deadline);

        let chrono = self.clone();
        let handle = tokio::spawn(async move {
            chrono.sleep_until(deadline).await;
            chrono.inner.timers.lock().remove(&id);
            f();
        });

        Timer {
            id,
            chrono: self.clone(),
            handle,
        }
    }
}

/// Handle to a pending [`Chrono::after_fn`] callback.
#[derive(Debug)]
pub struct Timer {
    id: u64,
    chrono: Chrono,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Cancel the callback. Returns false if it already fired.
    pub fn cancel(self) -> bool {
        self.handle.abort();
        self.chrono.inner.timers.lock().remove(&self.id).is_some()
    }

    /// Whether the callback has already run (or been cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
