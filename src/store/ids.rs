//! CAS and vbucket UUID generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static CAS_COUNTER: AtomicU64 = AtomicU64::new(0);
static LAST_CAS: AtomicU64 = AtomicU64::new(0);
static VB_UUID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new CAS value.
///
/// The high bits carry wall-clock nanoseconds, the second byte a rolling
/// counter and the low byte is always `0xCA`. Values are strictly increasing
/// across the process.
pub fn new_cas() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default();
    let count = CAS_COUNTER.fetch_add(1, Ordering::Relaxed);
    let candidate = (nanos & !0xFFFF) | ((count << 8) & 0xFF00) | 0xCA;

    let mut previous = LAST_CAS.load(Ordering::SeqCst);
    loop {
        let next = if candidate > previous {
            candidate
        } else {
            previous.wrapping_add(0x100)
        };
        match LAST_CAS.compare_exchange_weak(previous, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => previous = actual,
        }
    }
}

/// Generate a new vbucket UUID (`counter << 8 | 0xAF`).
pub fn new_vb_uuid() -> u64 {
    let count = VB_UUID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    (count << 8) | 0xAF
}
