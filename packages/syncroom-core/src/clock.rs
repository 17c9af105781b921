//! Clock service (component A).
//!
//! Serves a monotonic millisecond server clock used for anchor timestamps and
//! sequence-ordering decisions. Clocks across instances are assumed to be
//! NTP-synchronized to within ~50 ms; tighter alignment is the client's job
//! via the clock-sync protocol (component H).

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
///
/// Used for every anchor timestamp and every sequence-ordering decision. Falls
/// back to 0 if the system clock is set before the epoch, which should never
/// happen outside of a misconfigured container.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Truncates a client-supplied server-time value to a `window_ms` band around
/// `now_ms()`, bounding how far clock misalignment can skew an anchor.
pub fn clamp_to_window(client_supplied_ms: u64, window_ms: u64) -> u64 {
    let now = now_ms();
    let floor = now.saturating_sub(window_ms);
    let ceil = now.saturating_add(window_ms);
    client_supplied_ms.clamp(floor, ceil)
}

/// Monotonic clock for measuring elapsed durations (heartbeat timeouts,
/// retry backoff). Not comparable across processes.
#[derive(Debug, Clone, Copy)]
pub struct Monotonic(Instant);

impl Monotonic {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_nonzero_and_increasing() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_ms();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn clamp_to_window_leaves_in_band_values_untouched() {
        let now = now_ms();
        let clamped = clamp_to_window(now, 5_000);
        assert_eq!(clamped, now);
    }

    #[test]
    fn clamp_to_window_pulls_far_future_back_to_ceiling() {
        let now = now_ms();
        let far_future = now + 1_000_000;
        let clamped = clamp_to_window(far_future, 5_000);
        assert!(clamped <= now + 5_000);
    }

    #[test]
    fn clamp_to_window_pulls_far_past_up_to_floor() {
        let now = now_ms();
        let clamped = clamp_to_window(0, 5_000);
        assert!(clamped >= now.saturating_sub(5_000));
    }
}
