//! Per-source rate limiting using a sliding window approach.
//!
//! Tracks how many frames each source address has had admitted within the
//! trailing interval. When a source reaches the configured limit,
//! [`RateLimiter::admit`] returns `false` and the caller drops the frame.
//!
//! # Design
//!
//! Each source has a [`VecDeque`] of admission [`Instant`]s. On every call
//! the front of the queue is pruned of entries older than the interval, then
//! the remaining length is compared against the limit. Only admitted frames
//! are recorded, so a rejected burst does not extend its own penalty.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sliding-window admission control shared by every connection task.
pub struct RateLimiter {
    limit: usize,
    interval: Duration,
    windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Admit at most `limit` frames per source within any trailing `interval`.
    pub fn new(limit: usize, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` and records the admission if `source` is under its limit.
    pub fn admit(&self, source: IpAddr) -> bool {
        self.admit_at(source, Instant::now())
    }

    fn admit_at(&self, source: IpAddr, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.entry(source).or_default();
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.interval)
        {
            window.pop_front();
        }
        if window.len() >= self.limit {
            debug!(%source, count = window.len(), limit = self.limit,
                "rate_limiter: limit exceeded");
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop sources whose windows have fully aged out.
    ///
    /// Returns the number of sources removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.back()
                .is_some_and(|t| now.saturating_duration_since(*t) <= self.interval)
        });
        before - windows.len()
    }

    /// Number of sources with tracked state.
    pub fn tracked_sources(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LIMIT: usize = 10;
    const INTERVAL: Duration = Duration::from_secs(10);

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    /// Exactly `LIMIT` admissions inside the interval pass.
    #[test]
    fn within_rate_limit() {
        let rl = RateLimiter::new(LIMIT, INTERVAL);
        let start = Instant::now();
        for i in 0..LIMIT {
            assert!(
                rl.admit_at(ip(1), start + Duration::from_millis(i as u64)),
                "admission {i} within limit should pass"
            );
        }
    }

    /// The `LIMIT + 1`-th admission inside the interval is rejected.
    #[test]
    fn exceeds_rate_limit() {
        let rl = RateLimiter::new(LIMIT, INTERVAL);
        let start = Instant::now();
        for _ in 0..LIMIT {
            assert!(rl.admit_at(ip(1), start));
        }
        assert!(
            !rl.admit_at(ip(1), start + Duration::from_secs(5)),
            "admission over limit should be rejected"
        );
    }

    /// Rejections are not recorded, so once the oldest admission ages out a
    /// single slot reopens.
    #[test]
    fn window_slides_after_interval() {
        let rl = RateLimiter::new(LIMIT, INTERVAL);
        let start = Instant::now();
        assert!(rl.admit_at(ip(1), start));
        for _ in 1..LIMIT {
            assert!(rl.admit_at(ip(1), start + Duration::from_secs(5)));
        }
        assert!(!rl.admit_at(ip(1), start + Duration::from_secs(9)));

        // Exactly at the interval the oldest entry is not yet "older than".
        assert!(!rl.admit_at(ip(1), start + INTERVAL));

        // Just past it, one slot frees up; the next is rejected again.
        let later = start + INTERVAL + Duration::from_millis(1);
        assert!(rl.admit_at(ip(1), later));
        assert!(!rl.admit_at(ip(1), later));

        // Past every recorded timestamp the whole window is free.
        let much_later = start + Duration::from_secs(30);
        for _ in 0..LIMIT {
            assert!(rl.admit_at(ip(1), much_later));
        }
    }

    /// Limits for one source must not affect another.
    #[test]
    fn per_source_isolation() {
        let rl = RateLimiter::new(LIMIT, INTERVAL);
        let now = Instant::now();
        for _ in 0..LIMIT {
            assert!(rl.admit_at(ip(1), now));
        }
        assert!(rl.admit_at(ip(2), now), "ip 2 should be unaffected by ip 1");
        assert!(!rl.admit_at(ip(1), now), "ip 1 should be over limit");
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let rl = RateLimiter::new(0, INTERVAL);
        assert!(!rl.admit(ip(1)));
    }

    #[test]
    fn sweep_removes_aged_out_sources() {
        let rl = RateLimiter::new(LIMIT, Duration::from_millis(1));
        assert!(rl.admit(ip(1)));
        assert!(rl.admit(ip(2)));
        assert_eq!(rl.tracked_sources(), 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(rl.sweep(), 2);
        assert_eq!(rl.tracked_sources(), 0);
        // Sweeping again is a no-op.
        assert_eq!(rl.sweep(), 0);
    }

    #[test]
    fn admit_is_safe_across_threads() {
        let rl = std::sync::Arc::new(RateLimiter::new(LIMIT, INTERVAL));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rl = rl.clone();
                std::thread::spawn(move || (0..LIMIT).filter(|_| rl.admit(ip(9))).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, LIMIT, "exactly LIMIT admissions across all threads");
    }
}
