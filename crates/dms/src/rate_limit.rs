//! Sliding-window rate limiter
//!
//! Each provider keeps a window of recent request timestamps and rejects
//! locally when it is full, so a saturated client never hammers the remote.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Request-timestamp sliding window
pub struct SlidingWindowLimiter {
    capacity: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Reserve one slot, or report how long until the oldest request
    /// leaves the window.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();

        while timestamps
            .front()
            .map(|t| now.duration_since(*t) >= self.window)
            .unwrap_or(false)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.capacity {
            let oldest = timestamps.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after);
        }

        timestamps.push_back(now);
        Ok(())
    }

    /// Requests currently inside the window
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while timestamps
            .front()
            .map(|t| now.duration_since(*t) >= self.window)
            .unwrap_or(false)
        {
            timestamps.pop_front();
        }
        timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_capacity() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
        assert_eq!(limiter.in_flight(), 3);
    }

    #[test]
    fn test_rejection_reports_retry_delay() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        limiter.try_acquire().unwrap();

        let retry_after = limiter.try_acquire().unwrap_err();
        assert!(retry_after <= Duration::from_secs(60));
        assert!(retry_after > Duration::from_secs(55));
    }

    #[test]
    fn test_window_expiry_frees_slots() {
        let limiter = SlidingWindowLimiter::new(1, Duration::ZERO);
        limiter.try_acquire().unwrap();
        // Zero-length window: the slot expires immediately
        assert!(limiter.try_acquire().is_ok());
    }
}
