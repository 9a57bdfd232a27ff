//! Local call-attempt limiter.
//!
//! Two independent checks: a minimum spacing between consecutive accepted
//! attempts and a cap on attempts inside a rolling window. Counters are local
//! to one facade and never synchronized with anything else.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimited {
    #[error("calls must be at least {min_spacing:?} apart (retry in {retry_after:?})")]
    TooSoon {
        min_spacing: Duration,
        retry_after: Duration,
    },
    #[error("at most {max} calls per {window:?} (retry in {retry_after:?})")]
    WindowExceeded {
        max: usize,
        window: Duration,
        retry_after: Duration,
    },
}

#[derive(Debug)]
pub struct RateLimiter {
    min_spacing: Duration,
    window: Duration,
    max_per_window: usize,
    attempts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration, window: Duration, max_per_window: usize) -> Self {
        Self {
            min_spacing,
            window,
            max_per_window,
            attempts: VecDeque::new(),
        }
    }

    /// Checks both limits at `now` and records the attempt only if it passes.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), RateLimited> {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        if let Some(last) = self.attempts.back() {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.min_spacing {
                return Err(RateLimited::TooSoon {
                    min_spacing: self.min_spacing,
                    retry_after: self.min_spacing - elapsed,
                });
            }
        }

        if self.attempts.len() >= self.max_per_window {
            let oldest = self.attempts.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Err(RateLimited::WindowExceeded {
                max: self.max_per_window,
                window: self.window,
                retry_after,
            });
        }

        self.attempts.push_back(now);
        Ok(())
    }

    pub fn attempts_in_window(&self) -> usize {
        self.attempts.len()
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_secs(5), Duration::from_secs(60), 10)
    }

    #[test]
    fn test_rejects_within_min_spacing() {
        let mut rl = limiter();
        let t0 = Instant::now();
        rl.try_acquire(t0).unwrap();
        let err = rl.try_acquire(t0 + Duration::from_secs(2)).unwrap_err();
        assert_eq!(
            err,
            RateLimited::TooSoon {
                min_spacing: Duration::from_secs(5),
                retry_after: Duration::from_secs(3),
            }
        );
        // Rejected attempts are not recorded.
        assert_eq!(rl.attempts_in_window(), 1);
        rl.try_acquire(t0 + Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_rejects_when_window_is_full() {
        let mut rl = RateLimiter::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        let t0 = Instant::now();
        for i in 0..3 {
            rl.try_acquire(t0 + Duration::from_secs(i * 2)).unwrap();
        }
        let err = rl.try_acquire(t0 + Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, RateLimited::WindowExceeded { max: 3, .. }));
    }

    #[test]
    fn test_window_expiry_frees_slots() {
        let mut rl = RateLimiter::new(Duration::ZERO, Duration::from_secs(60), 2);
        let t0 = Instant::now();
        rl.try_acquire(t0).unwrap();
        rl.try_acquire(t0 + Duration::from_secs(1)).unwrap();
        assert!(rl.try_acquire(t0 + Duration::from_secs(30)).is_err());
        rl.try_acquire(t0 + Duration::from_secs(60)).unwrap();
        assert_eq!(rl.attempts_in_window(), 2);
    }
}
