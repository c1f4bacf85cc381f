//! Sliding-window start limiter.
//!
//! Keeps the instants of the most recent starts; a caller waits until the
//! oldest one leaves the window whenever the window is full.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// At most `cap` acquisitions in any rolling `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    cap: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(cap: usize, window: Duration) -> Self {
        Self {
            cap: cap.max(1),
            window,
            starts: Mutex::new(VecDeque::with_capacity(cap.max(1))),
        }
    }

    /// Wait for a slot and record the start.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut starts = self.starts.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    starts.pop_front();
                }
                if starts.len() < self.cap {
                    starts.push_back(now);
                    return;
                }
                match starts.front() {
                    Some(oldest) => *oldest + self.window,
                    None => continue,
                }
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Try to record a start without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut starts = self.starts.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while starts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            starts.pop_front();
        }
        if starts.len() < self.cap {
            starts.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fourth_start_waits_for_window() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_millis(1000));
        let begin = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(begin.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert_eq!(begin.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_respects_cap() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(500));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire());
    }
}
