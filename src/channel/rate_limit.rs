//! Sliding-window limiter for outbound frames

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Allows at most `max_requests` sends in any `window`.
///
/// Uses the Tokio clock so paused-time tests can step through windows.
#[derive(Debug)]
pub struct RateLimiter {
    /// Window length
    window: Duration,
    /// Maximum sends per window
    max_requests: u32,
    /// Send timestamps inside the current window, oldest first
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter. A `max_requests` of zero is treated as one.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests: max_requests.max(1),
            sent: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.sent.front() {
            if now.duration_since(*oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a send if the window has room.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        self.evict(now);
        if self.sent.len() >= self.max_requests as usize {
            return false;
        }
        self.sent.push_back(now);
        true
    }

    /// Time until the window has room again.
    pub fn retry_after(&mut self) -> Duration {
        let now = Instant::now();
        self.evict(now);
        if self.sent.len() < self.max_requests as usize {
            return Duration::ZERO;
        }
        self.sent
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or_default()
    }
}
