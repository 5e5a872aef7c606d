//! Restart policy for crashed workers
//!
//! Each slot may restart at most `max_restarts` times inside a sliding
//! window. Restarts are delayed by exponential backoff with jitter.

use crate::config::RestartConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-slot restart budget and backoff
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    config: RestartConfig,
    history: VecDeque<Instant>,
}

impl RestartPolicy {
    /// Create a policy with an empty history
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    /// Record a crash at `now` and return the delay before the restart,
    /// or `None` when the budget for the window is spent.
    pub fn next_restart(&mut self, now: Instant) -> Option<Duration> {
        let window = Duration::from_secs(self.config.window_secs);
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) > window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= self.config.max_restarts as usize {
            return None;
        }

        let attempt = self.history.len() as u32;
        self.history.push_back(now);
        Some(self.calculate_delay(attempt))
    }

    /// Restarts counted in the current window
    pub fn recent_restarts(&self) -> usize {
        self.history.len()
    }

    /// Delay for the nth restart with exponential backoff + jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.config.max_backoff_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}
