//! Collection pause timing
//!
//! Keeps the most recent pauses in a bounded window; older samples fall off
//! the front as new ones arrive.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct PauseTimer {
    pause_start: Option<Instant>,
    window: VecDeque<Duration>,
    capacity: usize,
    longest: Duration,
}

impl PauseTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pause_start: None,
            window: VecDeque::with_capacity(capacity),
            capacity,
            longest: Duration::ZERO,
        }
    }

    pub fn begin(&mut self) {
        self.pause_start = Some(Instant::now());
    }

    /// Close the pause opened by `begin`. Unpaired calls are ignored.
    pub fn end(&mut self) {
        if let Some(start) = self.pause_start.take() {
            self.record(start.elapsed());
        }
    }

    pub(crate) fn record(&mut self, pause: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(pause);
        self.longest = self.longest.max(pause);
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn last_ms(&self) -> f64 {
        self.window.back().map(|pause| pause.as_secs_f64() * 1000.0).unwrap_or(0.0)
    }

    /// Mean over the current window.
    pub fn average_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: Duration = self.window.iter().sum();
        (sum / self.window.len() as u32).as_secs_f64() * 1000.0
    }

    /// Longest pause ever recorded, including ones no longer in the window.
    pub fn longest_ms(&self) -> f64 {
        self.longest.as_secs_f64() * 1000.0
    }
}

impl std::fmt::Debug for PauseTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseTimer")
            .field("samples", &self.samples())
            .field("average_ms", &self.average_ms())
            .field("longest_ms", &self.longest_ms())
            .finish()
    }
}
