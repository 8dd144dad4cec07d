//! Trellis Metrics - instrumentation for the script engine
//!
//! Provides zero-cost abstractions for metrics collection that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use trellis_metrics::{EngineEvent, EventCounter, PauseTimer};
//!
//! let mut events = EventCounter::new();
//! let mut pauses = PauseTimer::new(32); // Track the last 32 collections
//! pauses.begin();
//! // ... collection pass ...
//! pauses.end();
//! events.record(EngineEvent::Collection, 1);
//! println!("{} avg pause: {:.3}ms", events, pauses.average_ms());
//! ```
//!
//! [`EngineEvent`] is always available so call sites need no cfg of their
//! own; without the `metrics` feature the recorders are zero-sized stubs.

mod events;
#[cfg(feature = "metrics")]
mod pause_timer;

pub use events::EngineEvent;
#[cfg(feature = "metrics")]
pub use events::EventCounter;
#[cfg(feature = "metrics")]
pub use pause_timer::PauseTimer;

// ============================================================================
// Macros for conditional compilation
// ============================================================================

/// Execute code only when metrics are enabled
#[macro_export]
macro_rules! metrics {
    ($($tt:tt)*) => {
        #[cfg(feature = "metrics")]
        {
            $($tt)*
        }
    };
}

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventCounter;

#[cfg(not(feature = "metrics"))]
impl EventCounter {
    pub fn new() -> Self { Self }
    pub fn record(&mut self, _event: EngineEvent, _count: usize) {}
    pub fn get(&self, _event: EngineEvent) -> u64 { 0 }
    pub fn live_handles(&self) -> u64 { 0 }
    pub fn since(&self, _earlier: &EventCounter) -> EventCounter { Self }
}

#[cfg(not(feature = "metrics"))]
impl std::fmt::Display for EventCounter {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Ok(())
    }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug)]
pub struct PauseTimer;

#[cfg(not(feature = "metrics"))]
impl PauseTimer {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn begin(&mut self) {}
    pub fn end(&mut self) {}
    pub fn samples(&self) -> usize { 0 }
    pub fn last_ms(&self) -> f64 { 0.0 }
    pub fn average_ms(&self) -> f64 { 0.0 }
    pub fn longest_ms(&self) -> f64 { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiles_without_metrics() {
        let mut events = EventCounter::new();
        events.record(EngineEvent::HandleAdopted, 3);
        let mut pauses = PauseTimer::new(8);
        pauses.begin();
        pauses.end();
        let _ = events.since(&EventCounter::new());
    }
}
