//! Engine event tallies
//!
//! One fixed slot per [`EngineEvent`], so recording is an array index and a
//! snapshot is a plain copy that can be diffed against an earlier one.

use std::fmt;

/// Something the engine does often enough to be worth counting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    /// A script value was adopted into the handle table.
    HandleAdopted,
    /// A handle slot was released (stale from then on).
    HandleReleased,
    /// An unrooted object handle was downgraded to a weak reference.
    HandleWeakened,
    /// A full collection pass ran.
    Collection,
    /// A native finalizer ran.
    Finalized,
    /// An exception escaped to the host.
    UncaughtException,
}

impl EngineEvent {
    pub const ALL: [EngineEvent; 6] = [
        EngineEvent::HandleAdopted,
        EngineEvent::HandleReleased,
        EngineEvent::HandleWeakened,
        EngineEvent::Collection,
        EngineEvent::Finalized,
        EngineEvent::UncaughtException,
    ];

    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn slot(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineEvent::HandleAdopted => "handles_adopted",
            EngineEvent::HandleReleased => "handles_released",
            EngineEvent::HandleWeakened => "handles_weakened",
            EngineEvent::Collection => "collections",
            EngineEvent::Finalized => "finalized",
            EngineEvent::UncaughtException => "uncaught_exceptions",
        }
    }
}

/// Running totals per event.
#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventCounter {
    totals: [u64; EngineEvent::ALL.len()],
}

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: EngineEvent, count: usize) {
        self.totals[event.slot()] += count as u64;
    }

    pub fn get(&self, event: EngineEvent) -> u64 {
        self.totals[event.slot()]
    }

    /// Handles adopted but not yet released.
    pub fn live_handles(&self) -> u64 {
        self.get(EngineEvent::HandleAdopted)
            .saturating_sub(self.get(EngineEvent::HandleReleased))
    }

    /// Totals accumulated since `earlier` was taken.
    pub fn since(&self, earlier: &EventCounter) -> EventCounter {
        let mut delta = EventCounter::new();
        for event in EngineEvent::ALL {
            delta.totals[event.slot()] = self.get(event).saturating_sub(earlier.get(event));
        }
        delta
    }
}

impl fmt::Display for EventCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for event in EngineEvent::ALL {
            let total = self.get(event);
            if total == 0 {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", event.name(), total)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_and_live_handles() {
        let mut counter = EventCounter::new();
        counter.record(EngineEvent::HandleAdopted, 5);
        counter.record(EngineEvent::HandleReleased, 2);
        counter.record(EngineEvent::Collection, 1);

        assert_eq!(counter.get(EngineEvent::HandleAdopted), 5);
        assert_eq!(counter.live_handles(), 3);
        assert_eq!(counter.to_string(), "handles_adopted=5 handles_released=2 collections=1");
    }

    #[test]
    fn test_since_reports_one_pass() {
        let mut counter = EventCounter::new();
        counter.record(EngineEvent::Finalized, 4);
        let before = counter;

        counter.record(EngineEvent::Finalized, 3);
        counter.record(EngineEvent::Collection, 1);
        let delta = counter.since(&before);
        assert_eq!(delta.get(EngineEvent::Finalized), 3);
        assert_eq!(delta.get(EngineEvent::Collection), 1);
        assert_eq!(delta.get(EngineEvent::HandleAdopted), 0);
    }
}
