//! Protolab Clock
//!
//! Time sources for the simulators. Engines never read wall-clock time
//! directly; they ask the clock they were built with, which lets scenarios and
//! tests drive timeouts deterministically.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Clock Trait
// =============================================================================

/// A source of milliseconds.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Clock handle shared between an engine and its driver.
pub type SharedClock = Arc<dyn Clock>;

// =============================================================================
// System Clock
// =============================================================================

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        protolab_common::utils::current_millis()
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

// =============================================================================
// Manual Clock
// =============================================================================

/// Explicitly advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, millis: u64) -> u64 {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Handle to hand to an engine; the caller keeps this clock to advance it.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(100);
        let handle = clock.shared();
        assert_eq!(handle.now_millis(), 100);

        assert_eq!(clock.advance(50), 150);
        assert_eq!(handle.now_millis(), 150);

        clock.set(10);
        assert_eq!(handle.now_millis(), 10);
    }

    #[test]
    fn test_system_clock() {
        let clock = SystemClock::shared();
        assert!(clock.now_millis() > 0);
    }
}
