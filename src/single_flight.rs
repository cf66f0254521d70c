use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide "in progress" latch for one stage.
///
/// At most one [`FlightGuard`] exists at a time. A second caller is refused
/// immediately instead of waiting. The latch reopens when the guard drops,
/// which also covers early returns and panics.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    active: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<FlightGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                active: Arc::clone(&self.active),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    active: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}
