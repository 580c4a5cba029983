//! One-cycle-in-flight guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that admits at most one running cycle per component.
///
/// `try_enter` never blocks: an overlapping caller gets `None` and is
/// expected to drop its cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    busy: Arc<AtomicBool>,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<CycleToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken {
                busy: Arc::clone(&self.busy),
            })
    }
}

/// Releases the guard when dropped, including on early return or panic.
#[derive(Debug)]
pub struct CycleToken {
    busy: Arc<AtomicBool>,
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
