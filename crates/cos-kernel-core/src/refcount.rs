//! Atomic composite reference count
//!
//! Invocation and return on different cores take and release references on
//! the same composite, so the count is atomic. Only the release that
//! observes the transition to zero may reclaim.

use core::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub const fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    pub fn take(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference and return the remaining count, or `None` if the
    /// count was already zero (nothing is changed then).
    pub fn release(&self) -> Option<u32> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    pub fn value(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_release() {
        let rc = RefCount::new(1);
        rc.take();
        assert_eq!(rc.value(), 2);
        assert_eq!(rc.release(), Some(1));
        assert_eq!(rc.release(), Some(0));
    }

    #[test]
    fn test_underflow_refused() {
        let rc = RefCount::new(0);
        assert_eq!(rc.release(), None);
        assert_eq!(rc.value(), 0);
    }
}
