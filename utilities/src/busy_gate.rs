use std::sync::atomic::{AtomicBool, Ordering};

/// Single-slot gate for operations that must never overlap.
///
/// Unlike a mutex there is no waiting: whoever finds the gate taken gets
/// `None` back and is expected to skip its work.
#[derive(Debug, Default)]
pub struct BusyGate {
    busy: AtomicBool,
}

impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Holds the gate until dropped.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    gate: &'a BusyGate,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}
