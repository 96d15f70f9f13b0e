//! Optional process-wide serialization of backend calls.
//!
//! Some drivers lock up when several threads drive their own command queues
//! at once. When the gate is active every backend call made through the
//! device holds one shared mutex for its duration; when inactive, entering
//! the gate costs an atomic load and nothing else.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SerializationGate {
    active: AtomicBool,
    lock: Mutex<()>,
    acquisitions: AtomicU64,
}

impl SerializationGate {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
            lock: Mutex::new(()),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Only called while the device's state is write-locked, so no guard can
    /// be outstanding across the change.
    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Enter the critical section if the gate is active.
    ///
    /// The decision is taken once here; the returned guard releases exactly
    /// what it acquired, whatever the flag reads by the time it drops.
    pub fn enter(&self) -> GateGuard<'_> {
        if self.is_active() {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            GateGuard {
                held: Some(self.lock.lock()),
            }
        } else {
            GateGuard { held: None }
        }
    }

    /// Number of times the lock was actually taken.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Scope guard returned by [`SerializationGate::enter`].
#[must_use = "the gate is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GateGuard<'a> {
    held: Option<MutexGuard<'a, ()>>,
}

impl GateGuard<'_> {
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_inactive_gate_passes_through() {
        let gate = SerializationGate::new(false);
        let a = gate.enter();
        let b = gate.enter();
        assert!(!a.is_held());
        assert!(!b.is_held());
        assert_eq!(gate.acquisitions(), 0);
    }

    #[test]
    fn test_guard_keeps_its_own_decision() {
        let gate = SerializationGate::new(true);
        let guard = gate.enter();
        assert!(guard.is_held());

        gate.set_active(false);
        assert!(!gate.enter().is_held());

        drop(guard);
        gate.set_active(true);
        assert!(gate.enter().is_held());
        assert_eq!(gate.acquisitions(), 2);
    }

    #[test]
    fn test_active_gate_serializes_threads() {
        let gate = Arc::new(SerializationGate::new(true));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = gate.enter();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(gate.acquisitions(), 800);
    }
}
