// SPDX-License-Identifier: AGPL-3.0-only

//! Per-queue locking and completion signalling.

use crate::lock;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// One command queue.
///
/// `slot` serialises submitters: one request in flight per queue. `irqs`
/// counts host interrupts that found this queue's slot answered; waiters
/// sleep on `signal` and re-check their condition under `irqs`, so a
/// notification sent under that lock cannot be lost.
#[derive(Debug)]
pub(crate) struct Queue {
    pub index: usize,
    pub offset: usize,
    slot: Mutex<()>,
    irqs: Mutex<u64>,
    signal: Condvar,
}

impl Queue {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            offset: vdsp_chip::comm::queue_offset(index),
            slot: Mutex::new(()),
            irqs: Mutex::new(0),
            signal: Condvar::new(),
        }
    }

    /// Exclusive use of the slot.
    pub fn claim(&self) -> MutexGuard<'_, ()> {
        lock(&self.slot)
    }

    /// Wake every waiter, counting an interrupt.
    pub fn signal(&self) {
        let mut irqs = lock(&self.irqs);
        *irqs += 1;
        self.signal.notify_all();
    }

    /// Wake every waiter without counting, so they re-check their state.
    pub fn kick(&self) {
        let _irqs = lock(&self.irqs);
        self.signal.notify_all();
    }

    /// Interrupts counted so far.
    pub fn irq_count(&self) -> u64 {
        *lock(&self.irqs)
    }

    /// Sleep until `ready` holds or `deadline` passes. `ready` runs with the
    /// interrupt counter locked. Returns the last value of `ready`.
    pub fn wait_until(&self, deadline: Instant, mut ready: impl FnMut(u64) -> bool) -> bool {
        let mut irqs = lock(&self.irqs);
        loop {
            if ready(*irqs) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            irqs = self
                .signal
                .wait_timeout(irqs, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_sees_signal_from_other_thread() {
        let q = Arc::new(Queue::new(0));
        let seen = q.irq_count();
        let q2 = Arc::clone(&q);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            q2.signal();
        });
        assert!(q.wait_until(Instant::now() + Duration::from_secs(5), |n| n > seen));
        t.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let q = Queue::new(3);
        assert_eq!(q.offset, 0x300);
        assert!(!q.wait_until(Instant::now() + Duration::from_millis(10), |_| false));
    }
}
