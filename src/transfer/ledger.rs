use crate::packet::{Acknowledge};
use crate::util::thread::{OTHER_THREAD_ERR};

use std::collections::{HashMap};
use std::sync::{Mutex, Condvar};
use std::time::{Duration};

/// Acknowledgments received by the send side of a transfer: serial -> reported window.
/// Waiters sleep on a condition variable until their serial arrives or the deadline expires.
#[derive(Default)]
pub struct AckLedger {
    acks: Mutex<HashMap<i64, i64>>,
    changed: Condvar,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the acknowledgment, overwriting the window of a repeated one, and wakes the waiters.
    pub fn record(&self, ack: Acknowledge) {
        self.acks.lock().expect(OTHER_THREAD_ERR).insert(ack.serial, ack.window);
        self.changed.notify_all();
    }

    /// Window reported by the acknowledgment of `serial`, if it already arrived.
    pub fn window_of(&self, serial: i64) -> Option<i64> {
        self.acks.lock().expect(OTHER_THREAD_ERR).get(&serial).copied()
    }

    /// Blocks until `serial` is acknowledged or `timeout` expires.
    /// Returns the reported window.
    pub fn wait_for(&self, serial: i64, timeout: Duration) -> Option<i64> {
        let acks = self.acks.lock().expect(OTHER_THREAD_ERR);
        let (acks, _) = self
            .changed
            .wait_timeout_while(acks, timeout, |acks| !acks.contains_key(&serial))
            .expect(OTHER_THREAD_ERR);
        acks.get(&serial).copied()
    }

    /// As [`AckLedger::wait_for()`] but the acknowledgment is removed,
    /// so the next wait for the same serial needs a new one. Used by probes.
    pub fn take(&self, serial: i64, timeout: Duration) -> Option<i64> {
        let acks = self.acks.lock().expect(OTHER_THREAD_ERR);
        let (mut acks, _) = self
            .changed
            .wait_timeout_while(acks, timeout, |acks| !acks.contains_key(&serial))
            .expect(OTHER_THREAD_ERR);
        acks.remove(&serial)
    }

    pub fn forget(&self, serial: i64) {
        self.acks.lock().expect(OTHER_THREAD_ERR).remove(&serial);
    }

    /// Number of serials in `0..total` acknowledged. Probes are not counted.
    pub fn acknowledged(&self, total: usize) -> usize {
        let acks = self.acks.lock().expect(OTHER_THREAD_ERR);
        acks.keys().filter(|serial| (0..total as i64).contains(*serial)).count()
    }
}
