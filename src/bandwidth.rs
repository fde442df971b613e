//! Running tally of bytes attributed to intercepted receive calls.

use parking_lot::Mutex;

#[derive(Default)]
struct Totals {
    total: u64,
    window: u64,
}

/// A process-wide, mutex-guarded byte counter fed by the receive detours.
pub struct BandwidthCounter {
    totals: Mutex<Totals>,
}

impl BandwidthCounter {
    pub const fn new() -> Self {
        BandwidthCounter {
            totals: Mutex::new(Totals { total: 0, window: 0 }),
        }
    }

    /// Attributes `len` additional received bytes. A negative or zero
    /// `len` (the sockets-error sentinel, or a graceful zero-byte receive)
    /// contributes nothing.
    pub fn attribute(&self, len: i32) {
        if len <= 0 {
            return;
        }
        let mut totals = self.totals.lock();
        totals.total += len as u64;
        totals.window += len as u64;
    }

    pub fn total(&self) -> u64 {
        self.totals.lock().total
    }

    /// Returns the bytes attributed since the last call to this method, and
    /// resets the window to zero.
    pub fn take_window(&self) -> u64 {
        let mut totals = self.totals.lock();
        std::mem::take(&mut totals.window)
    }
}

impl Default for BandwidthCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_lengths_accumulate_exactly() {
        let counter = BandwidthCounter::new();
        counter.attribute(4096);
        counter.attribute(512);
        assert_eq!(counter.total(), 4608);
    }

    #[test]
    fn error_sentinel_contributes_nothing() {
        let counter = BandwidthCounter::new();
        counter.attribute(4096);
        counter.attribute(-1);
        assert_eq!(counter.total(), 4096);
    }

    #[test]
    fn zero_length_contributes_nothing() {
        let counter = BandwidthCounter::new();
        counter.attribute(0);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn window_resets_after_read() {
        let counter = BandwidthCounter::new();
        counter.attribute(100);
        assert_eq!(counter.take_window(), 100);
        assert_eq!(counter.take_window(), 0);
        assert_eq!(counter.total(), 100);
    }
}
