//! Process-wide version counter for job snapshots

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out snapshot versions.
///
/// Every process start gets a new epoch from storage; versions issued by this
/// process start at `epoch << 32`, above anything an earlier process could
/// have published even for progress updates that were never persisted.
#[derive(Debug)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new(epoch: u64) -> Self {
        Self {
            last: AtomicU64::new(epoch << 32),
        }
    }

    /// Next version for a record currently at `current`
    pub fn next(&self, current: u64) -> u64 {
        let issued = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        if issued > current {
            return issued;
        }
        // Only reachable when a row carries a version from a later epoch
        self.last.fetch_max(current + 1, Ordering::SeqCst);
        self.next(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_start_at_epoch() {
        let clock = VersionClock::new(3);
        assert_eq!(clock.next(0), (3 << 32) + 1);
        assert_eq!(clock.next(0), (3 << 32) + 2);
    }

    #[test]
    fn test_new_epoch_exceeds_previous_process() {
        let old = VersionClock::new(1);
        let mut last = 0;
        for _ in 0..1000 {
            last = old.next(last);
        }

        let new = VersionClock::new(2);
        assert!(new.next(last) > last);
    }

    #[test]
    fn test_next_is_above_current() {
        let clock = VersionClock::new(1);
        let ahead = (5 << 32) + 10;
        let version = clock.next(ahead);
        assert!(version > ahead);
        assert!(clock.next(0) > version);
    }
}
