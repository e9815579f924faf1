//! Overlay file handle allocation

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues file handles for both in-memory and delegated opens.
///
/// Handles start at 1 and only ever grow; released handles are not
/// reclaimed for the lifetime of the mount session.
#[derive(Debug)]
pub struct HandleCounter {
    next_fh: AtomicU64,
}

impl HandleCounter {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
        }
    }

    /// Allocate a new file handle
    pub fn alloc(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of handles issued so far
    pub fn issued(&self) -> u64 {
        self.next_fh.load(Ordering::SeqCst) - 1
    }
}

impl Default for HandleCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_monotonic() {
        let counter = HandleCounter::new();
        assert_eq!(counter.issued(), 0);

        let first = counter.alloc();
        let second = counter.alloc();
        let third = counter.alloc();

        assert_eq!(first, 1);
        assert!(first < second && second < third);
        assert_eq!(counter.issued(), 3);
    }
}
