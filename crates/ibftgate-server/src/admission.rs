//! Connection admission control.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hard ceiling on simultaneously active connections
///
/// `try_admit` increments the active count and, if the result exceeds the
/// maximum, undoes the increment and refuses. There is no queue.
#[derive(Debug)]
pub struct AdmissionControl {
    active: AtomicUsize,
    max: usize,
}

impl AdmissionControl {
    /// Create a controller admitting at most `max` connections
    #[must_use]
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    /// Try to admit one connection
    ///
    /// The returned permit releases its slot when dropped.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        if active > self.max {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(AdmissionPermit {
            control: Arc::clone(self),
        })
    }

    /// Currently admitted connections
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire).min(self.max)
    }

    /// Configured maximum
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }
}

/// Slot held by one admitted connection
#[derive(Debug)]
pub struct AdmissionPermit {
    control: Arc<AdmissionControl>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.control.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_is_enforced() {
        let control = AdmissionControl::new(2);
        let a = control.try_admit();
        let b = control.try_admit();
        assert!(a.is_some() && b.is_some());
        assert!(control.try_admit().is_none());
        assert_eq!(control.active(), 2);

        drop(a);
        assert_eq!(control.active(), 1);
        assert!(control.try_admit().is_some());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_max() {
        let control = AdmissionControl::new(5);
        let admitted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    let control = Arc::clone(&control);
                    s.spawn(move || control.try_admit())
                })
                .collect();
            let permits: Vec<_> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();
            permits.len()
        });
        assert_eq!(admitted, 5);
        assert_eq!(control.active(), 0);
    }
}
