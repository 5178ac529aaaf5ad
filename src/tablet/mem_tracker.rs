use std::sync::atomic::{AtomicUsize, Ordering};

use super::error::{TabletError, TabletResult};

/// Accounts for the memory held by in-memory stores. Writers that would
/// push consumption past the budget receive `ServiceUnavailable` and must
/// wait for a flush to recover memory.
pub struct MemTracker {
    limit: usize,
    consumed: AtomicUsize,
}

impl MemTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            consumed: AtomicUsize::new(0),
        }
    }

    pub fn try_consume(&self, bytes: usize) -> TabletResult<()> {
        let mut current = self.consumed.load(Ordering::Relaxed);
        loop {
            let next = current + bytes;
            if next > self.limit {
                return Err(TabletError::ServiceUnavailable(format!(
                    "memory budget exceeded ({} + {} > {}); flush required",
                    current, bytes, self.limit
                ))
                .into());
            }
            match self.consumed.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        self.consumed.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn consumption(&self) -> usize {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_enforced() {
        let tracker = MemTracker::new(100);
        tracker.try_consume(60).unwrap();
        assert!(tracker.try_consume(50).is_err());
        tracker.release(60);
        tracker.try_consume(100).unwrap();
        assert_eq!(tracker.consumption(), 100);
    }
}
