// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Row-granularity advisory locks.
//!
//! Locks are keyed by the encoded primary key, hashed onto a fixed table of
//! stripes. Two unrelated keys that hash to the same stripe will serialize
//! against each other; with the default stripe count this is rare and only
//! costs latency, never correctness. A write holds at most one row lock, so
//! no deadlock is possible.

use std::io::Cursor;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

const DEFAULT_NUM_STRIPES: usize = 1024;

const LOCK_HASH_SEED: u32 = 0x9e37_79b9;

struct LockStripe {
    held: Mutex<bool>,
    released: Condvar,
}

/// Striped lock table. One per tablet.
pub struct LockManager {
    stripes: Vec<LockStripe>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::with_stripes(DEFAULT_NUM_STRIPES)
    }
}

impl LockManager {
    pub fn with_stripes(num_stripes: usize) -> Self {
        assert!(num_stripes > 0);
        Self {
            stripes: (0..num_stripes)
                .map(|_| LockStripe {
                    held: Mutex::new(false),
                    released: Condvar::new(),
                })
                .collect(),
        }
    }

    fn stripe_of(&self, encoded_key: &[u8]) -> usize {
        let mut cursor = Cursor::new(encoded_key);
        let hash = murmur3::murmur3_32(&mut cursor, LOCK_HASH_SEED)
            .expect("hashing an in-memory buffer cannot fail");
        (hash as usize) % self.stripes.len()
    }

    /// Acquire the exclusive lock covering `encoded_key`, blocking until it
    /// is available. Waiters are woken in roughly FIFO order.
    pub fn lock_row(self: &Arc<Self>, encoded_key: &[u8]) -> RowLock {
        let stripe_idx = self.stripe_of(encoded_key);
        let stripe = &self.stripes[stripe_idx];
        let mut held = stripe.held.lock();
        while *held {
            stripe.released.wait(&mut held);
        }
        *held = true;
        RowLock {
            manager: self.clone(),
            stripe_idx,
        }
    }
}

/// Handle for a held row lock; owned by a prepared write and released on
/// drop, after commit or abort.
pub struct RowLock {
    manager: Arc<LockManager>,
    stripe_idx: usize,
}

impl Drop for RowLock {
    fn drop(&mut self) {
        let stripe = &self.manager.stripes[self.stripe_idx];
        let mut held = stripe.held.lock();
        *held = false;
        stripe.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_same_key() {
        let manager = Arc::new(LockManager::with_stripes(4));
        let lock = manager.lock_row(b"k1");
        let contender = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                let _lock = manager.lock_row(b"k1");
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());
        drop(lock);
        contender.join().unwrap();
    }

    #[test]
    fn test_lock_reacquirable_after_release() {
        let manager = Arc::new(LockManager::default());
        drop(manager.lock_row(b"k1"));
        drop(manager.lock_row(b"k1"));
    }
}
