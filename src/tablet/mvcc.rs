// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Multi-version concurrency control.
//!
//! The [`MvccManager`] issues strictly increasing commit timestamps, tracks
//! the set of in-flight transactions, and hands out immutable
//! [`MvccSnapshot`]s describing which timestamps are committed. Visibility
//! of a timestamp `t` to a snapshot is `t <= commit_high_water && t not in
//! in_flight`.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::clock::ClockRef;
use super::error::{TabletError, TabletResult};

/// A totally ordered, opaque commit timestamp.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);

    pub fn new(value: u64) -> Self {
        Timestamp(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts@{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct MvccInner {
    /// The next timestamp to issue. Every issued timestamp is < this.
    next_ts: u64,
    /// Issued but not yet committed or aborted.
    in_flight: BTreeSet<Timestamp>,
}

impl MvccInner {
    /// Latest issued timestamp, ignoring in-flight state.
    fn high_water(&self) -> Timestamp {
        Timestamp(self.next_ts.saturating_sub(1))
    }
}

/// Thread-safe MVCC transaction registry. One per tablet.
pub struct MvccManager {
    clock: ClockRef,
    inner: Mutex<MvccInner>,
    committed_cond: Condvar,
}

impl MvccManager {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            inner: Mutex::new(MvccInner::default()),
            committed_cond: Condvar::new(),
        }
    }

    /// Issue a fresh timestamp, strictly greater than every previously
    /// issued one, and mark it in-flight.
    pub fn start_transaction(&self) -> Timestamp {
        let mut inner = self.inner.lock();
        let ts = Timestamp(self.clock.now().value().max(inner.next_ts));
        inner.next_ts = ts.0 + 1;
        inner.in_flight.insert(ts);
        ts
    }

    /// Start a transaction at a caller-supplied timestamp, used when
    /// replaying ordered operations. Fails with `InvalidTimestamp` unless
    /// `ts` is strictly greater than every previously issued timestamp.
    pub fn start_transaction_at(&self, ts: Timestamp) -> TabletResult<Timestamp> {
        let mut inner = self.inner.lock();
        if ts <= inner.high_water() {
            return Err(TabletError::InvalidTimestamp(format!(
                "{} is not beyond the high water mark {}",
                ts,
                inner.high_water()
            ))
            .into());
        }
        inner.next_ts = ts.0 + 1;
        inner.in_flight.insert(ts);
        self.clock.observe(ts);
        Ok(ts)
    }

    /// Mark `ts` committed and wake any flush waiting on it.
    pub fn commit(&self, ts: Timestamp) {
        let mut inner = self.inner.lock();
        let removed = inner.in_flight.remove(&ts);
        debug_assert!(removed, "commit of unknown transaction {}", ts);
        self.committed_cond.notify_all();
    }

    /// Mark `ts` aborted. The caller must not have exposed any writes under
    /// this timestamp.
    pub fn abort(&self, ts: Timestamp) {
        let mut inner = self.inner.lock();
        let removed = inner.in_flight.remove(&ts);
        debug_assert!(removed, "abort of unknown transaction {}", ts);
        self.committed_cond.notify_all();
    }

    /// Advance the issued-timestamp horizon past `ts` without starting a
    /// transaction. Used when opening a tablet whose persisted data
    /// carries timestamps from a previous incarnation, so that fresh
    /// snapshots see it.
    pub fn observe_persisted(&self, ts: Timestamp) {
        let mut inner = self.inner.lock();
        inner.next_ts = inner.next_ts.max(ts.value() + 1);
        self.clock.observe(ts);
    }

    /// Capture the current visibility horizon.
    pub fn take_snapshot(&self) -> MvccSnapshot {
        let inner = self.inner.lock();
        MvccSnapshot {
            commit_high_water: inner.high_water(),
            in_flight: inner.in_flight.clone(),
        }
    }

    /// Block until no in-flight transaction has a timestamp below `ts`.
    /// New transactions always receive timestamps beyond every issued one,
    /// so once this returns the set of commits below `ts` is final.
    pub fn wait_until_all_committed_before(&self, ts: Timestamp) {
        let mut inner = self.inner.lock();
        while inner.in_flight.iter().next().is_some_and(|first| *first < ts) {
            self.committed_cond.wait(&mut inner);
        }
    }

    /// Smallest in-flight timestamp minus one, or the latest issued
    /// timestamp if nothing is in flight.
    pub fn safe_timestamp(&self) -> Timestamp {
        let inner = self.inner.lock();
        match inner.in_flight.iter().next() {
            Some(first) => Timestamp(first.0.saturating_sub(1)),
            None => inner.high_water(),
        }
    }
}

/// An immutable visibility horizon: everything at or below
/// `commit_high_water` is committed except the captured in-flight set.
#[derive(Clone, Debug)]
pub struct MvccSnapshot {
    commit_high_water: Timestamp,
    in_flight: BTreeSet<Timestamp>,
}

impl MvccSnapshot {
    /// A snapshot in which every timestamp at or below `ts` is visible.
    pub fn at(ts: Timestamp) -> Self {
        Self {
            commit_high_water: ts,
            in_flight: BTreeSet::new(),
        }
    }

    pub fn is_visible(&self, ts: Timestamp) -> bool {
        ts <= self.commit_high_water && !self.in_flight.contains(&ts)
    }

    pub fn commit_high_water(&self) -> Timestamp {
        self.commit_high_water
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::clock::LogicalClock;
    use super::*;

    fn manager() -> MvccManager {
        MvccManager::new(Arc::new(LogicalClock::new(0)))
    }

    #[test]
    fn test_snapshot_visibility() {
        let mvcc = manager();
        let t1 = mvcc.start_transaction();
        let snap = mvcc.take_snapshot();
        // t1 is issued but uncommitted: invisible.
        assert!(!snap.is_visible(t1));

        mvcc.commit(t1);
        let snap = mvcc.take_snapshot();
        assert!(snap.is_visible(t1));
        // Timestamps beyond the high water mark are invisible.
        assert!(!snap.is_visible(t1.next()));
    }

    #[test]
    fn test_start_transaction_at_enforces_monotonicity() {
        let mvcc = manager();
        let t5 = mvcc.start_transaction_at(Timestamp::new(5)).unwrap();
        mvcc.commit(t5);
        assert!(mvcc.start_transaction_at(Timestamp::new(5)).is_err());
        assert!(mvcc.start_transaction_at(Timestamp::new(4)).is_err());
        let t6 = mvcc.start_transaction_at(Timestamp::new(6)).unwrap();
        mvcc.commit(t6);
        // The clock observed the replayed timestamps.
        assert!(mvcc.start_transaction() > t6);
    }

    #[test]
    fn test_wait_until_all_committed_before() {
        let mvcc = Arc::new(manager());
        let t1 = mvcc.start_transaction();
        let waiter = {
            let mvcc = mvcc.clone();
            std::thread::spawn(move || {
                mvcc.wait_until_all_committed_before(t1.next());
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        mvcc.commit(t1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_safe_timestamp_tracks_earliest_in_flight() {
        let mvcc = manager();
        let t1 = mvcc.start_transaction();
        let t2 = mvcc.start_transaction();
        assert_eq!(mvcc.safe_timestamp(), Timestamp::new(t1.value() - 1));
        mvcc.commit(t1);
        assert_eq!(mvcc.safe_timestamp(), Timestamp::new(t2.value() - 1));
        mvcc.commit(t2);
        assert_eq!(mvcc.safe_timestamp(), t2);
    }
}
