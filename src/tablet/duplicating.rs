// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! The transient rowset published while a flush or compaction runs.
//!
//! A [`DuplicatingRowSet`] stands in the rowset tree for the frozen inputs
//! of an in-progress operation. Reads and presence probes consult only the
//! old inputs, which keep receiving every mutation and therefore stay
//! current; mutations are additionally recorded in the delta store the
//! compaction output will adopt, so the output is already up to date when
//! it is swapped in. Its compact/flush lock is held from construction,
//! which keeps a second compaction from selecting it.

use std::sync::Arc;

use itertools::Itertools;

use super::delta::DeltaMemStore;
use super::error::{TabletError, TabletResult};
use super::iterator::{MergeIterator, RowSetIterator};
use super::key::RowSetKeyProbe;
use super::mvcc::{MvccSnapshot, Timestamp};
use super::row::{Row, RowChangeList};
use super::rowset::{CompactFlushLock, DeltaStats, RowSet};
use crate::catalog::Projection;

pub struct DuplicatingRowSet {
    old_rowsets: Vec<Arc<dyn RowSet>>,
    new_deltas: Arc<DeltaMemStore>,
    compact_flush_lock: CompactFlushLock,
}

impl DuplicatingRowSet {
    pub fn new(old_rowsets: Vec<Arc<dyn RowSet>>) -> Self {
        assert!(!old_rowsets.is_empty());
        Self {
            old_rowsets,
            new_deltas: Arc::new(DeltaMemStore::new()),
            compact_flush_lock: CompactFlushLock::new_held(),
        }
    }

    pub fn old_rowsets(&self) -> &[Arc<dyn RowSet>] {
        &self.old_rowsets
    }

    /// The delta store accumulating mutations for the compaction output.
    pub fn new_deltas(&self) -> &Arc<DeltaMemStore> {
        &self.new_deltas
    }

    fn find_old_with_key(&self, probe: &RowSetKeyProbe) -> TabletResult<Option<&Arc<dyn RowSet>>> {
        for rowset in &self.old_rowsets {
            if rowset.check_row_present(probe)? {
                return Ok(Some(rowset));
            }
        }
        Ok(None)
    }
}

impl RowSet for DuplicatingRowSet {
    fn name(&self) -> String {
        format!(
            "dup({})",
            self.old_rowsets.iter().map(|r| r.name()).join("+")
        )
    }

    fn check_row_present(&self, probe: &RowSetKeyProbe) -> TabletResult<bool> {
        Ok(self.find_old_with_key(probe)?.is_some())
    }

    fn mutate_row(
        &self,
        ts: Timestamp,
        probe: &RowSetKeyProbe,
        changes: &RowChangeList,
    ) -> TabletResult<()> {
        let old = self
            .find_old_with_key(probe)?
            .ok_or_else(|| {
                TabletError::not_found("row", format!("{:02x?}", probe.encoded_key()))
            })?;
        // Old input first: scans read through the old inputs, so the
        // mutation must be there before it is acknowledged anywhere.
        old.mutate_row(ts, probe, changes)?;
        self.new_deltas.upsert(probe.encoded_key(), ts, changes);
        Ok(())
    }

    fn new_iterator(
        self: Arc<Self>,
        projection: &Projection,
        snap: &MvccSnapshot,
    ) -> TabletResult<Box<dyn RowSetIterator>> {
        let children = self
            .old_rowsets
            .iter()
            .map(|rs| rs.clone().new_iterator(projection, snap))
            .collect::<TabletResult<Vec<_>>>()?;
        Ok(Box::new(MergeIterator::new(children)?))
    }

    fn entry_count(&self) -> u64 {
        self.old_rowsets.iter().map(|rs| rs.entry_count()).sum()
    }

    fn estimate_on_disk_size(&self) -> u64 {
        self.old_rowsets
            .iter()
            .map(|rs| rs.estimate_on_disk_size())
            .sum()
    }

    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut bounds: Option<(Vec<u8>, Vec<u8>)> = None;
        for (min, max) in self.old_rowsets.iter().filter_map(|rs| rs.key_bounds()) {
            bounds = Some(match bounds {
                None => (min, max),
                Some((cur_min, cur_max)) => (cur_min.min(min), cur_max.max(max)),
            });
        }
        bounds
    }

    fn delta_stats(&self) -> DeltaStats {
        // Not a candidate for delta maintenance; its lock is always held.
        DeltaStats::default()
    }

    fn collect_missed_deltas(
        &self,
        after: Timestamp,
        upto: Timestamp,
    ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)> {
        self.old_rowsets
            .iter()
            .flat_map(|rs| rs.collect_missed_deltas(after, upto))
            .collect()
    }

    fn compact_flush_lock(&self) -> &CompactFlushLock {
        &self.compact_flush_lock
    }

    fn debug_dump(&self, lines: &mut Vec<String>) {
        lines.push(format!("{}:", self.name()));
        for rowset in &self.old_rowsets {
            rowset.debug_dump(lines);
        }
    }
}
