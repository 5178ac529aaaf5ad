// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! The in-memory rowset.
//!
//! All inserts land in the tablet's active MemRowSet: an ordered map from
//! encoded primary key to the inserted payload, its insertion timestamp,
//! and a chain of later mutations. A MemRowSet only ever holds rows of one
//! schema version, since schema alters flush it first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use super::error::{TabletError, TabletResult};
use super::iterator::{RowSetIterator, VecIterator};
use super::key::RowSetKeyProbe;
use super::mem_tracker::MemTracker;
use super::mvcc::{MvccSnapshot, Timestamp};
use super::row::{Row, RowChangeList};
use super::rowset::{CompactFlushLock, DeltaStats, RowSet};
use crate::catalog::{Projection, SchemaRef};

/// Fixed per-entry overhead charged to the memory budget.
const ENTRY_OVERHEAD: usize = 32;

struct MrsRow {
    row: Row,
    insert_ts: Timestamp,
    mutations: SmallVec<[(Timestamp, RowChangeList); 2]>,
}

impl MrsRow {
    fn is_deleted(&self) -> bool {
        self.mutations.iter().any(|(_, c)| c.is_delete())
    }

    /// Row state under `snap`, or `None` if invisible or deleted.
    fn materialize(
        &self,
        stored_schema: &SchemaRef,
        projection: &Projection,
        snap: &MvccSnapshot,
    ) -> Option<Row> {
        if !snap.is_visible(self.insert_ts) {
            return None;
        }
        let mut row = self.row.project(stored_schema, projection);
        for (ts, changes) in &self.mutations {
            if !snap.is_visible(*ts) {
                continue;
            }
            if !changes.apply_to_projected(projection, &mut row) {
                return None;
            }
        }
        Some(row)
    }
}

pub struct MemRowSet {
    mrs_id: i64,
    schema: SchemaRef,
    state: RwLock<BTreeMap<Vec<u8>, MrsRow>>,
    size: AtomicUsize,
    mem_tracker: Arc<MemTracker>,
    compact_flush_lock: CompactFlushLock,
}

impl MemRowSet {
    pub fn new(mrs_id: i64, schema: SchemaRef, mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            mrs_id,
            schema,
            state: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            mem_tracker,
            compact_flush_lock: CompactFlushLock::default(),
        }
    }

    pub fn mrs_id(&self) -> i64 {
        self.mrs_id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Insert a new row under `ts`. The key must be absent; a delete-marked
    /// entry still occupies its key.
    pub fn insert(&self, ts: Timestamp, encoded_key: &[u8], row: Row) -> TabletResult<()> {
        let mut state = self.state.write();
        if state.contains_key(encoded_key) {
            return Err(TabletError::already_present(format!(
                "{:02x?}",
                encoded_key
            )));
        }
        let bytes = encoded_key.len() + row.size_bytes() + ENTRY_OVERHEAD;
        self.mem_tracker.try_consume(bytes)?;
        self.size.fetch_add(bytes, Ordering::Relaxed);
        state.insert(
            encoded_key.to_vec(),
            MrsRow {
                row,
                insert_ts: ts,
                mutations: SmallVec::new(),
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Drop for MemRowSet {
    fn drop(&mut self) {
        self.mem_tracker.release(self.size.load(Ordering::Relaxed));
    }
}

impl RowSet for MemRowSet {
    fn name(&self) -> String {
        format!("MRS({})", self.mrs_id)
    }

    fn check_row_present(&self, probe: &RowSetKeyProbe) -> TabletResult<bool> {
        Ok(self.state.read().contains_key(probe.encoded_key()))
    }

    fn mutate_row(
        &self,
        ts: Timestamp,
        probe: &RowSetKeyProbe,
        changes: &RowChangeList,
    ) -> TabletResult<()> {
        let mut state = self.state.write();
        let entry = state.get_mut(probe.encoded_key()).ok_or_else(|| {
            TabletError::not_found("row", format!("{:02x?}", probe.encoded_key()))
        })?;
        if entry.is_deleted() {
            return Err(TabletError::not_found(
                "row",
                format!("{:02x?}", probe.encoded_key()),
            ));
        }
        // Row locks serialize writers per key, so chains grow in timestamp
        // order.
        debug_assert!(entry.mutations.last().is_none_or(|(last, _)| *last < ts));
        let bytes = changes.size_bytes() + ENTRY_OVERHEAD;
        self.mem_tracker.try_consume(bytes)?;
        self.size.fetch_add(bytes, Ordering::Relaxed);
        entry.mutations.push((ts, changes.clone()));
        Ok(())
    }

    fn new_iterator(
        self: Arc<Self>,
        projection: &Projection,
        snap: &MvccSnapshot,
    ) -> TabletResult<Box<dyn RowSetIterator>> {
        let state = self.state.read();
        let mut rows = Vec::with_capacity(state.len());
        for (key, entry) in state.iter() {
            if let Some(row) = entry.materialize(&self.schema, projection, snap) {
                rows.push((key.clone(), row));
            }
        }
        Ok(Box::new(VecIterator::new(rows)))
    }

    fn entry_count(&self) -> u64 {
        self.state.read().len() as u64
    }

    fn estimate_on_disk_size(&self) -> u64 {
        0
    }

    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let state = self.state.read();
        match (state.first_key_value(), state.last_key_value()) {
            (Some((min, _)), Some((max, _))) => Some((min.clone(), max.clone())),
            _ => None,
        }
    }

    fn delta_stats(&self) -> DeltaStats {
        DeltaStats::default()
    }

    fn collect_missed_deltas(
        &self,
        after: Timestamp,
        upto: Timestamp,
    ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)> {
        let state = self.state.read();
        let mut missed = Vec::new();
        for (key, entry) in state.iter() {
            for (ts, changes) in &entry.mutations {
                if *ts > after && *ts <= upto {
                    missed.push((key.clone(), *ts, changes.clone()));
                }
            }
        }
        missed
    }

    fn compact_flush_lock(&self) -> &CompactFlushLock {
        &self.compact_flush_lock
    }

    fn debug_dump(&self, lines: &mut Vec<String>) {
        let state = self.state.read();
        lines.push(format!("{}: {} entries", self.name(), state.len()));
        for (key, entry) in state.iter() {
            lines.push(format!(
                "  {:02x?} @{}: {:?} (+{} mutations)",
                key,
                entry.insert_ts,
                entry.row,
                entry.mutations.len()
            ));
        }
    }
}
