// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Flush, compaction, and delta maintenance.
//!
//! MemRowSet flush, rowset-merge compaction, and delta compaction are
//! variants of one three-phase swap:
//!
//! 1. Under the components write-lock the selected inputs are replaced in
//!    the rowset tree by a [`DuplicatingRowSet`]; a flush additionally
//!    swaps in a fresh MemRowSet. A snapshot S1 is taken and the driver
//!    waits for every earlier writer to resolve.
//! 2. The frozen inputs are merge-read filtered by S1 into a new rowset's
//!    base data. Writes continue: the duplicating rowset routes mutations
//!    to both the old input that owns the key and the delta store the
//!    output will adopt.
//! 3. A second snapshot S2 is taken, mutations in (S1, S2] are re-applied
//!    onto the output's delta store (idempotently, by key and timestamp),
//!    deltas already folded into the base are pruned, and a components
//!    version with the output in place of the duplicating rowset is
//!    published. The metadata update that follows is the point of no
//!    return: a failure there fails the tablet.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, error, info, warn};

use super::cfile::CFileWriter;
use super::iterator::RowSetIterator;
use super::components::TabletComponents;
use super::delta::{DeltaFile, DeltaTracker};
use super::duplicating::DuplicatingRowSet;
use super::error::{TabletError, TabletResult};
use super::iterator::MergeIterator;
use super::maintenance::{MaintenanceOp, MaintenanceOpStats, TaskState, TaskTracker};
use super::mem_rowset::MemRowSet;
use super::metadata::RowSetMetadata;
use super::mvcc::{MvccSnapshot, Timestamp};
use super::row::{RowChange, RowChangeList};
use super::rowset::{CompactFlushGuard, DiskRowSet, DiskRowSetWriter, RowSet};
use super::Tablet;
use crate::types::ColumnId;

/// Flags changing compaction behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactFlags {
    NoFlags,
    /// Include every rowset regardless of the size policy. A forced
    /// compaction of a single rowset rewrites it.
    ForceCompactAll,
}

/// Test-only hook points between the phases of the swap protocol. The
/// default implementation does nothing; fault-injection tests pause and
/// interleave here.
pub trait FlushCompactHooks: Send + Sync {
    fn post_swap_new_mem_rowset(&self) -> TabletResult<()> {
        Ok(())
    }
    fn post_swap_in_duplicating_rowset(&self) -> TabletResult<()> {
        Ok(())
    }
    fn post_take_mvcc_snapshot(&self) -> TabletResult<()> {
        Ok(())
    }
    fn post_write_snapshot(&self) -> TabletResult<()> {
        Ok(())
    }
    fn post_reupdate_missed_deltas(&self) -> TabletResult<()> {
        Ok(())
    }
    fn post_swap_new_rowset(&self) -> TabletResult<()> {
        Ok(())
    }
}

pub(crate) struct NoopHooks;

impl FlushCompactHooks for NoopHooks {}

/// Inputs selected for one flush/compaction, with their compact/flush
/// locks held for the whole operation.
#[derive(Default)]
pub(crate) struct PickedInputs {
    rowsets: Vec<Arc<dyn RowSet>>,
    guards: Vec<CompactFlushGuard>,
}

impl Tablet {
    /// Flush the current MemRowSet to a new disk rowset, swapping a fresh
    /// one in its place. An empty MemRowSet makes this a no-op. Does not
    /// touch any DeltaMemStore; see [`Tablet::flush_biggest_dms`].
    pub fn flush(&self) -> TabletResult<()> {
        let _flush_guard = self.rowsets_flush_lock.lock();
        self.flush_unlocked()
    }

    /// Flush with the rowsets-flush lock already held.
    pub(crate) fn flush_unlocked(&self) -> TabletResult<()> {
        self.check_not_failed()?;
        if self.components.read().memrowset.is_empty() {
            debug!("flush: MemRowSet is empty, nothing to do");
            return Ok(());
        }
        self.do_compaction_or_flush(None)
    }

    /// Merge-compact rowsets selected by the size policy (or all of them
    /// under `ForceCompactAll`) into one.
    pub fn compact(&self, flags: CompactFlags) -> TabletResult<()> {
        self.check_not_failed()?;
        let picked = self.pick_rowsets_to_compact(flags);
        let enough = match flags {
            CompactFlags::NoFlags => picked.rowsets.len() >= 2,
            CompactFlags::ForceCompactAll => !picked.rowsets.is_empty(),
        };
        if !enough {
            debug!("compaction: no candidate rowsets");
            return Ok(());
        }
        info!(
            "compaction: selected [{}]",
            picked.rowsets.iter().map(|rs| rs.name()).join(",")
        );
        self.do_compaction_or_flush(Some(picked))
    }

    /// Select compaction inputs under the compact-select mutex. A rowset
    /// whose compact/flush lock is taken is excluded; the locks of the
    /// selected rowsets stay held until the operation finishes.
    fn pick_rowsets_to_compact(&self, flags: CompactFlags) -> PickedInputs {
        let _select_guard = self.compact_select_lock.lock();
        let components = self.components.read().clone();
        let mut picked = PickedInputs::default();
        let mut current_size = 0u64;
        for rowset in components.rowsets.iter() {
            let size = rowset.estimate_on_disk_size();
            if flags != CompactFlags::ForceCompactAll
                && current_size + size > self.options.target_rowset_size
            {
                continue;
            }
            if let Some(guard) = CompactFlushGuard::try_acquire(rowset) {
                current_size += size;
                picked.rowsets.push(rowset.clone());
                picked.guards.push(guard);
            }
        }
        picked
    }

    /// The three-phase swap shared by flush (`picked` is `None`) and
    /// rowset-merge compaction.
    fn do_compaction_or_flush(&self, picked: Option<PickedInputs>) -> TabletResult<()> {
        let hooks = self.hooks.lock().clone();
        let is_flush = picked.is_none();
        // Guards live to the end of the operation; dropping them releases
        // the inputs' compact/flush locks.
        let (mut inputs, mut guards) = match picked {
            Some(p) => (p.rowsets, p.guards),
            None => (Vec::new(), Vec::new()),
        };

        // ---- Phase 1: freeze inputs, publish the duplicating rowset ----
        let mut retired_mrs_id = None;
        let mut new_active_mrs_id = None;
        let (dup, schema) = {
            let mut components = self.components.write();
            if is_flush {
                let old_mrs = components.memrowset.clone();
                if old_mrs.is_empty() {
                    return Ok(());
                }
                let old_dyn: Arc<dyn RowSet> = old_mrs.clone();
                match CompactFlushGuard::try_acquire(&old_dyn) {
                    Some(guard) => guards.push(guard),
                    None => {
                        return Err(TabletError::ServiceUnavailable(
                            "MemRowSet is already being flushed".into(),
                        )
                        .into())
                    }
                }
                retired_mrs_id = Some(old_mrs.mrs_id());
                inputs.push(old_dyn);
            }
            let dup = Arc::new(DuplicatingRowSet::new(inputs.clone()));
            let dup_dyn: Arc<dyn RowSet> = dup.clone();
            let new_tree = components.rowsets.replacing(&inputs, vec![dup_dyn]);
            let memrowset = if is_flush {
                let mrs_id = self.next_mrs_id.fetch_add(1, Ordering::SeqCst);
                new_active_mrs_id = Some(mrs_id);
                Arc::new(MemRowSet::new(
                    mrs_id,
                    components.schema.clone(),
                    self.mem_tracker.clone(),
                ))
            } else {
                components.memrowset.clone()
            };
            let schema = components.schema.clone();
            *components =
                TabletComponents::new(schema.clone(), memrowset, Arc::new(new_tree));
            (dup, schema)
        };
        if let Some(mrs_id) = new_active_mrs_id {
            self.anchor_registry.anchor_mrs(&self.tablet_id, mrs_id);
        }
        let dup_dyn: Arc<dyn RowSet> = dup.clone();

        let rowset_id = self.metadata.gen_rowset_id();
        let (_, output_dir) = self.metadata.new_rowset_dir(rowset_id);

        // Everything from here to the final swap rolls back by restoring
        // the inputs into the tree.
        let phase_result = (|| -> TabletResult<Option<(Arc<DiskRowSet>, RowSetMetadata)>> {
            if is_flush {
                hooks.post_swap_new_mem_rowset()?;
            }
            hooks.post_swap_in_duplicating_rowset()?;

            let s1 = self.mvcc.take_snapshot().commit_high_water();
            self.mvcc.wait_until_all_committed_before(s1.next());
            // Every transaction at or below s1 has resolved, and aborts
            // never expose writes, so a plain horizon snapshot suffices.
            let snap1 = MvccSnapshot::at(s1);
            hooks.post_take_mvcc_snapshot()?;

            // ---- Phase 2: merge-read the inputs, write the output ----
            let expected_keys: u64 = inputs.iter().map(|rs| rs.entry_count()).sum();
            let mut writer = DiskRowSetWriter::create(
                rowset_id,
                output_dir.clone(),
                schema.column_ids(),
                expected_keys as usize,
                self.options.bloom_sizing,
            )?;
            let projection = schema.full_projection();
            let children = inputs
                .iter()
                .map(|rs| rs.clone().new_iterator(&projection, &snap1))
                .collect::<TabletResult<Vec<_>>>()?;
            let mut merge = MergeIterator::new(children)?;
            while let Some((key, row)) = merge.next_row()? {
                writer.append(&key, &row)?;
            }
            hooks.post_write_snapshot()?;

            // ---- Phase 3: re-apply missed deltas, build the output ----
            let s2 = self.mvcc.take_snapshot().commit_high_water();
            self.mvcc.wait_until_all_committed_before(s2.next());
            for rowset in &inputs {
                for (key, ts, changes) in rowset.collect_missed_deltas(s1, s2) {
                    dup.new_deltas().upsert(&key, ts, &changes);
                }
            }
            hooks.post_reupdate_missed_deltas()?;
            // Mutations at or below s1 are already folded into the base.
            dup.new_deltas().prune_at_or_below(s1);

            if writer.row_count() == 0 {
                // Every input row was deleted as of s1.
                writer.discard();
                return Ok(None);
            }
            let meta = writer.finish(s1)?;
            let tracker = DeltaTracker::new(dup.new_deltas().clone());
            let rowset = Arc::new(DiskRowSet::open_with_tracker(
                output_dir.clone(),
                &meta,
                self.block_cache.clone(),
                tracker,
            )?);
            Ok(Some((rowset, meta)))
        })();

        let output = match phase_result {
            Ok(output) => output,
            Err(e) => {
                warn!("flush/compaction failed before publish, rolling back: {}", e);
                self.swap_rowsets(&[dup_dyn], inputs.clone());
                let _ = std::fs::remove_dir_all(&output_dir);
                return Err(e);
            }
        };

        // ---- Swap the output in place of the duplicating rowset ----
        let to_add: Vec<Arc<dyn RowSet>> = output
            .iter()
            .map(|(rs, _)| rs.clone() as Arc<dyn RowSet>)
            .collect();
        self.swap_rowsets(std::slice::from_ref(&dup_dyn), to_add);
        hooks.post_swap_new_rowset()?;

        // ---- Point of no return: persist the membership change ----
        let removed_ids: Vec<u32> = inputs
            .iter()
            .filter_map(|rs| rs.as_disk().map(|d| d.rowset_id()))
            .collect();
        let removed_dirs: Vec<std::path::PathBuf> = inputs
            .iter()
            .filter_map(|rs| rs.as_disk().map(|d| d.dir().to_path_buf()))
            .collect();
        let add_metas: Vec<RowSetMetadata> = output.iter().map(|(_, m)| m.clone()).collect();
        if let Err(e) = self.metadata.update_on_disk_state(
            &removed_ids,
            add_metas,
            new_active_mrs_id.map(|id| id + 1),
        ) {
            error!("metadata update failed, failing tablet: {}", e);
            self.mark_failed();
            return Err(TabletError::corruption(format!(
                "tablet metadata update failed: {}",
                e
            )));
        }

        if let Some(mrs_id) = retired_mrs_id {
            self.anchor_registry.release_mrs(&self.tablet_id, mrs_id);
        }
        for dir in removed_dirs {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("failed to remove compacted rowset dir {:?}: {}", dir, e);
            }
        }
        info!(
            "{} complete: [{}] -> {}",
            if is_flush { "flush" } else { "compaction" },
            inputs.iter().map(|rs| rs.name()).join(","),
            output
                .as_ref()
                .map(|(rs, _)| rs.name())
                .unwrap_or_else(|| "nothing (all rows deleted)".into()),
        );
        Ok(())
    }

    /// Publish a components version with `to_remove` replaced by `to_add`
    /// in the rowset tree.
    fn swap_rowsets(&self, to_remove: &[Arc<dyn RowSet>], to_add: Vec<Arc<dyn RowSet>>) {
        let mut components = self.components.write();
        let replacement = TabletComponents::new(
            components.schema.clone(),
            components.memrowset.clone(),
            Arc::new(components.rowsets.replacing(to_remove, to_add)),
        );
        *components = replacement;
    }

    /// Flush the DeltaMemStore of the rowset with the biggest one.
    pub fn flush_biggest_dms(&self) -> TabletResult<()> {
        self.check_not_failed()?;
        let components = self.components.read().clone();
        let best = components
            .rowsets
            .iter()
            .filter(|rs| rs.as_disk().is_some() && rs.delta_stats().dms_size_bytes > 0)
            .max_by_key(|rs| rs.delta_stats().dms_size_bytes)
            .cloned();
        let Some(rowset) = best else {
            return Ok(());
        };
        let Some(_guard) = CompactFlushGuard::try_acquire(&rowset) else {
            // Under compaction, which will carry the deltas itself.
            return Ok(());
        };
        let disk = rowset.as_disk().expect("filtered to disk rowsets");
        if disk.delta_tracker().flush_dms(disk.dir())?.is_some() {
            self.metadata
                .update_rowset_deltas(disk.rowset_id(), disk.delta_tracker().delta_file_names())?;
            info!("flushed biggest DMS of {}", rowset.name());
        }
        Ok(())
    }

    /// Flush every non-empty DeltaMemStore, e.g. ahead of a schema alter.
    pub(crate) fn flush_every_dms(&self) -> TabletResult<()> {
        let components = self.components.read().clone();
        for rowset in components.rowsets.iter() {
            let Some(disk) = rowset.as_disk() else { continue };
            if disk.delta_tracker().dms_size_bytes() == 0 {
                continue;
            }
            let Some(_guard) = CompactFlushGuard::try_acquire(rowset) else {
                continue;
            };
            if disk.delta_tracker().flush_dms(disk.dir())?.is_some() {
                self.metadata.update_rowset_deltas(
                    disk.rowset_id(),
                    disk.delta_tracker().delta_file_names(),
                )?;
            }
        }
        Ok(())
    }

    /// Merge the delta files of the rowset with the most of them.
    pub fn minor_compact_worst_deltas(&self) -> TabletResult<()> {
        self.check_not_failed()?;
        let components = self.components.read().clone();
        let worst = components
            .rowsets
            .iter()
            .filter(|rs| rs.as_disk().is_some() && rs.delta_stats().num_delta_files >= 2)
            .max_by_key(|rs| rs.delta_stats().num_delta_files)
            .cloned();
        let Some(rowset) = worst else {
            return Ok(());
        };
        let Some(_guard) = CompactFlushGuard::try_acquire(&rowset) else {
            return Ok(());
        };
        let disk = rowset.as_disk().expect("filtered to disk rowsets");
        let before = disk.delta_tracker().delta_file_names();
        let Some(after) = disk.delta_tracker().minor_compact(disk.dir())? else {
            return Ok(());
        };
        self.metadata
            .update_rowset_deltas(disk.rowset_id(), after.clone())?;
        for name in before.iter().filter(|n| !after.contains(n)) {
            if let Err(e) = std::fs::remove_file(disk.dir().join(name)) {
                warn!("failed to remove merged delta file {}: {}", name, e);
            }
        }
        info!(
            "minor delta compaction on {}: {} -> {} files",
            rowset.name(),
            before.len(),
            after.len()
        );
        Ok(())
    }

    /// Rewrite the base data of `column_ids` in one disk rowset, folding
    /// its closed delta files into the base. The rowset's DeltaMemStore is
    /// flushed first under the compact/flush lock, so concurrent mutations
    /// keep landing in a live store the rewritten rowset shares; changes
    /// on other columns and deletes survive in a rewritten delta file.
    pub fn do_major_delta_compaction(
        &self,
        column_ids: &[ColumnId],
        rowset: Arc<dyn RowSet>,
    ) -> TabletResult<()> {
        self.check_not_failed()?;
        let schema = self.schema();
        let selected: HashSet<ColumnId> = column_ids.iter().copied().collect();
        for id in &selected {
            if schema.column_by_id(*id).is_none() {
                return Err(TabletError::InvalidColumn(*id).into());
            }
            if schema.key_columns().iter().any(|k| k.id() == *id) {
                return Err(TabletError::InvalidArgument(
                    "cannot major-compact a key column".into(),
                )
                .into());
            }
        }
        let Some(disk) = rowset.as_disk() else {
            return Err(TabletError::InvalidArgument(
                "major delta compaction requires a disk rowset".into(),
            )
            .into());
        };
        let Some(_guard) = CompactFlushGuard::try_acquire(&rowset) else {
            return Err(TabletError::ServiceUnavailable(
                "rowset is busy with another compaction".into(),
            )
            .into());
        };

        disk.delta_tracker().flush_dms(disk.dir())?;
        let closed = disk.delta_tracker().closed_file_entries();
        if closed.is_empty() {
            return Ok(());
        }

        // Split each change list into the folded part (selected columns)
        // and the retained part (other columns, deletes).
        let mut folded: BTreeMap<Vec<u8>, Vec<(Timestamp, ColumnId, crate::types::DataValue)>> =
            BTreeMap::new();
        let mut retained: BTreeMap<(Vec<u8>, Timestamp), RowChangeList> = BTreeMap::new();
        let mut max_folded_ts = disk.base_ts();
        for ((key, ts), changes) in closed {
            let mut keep = RowChangeList::new();
            for change in changes.changes() {
                match change {
                    RowChange::SetColumn { column_id, value }
                        if selected.contains(column_id) =>
                    {
                        folded
                            .entry(key.clone())
                            .or_default()
                            .push((ts, *column_id, value.clone()));
                        max_folded_ts = max_folded_ts.max(ts);
                    }
                    RowChange::SetColumn { column_id, value } => {
                        keep = keep.set_column(*column_id, value.clone());
                    }
                    RowChange::Delete => keep = keep.delete(),
                }
            }
            if !keep.is_empty() {
                retained.insert((key, ts), keep);
            }
        }
        if folded.is_empty() {
            return Ok(());
        }

        // Rewrite each selected column: base value with the folded
        // changes applied in timestamp order.
        let row_count = disk.row_count();
        let mut keys = Vec::with_capacity(row_count as usize);
        for ordinal in 0..row_count {
            keys.push(disk.key_at(ordinal)?);
        }
        let mut rewritten: Vec<ColumnId> = selected.iter().copied().collect();
        rewritten.sort_unstable();
        for column_id in &rewritten {
            let default = schema
                .column_by_id(*column_id)
                .expect("validated above")
                .desc()
                .default_value()
                .clone();
            let tmp_path = disk.dir().join(format!("{}.col.tmp", column_id));
            let mut cfile = CFileWriter::new(&tmp_path);
            for (ordinal, key) in keys.iter().enumerate() {
                let mut value = disk.base_value(*column_id, ordinal as u64, &default)?;
                if let Some(changes) = folded.get(key) {
                    for (_, change_col, change_value) in
                        changes.iter().sorted_by_key(|(ts, _, _)| *ts)
                    {
                        if change_col == column_id {
                            value = change_value.clone();
                        }
                    }
                }
                cfile.append(value);
            }
            cfile.finish()?;
            std::fs::rename(&tmp_path, disk.dir().join(format!("{}.col", column_id)))?;
        }

        let old_delta_files = disk.delta_tracker().delta_file_names();
        let mut new_files = Vec::new();
        if !retained.is_empty() {
            let name = format!("delta_{}.df", disk.delta_tracker().alloc_seq());
            new_files.push(Arc::new(DeltaFile::write(disk.dir(), &name, &retained)?));
        }

        let mut column_ids_after = disk.column_ids();
        for id in &rewritten {
            if !column_ids_after.contains(id) {
                column_ids_after.push(*id);
            }
        }
        column_ids_after.sort_unstable();
        let (min_key, max_key) = rowset.key_bounds().expect("disk rowsets are never empty");
        let new_meta = RowSetMetadata {
            // A fresh id keeps block cache keys distinct from the old base.
            id: self.metadata.gen_rowset_id(),
            dir_name: disk
                .dir()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            min_key,
            max_key,
            row_count,
            base_ts: max_folded_ts,
            column_ids: column_ids_after,
            delta_files: new_files.iter().map(|f| f.file_name().to_string()).collect(),
        };

        if let Err(e) = self.metadata.replace_rowset(disk.rowset_id(), new_meta.clone()) {
            error!("metadata update failed, failing tablet: {}", e);
            self.mark_failed();
            return Err(TabletError::corruption(format!(
                "tablet metadata update failed: {}",
                e
            )));
        }

        let tracker = DeltaTracker::with_files(
            new_files,
            disk.delta_tracker().current_dms(),
            disk.delta_tracker().next_seq(),
        );
        let new_rowset: Arc<dyn RowSet> = Arc::new(DiskRowSet::open_with_tracker(
            disk.dir().to_path_buf(),
            &new_meta,
            self.block_cache.clone(),
            tracker,
        )?);
        self.swap_rowsets(std::slice::from_ref(&rowset), vec![new_rowset]);

        let kept: HashSet<&String> = new_meta.delta_files.iter().collect();
        for name in old_delta_files.iter().filter(|n| !kept.contains(n)) {
            if let Err(e) = std::fs::remove_file(disk.dir().join(name)) {
                warn!("failed to remove folded delta file {}: {}", name, e);
            }
        }
        info!(
            "major delta compaction on {}: folded {} columns",
            rowset.name(),
            rewritten.len()
        );
        Ok(())
    }

    /// Cost/benefit stats for running a rowset-merge compaction now.
    pub fn update_compaction_stats(&self, stats: &mut MaintenanceOpStats) {
        let components = self.components.read().clone();
        let mut candidates = 0u64;
        let mut candidate_bytes = 0u64;
        for rowset in components.rowsets.iter() {
            if rowset.compact_flush_lock().is_held() {
                continue;
            }
            let size = rowset.estimate_on_disk_size();
            if size <= self.options.target_rowset_size {
                candidates += 1;
                candidate_bytes += size;
            }
        }
        stats.runnable = candidates >= 2;
        stats.io_performed = candidate_bytes;
        // Merging n rowsets into one reclaims roughly the per-rowset
        // overhead plus overwritten history.
        stats.disk_space_recovered = candidate_bytes / 2;
    }
}

// ---------------------------------------------------------------------
// Maintenance ops
// ---------------------------------------------------------------------

macro_rules! tablet_op {
    ($name:ident, $op_name:expr, $update:expr, $perform:expr) => {
        struct $name {
            tablet: Arc<Tablet>,
            tracker: TaskTracker,
        }

        impl $name {
            fn new(tablet: Arc<Tablet>) -> Arc<Self> {
                Arc::new(Self {
                    tablet,
                    tracker: TaskTracker::default(),
                })
            }
        }

        impl MaintenanceOp for $name {
            fn name(&self) -> String {
                format!("{}({})", $op_name, self.tablet.tablet_id())
            }
            fn update_stats(&self, stats: &mut MaintenanceOpStats) {
                let update: fn(&Tablet, &mut MaintenanceOpStats) = $update;
                update(&self.tablet, stats);
            }
            fn perform(&self) -> TabletResult<()> {
                let perform: fn(&Tablet) -> TabletResult<()> = $perform;
                self.tracker.run(|| perform(&self.tablet))
            }
            fn state(&self) -> TaskState {
                self.tracker.state()
            }
            fn start_timestamp(&self) -> Option<std::time::SystemTime> {
                self.tracker.start_timestamp()
            }
            fn completion_timestamp(&self) -> Option<std::time::SystemTime> {
                self.tracker.completion_timestamp()
            }
        }
    };
}

tablet_op!(
    FlushMrsOp,
    "FlushMRSOp",
    |tablet, stats| {
        let size = tablet.mem_row_set_size() as u64;
        stats.mem_bytes_recovered = size;
        stats.runnable = size > 0;
    },
    |tablet| tablet.flush()
);

tablet_op!(
    CompactRowSetsOp,
    "CompactRowSetsOp",
    |tablet, stats| tablet.update_compaction_stats(stats),
    |tablet| tablet.compact(CompactFlags::NoFlags)
);

tablet_op!(
    FlushBiggestDmsOp,
    "FlushBiggestDMSOp",
    |tablet, stats| {
        let size = tablet.delta_mem_stores_size() as u64;
        stats.mem_bytes_recovered = size;
        stats.runnable = size > 0;
    },
    |tablet| tablet.flush_biggest_dms()
);

tablet_op!(
    MinorCompactDeltasOp,
    "MinorDeltaCompactionOp",
    |tablet, stats| {
        let components = tablet.components.read().clone();
        let worst = components
            .rowsets
            .iter()
            .map(|rs| rs.delta_stats().num_delta_files)
            .max()
            .unwrap_or(0);
        stats.runnable = worst >= 2;
        stats.io_performed = worst as u64;
    },
    |tablet| tablet.minor_compact_worst_deltas()
);

pub(crate) fn tablet_maintenance_ops(tablet: &Arc<Tablet>) -> Vec<Arc<dyn MaintenanceOp>> {
    vec![
        FlushMrsOp::new(tablet.clone()),
        CompactRowSetsOp::new(tablet.clone()),
        FlushBiggestDmsOp::new(tablet.clone()),
        MinorCompactDeltasOp::new(tablet.clone()),
    ]
}
