// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! The tablet engine.
//!
//! A [`Tablet`] owns a disjoint range of primary keys. Writes go through a
//! two-phase prepare/apply protocol: prepare acquires the row lock and
//! builds a key probe, apply captures the current [`TabletComponents`] and
//! an MVCC timestamp together under the components read-lock, routes the
//! write to the store owning the key, then commits. Scans capture a
//! components reference and an MVCC snapshot and merge every store in key
//! order. Flush and compaction atomically substitute components versions;
//! see [`compaction`](self) for the three-phase swap protocol.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

// public modules and structures
mod clock;
mod error;
mod maintenance;
mod metadata;
mod mvcc;
mod row;

// internal modules and structures
mod bloom;
mod cfile;
mod compaction;
mod components;
mod delta;
mod duplicating;
mod encoding;
mod iterator;
mod key;
mod lock_manager;
mod mem_rowset;
mod mem_tracker;
mod rowset;
mod rowset_tree;

#[cfg(test)]
mod tests;

pub use self::bloom::BloomSizing;
pub use self::clock::{Clock, ClockRef, LogicalClock};
pub use self::compaction::{CompactFlags, FlushCompactHooks};
pub use self::error::{TabletError, TabletResult, TracedTabletError};
pub use self::maintenance::{
    MaintenanceManager, MaintenanceOp, MaintenanceOpStats, TaskState,
};
pub use self::metadata::{RowSetMetadata, TabletMetadata};
pub use self::mvcc::{MvccManager, MvccSnapshot, Timestamp};
pub use self::row::{Row, RowChange, RowChangeList};
pub use self::rowset::RowSet;

use self::cfile::{new_block_cache, BlockCache};
use self::compaction::NoopHooks;
use self::components::TabletComponents;
use self::iterator::{MergeIterator, RowSetIterator};
use self::key::RowSetKeyProbe;
use self::lock_manager::{LockManager, RowLock};
use self::mem_rowset::MemRowSet;
use self::mem_tracker::MemTracker;
use self::rowset::DiskRowSet;
use self::rowset_tree::RowSetTree;
use crate::catalog::{ColumnCatalog, Schema, SchemaRef};
use crate::types::ColumnId;

/// Anchors a write-ahead-log position while a MemRowSet holds unflushed
/// data; the anchor is released once a flush has published that data to
/// disk. The registry itself lives with the log implementation.
pub trait WalAnchorRegistry: Send + Sync {
    fn anchor_mrs(&self, tablet_id: &str, mrs_id: i64);
    fn release_mrs(&self, tablet_id: &str, mrs_id: i64);
}

pub struct NoopAnchorRegistry;

impl WalAnchorRegistry for NoopAnchorRegistry {
    fn anchor_mrs(&self, _tablet_id: &str, _mrs_id: i64) {}
    fn release_mrs(&self, _tablet_id: &str, _mrs_id: i64) {}
}

#[derive(Clone, Debug)]
pub struct TabletOptions {
    /// Memory budget shared by the MemRowSet and delta mem stores.
    pub mem_budget_bytes: usize,
    /// Block cache capacity, in blocks.
    pub block_cache_capacity: u64,
    /// Rowsets at or below this size are candidates for compaction.
    pub target_rowset_size: u64,
    pub bloom_sizing: BloomSizing,
}

impl Default for TabletOptions {
    fn default() -> Self {
        Self {
            mem_budget_bytes: 64 << 20,
            block_cache_capacity: 1024,
            target_rowset_size: 64 << 20,
            bloom_sizing: BloomSizing::default(),
        }
    }
}

/// Transaction state carried through a write: the timestamp and the
/// components reference captured together when the transaction started.
#[derive(Default)]
pub struct WriteTransactionState {
    timestamp: Option<Timestamp>,
    components: Option<Arc<TabletComponents>>,
}

impl WriteTransactionState {
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

enum WriteKind {
    Insert(Row),
    Mutate(RowChangeList),
}

/// A write that holds its row lock. Created before the MVCC transaction
/// starts and dropped after commit or abort, so locks bracket the
/// timestamp for their key.
pub struct PreparedRowWrite {
    kind: WriteKind,
    probe: RowSetKeyProbe,
    schema_version: u32,
    _lock: RowLock,
}

/// A validated schema alter, ready to apply.
pub struct PreparedAlterSchema {
    new_schema: Schema,
    base_version: u32,
}

pub struct Tablet {
    metadata: Arc<TabletMetadata>,
    tablet_id: String,
    mvcc: MvccManager,
    lock_manager: Arc<LockManager>,

    /// The current components. Writers take the read side while pairing a
    /// components reference with a fresh timestamp; flush/compact/alter
    /// take the write side to publish replacements. Hold the read side
    /// briefly: the lock prefers writers, so a long reader stalls every
    /// later reader behind a waiting compactor.
    components: RwLock<Arc<TabletComponents>>,

    /// At most one thread may run compaction input selection at a time.
    compact_select_lock: Mutex<()>,
    /// At most one MemRowSet flush in progress at a time.
    rowsets_flush_lock: Mutex<()>,

    mem_tracker: Arc<MemTracker>,
    block_cache: BlockCache,
    anchor_registry: Arc<dyn WalAnchorRegistry>,
    hooks: Mutex<Arc<dyn FlushCompactHooks>>,
    options: TabletOptions,
    next_mrs_id: AtomicI64,
    failed: AtomicBool,
    maintenance_ops: Mutex<Vec<Arc<dyn MaintenanceOp>>>,
}

impl Tablet {
    /// Open the tablet described by `metadata`, loading every rowset it
    /// lists and installing a fresh MemRowSet.
    pub fn open(
        metadata: Arc<TabletMetadata>,
        clock: ClockRef,
        anchor_registry: Arc<dyn WalAnchorRegistry>,
        options: TabletOptions,
    ) -> TabletResult<Arc<Tablet>> {
        let tablet_id = metadata.tablet_id();
        let schema: SchemaRef = Arc::new(metadata.schema());
        let block_cache = new_block_cache(options.block_cache_capacity);
        let mem_tracker = Arc::new(MemTracker::new(options.mem_budget_bytes));

        let mvcc = MvccManager::new(clock);
        let mut rowsets: Vec<Arc<dyn RowSet>> = Vec::new();
        for meta in metadata.rowsets() {
            let dir = metadata.rowset_dir(&meta);
            let rowset = Arc::new(DiskRowSet::open(dir, &meta, block_cache.clone())?);
            // Make the persisted timestamps of a previous incarnation
            // visible to fresh snapshots.
            let max_ts = rowset
                .delta_tracker()
                .max_timestamp()
                .map_or(meta.base_ts, |ts| ts.max(meta.base_ts));
            mvcc.observe_persisted(max_ts);
            rowsets.push(rowset);
        }

        let mrs_id = metadata.next_mrs_id();
        let memrowset = Arc::new(MemRowSet::new(mrs_id, schema.clone(), mem_tracker.clone()));
        anchor_registry.anchor_mrs(&tablet_id, mrs_id);

        let components = TabletComponents::new(
            schema,
            memrowset,
            Arc::new(RowSetTree::new(rowsets)),
        );
        info!(
            "opened tablet {} with {} rowsets, mrs {}",
            tablet_id,
            components.rowsets.len(),
            mrs_id
        );

        Ok(Arc::new(Tablet {
            metadata,
            tablet_id,
            mvcc,
            lock_manager: Arc::new(LockManager::default()),
            components: RwLock::new(components),
            compact_select_lock: Mutex::new(()),
            rowsets_flush_lock: Mutex::new(()),
            mem_tracker,
            block_cache,
            anchor_registry,
            hooks: Mutex::new(Arc::new(NoopHooks) as Arc<dyn FlushCompactHooks>),
            options,
            next_mrs_id: AtomicI64::new(mrs_id + 1),
            failed: AtomicBool::new(false),
            maintenance_ops: Mutex::new(Vec::new()),
        }))
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn metadata(&self) -> &Arc<TabletMetadata> {
        &self.metadata
    }

    pub fn mvcc_manager(&self) -> &MvccManager {
        &self.mvcc
    }

    /// The current schema, consistent with the rowsets it was read with.
    pub fn schema(&self) -> SchemaRef {
        self.components.read().schema.clone()
    }

    pub fn set_flush_compact_hooks(&self, hooks: Arc<dyn FlushCompactHooks>) {
        *self.hooks.lock() = hooks;
    }

    fn check_not_failed(&self) -> TabletResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(TabletError::Corruption(
                "tablet is in a failed state; writes are refused".into(),
            )
            .into());
        }
        Ok(())
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Start the write's MVCC transaction: capture the current components
    /// and a fresh timestamp together under the components read-lock.
    ///
    /// Call only after the relevant row lock is held (via
    /// `create_prepared_insert`/`create_prepared_mutate`). Taking the lock
    /// first makes per-key timestamps follow lock-acquisition order, so a
    /// row's mutation chain replays in increasing timestamp order. Pairing
    /// the components capture with the timestamp makes every writer
    /// accountable to any flush whose snapshot covers its timestamp.
    pub fn start_transaction(&self, state: &mut WriteTransactionState) {
        let components = self.components.read();
        state.components = Some(components.clone());
        state.timestamp = Some(self.mvcc.start_transaction());
    }

    /// Like [`Tablet::start_transaction`] but at a caller-supplied
    /// timestamp, for replay of ordered operations.
    pub fn start_transaction_at(
        &self,
        state: &mut WriteTransactionState,
        ts: Timestamp,
    ) -> TabletResult<()> {
        let components = self.components.read();
        state.components = Some(components.clone());
        state.timestamp = Some(self.mvcc.start_transaction_at(ts)?);
        Ok(())
    }

    /// Decode the row, acquire its row lock, and build the key probe.
    pub fn create_prepared_insert(&self, row: Row) -> TabletResult<PreparedRowWrite> {
        self.check_not_failed()?;
        let schema = self.schema();
        row.validate(&schema)?;
        let probe = RowSetKeyProbe::new(&schema, &row)?;
        let lock = self.lock_manager.lock_row(probe.encoded_key());
        Ok(PreparedRowWrite {
            kind: WriteKind::Insert(row),
            probe,
            schema_version: schema.version(),
            _lock: lock,
        })
    }

    /// Validate the change list, acquire the row lock for `key_row`'s key,
    /// and build the key probe. `key_row` needs only the key columns.
    pub fn create_prepared_mutate(
        &self,
        key_row: &Row,
        changes: RowChangeList,
    ) -> TabletResult<PreparedRowWrite> {
        self.check_not_failed()?;
        let schema = self.schema();
        changes.validate(&schema)?;
        let probe = RowSetKeyProbe::new(&schema, key_row)?;
        let lock = self.lock_manager.lock_row(probe.encoded_key());
        Ok(PreparedRowWrite {
            kind: WriteKind::Mutate(changes),
            probe,
            schema_version: schema.version(),
            _lock: lock,
        })
    }

    fn tx_parts<'a>(
        &self,
        state: &'a WriteTransactionState,
        prepared: &PreparedRowWrite,
    ) -> TabletResult<(Timestamp, &'a Arc<TabletComponents>)> {
        let components = state.components.as_ref().ok_or_else(|| {
            TracedTabletError::from(TabletError::InvalidArgument(
                "transaction not started".into(),
            ))
        })?;
        let ts = state.timestamp.ok_or_else(|| {
            TracedTabletError::from(TabletError::InvalidArgument(
                "transaction not started".into(),
            ))
        })?;
        if components.schema.version() != prepared.schema_version {
            return Err(TabletError::Aborted(
                "schema changed between prepare and apply".into(),
            )
            .into());
        }
        Ok((ts, components))
    }

    /// Apply a prepared insert under an already started transaction. The
    /// key must be absent from every store; on success the row lands in
    /// the active MemRowSet under the transaction's timestamp.
    pub fn insert_unlocked(
        &self,
        state: &WriteTransactionState,
        prepared: &PreparedRowWrite,
    ) -> TabletResult<()> {
        self.check_not_failed()?;
        let (ts, components) = self.tx_parts(state, prepared)?;
        let row = match &prepared.kind {
            WriteKind::Insert(row) => row,
            WriteKind::Mutate(_) => {
                return Err(TabletError::InvalidArgument(
                    "prepared write is not an insert".into(),
                )
                .into())
            }
        };
        let key = prepared.probe.encoded_key();
        for rowset in components.rowsets.find_rowsets_with_key(key) {
            if rowset.check_row_present(&prepared.probe)? {
                return Err(TabletError::already_present(format!("{:02x?}", key)));
            }
        }
        components.memrowset.insert(ts, key, row.clone())
    }

    /// Apply a prepared mutation under an already started transaction. The
    /// mutation is appended to the delta store of the unique rowset that
    /// contains the key.
    pub fn mutate_unlocked(
        &self,
        state: &WriteTransactionState,
        prepared: &PreparedRowWrite,
    ) -> TabletResult<()> {
        self.check_not_failed()?;
        let (ts, components) = self.tx_parts(state, prepared)?;
        let changes = match &prepared.kind {
            WriteKind::Mutate(changes) => changes,
            WriteKind::Insert(_) => {
                return Err(TabletError::InvalidArgument(
                    "prepared write is not a mutation".into(),
                )
                .into())
            }
        };
        if components.memrowset.check_row_present(&prepared.probe)? {
            return components
                .memrowset
                .mutate_row(ts, &prepared.probe, changes);
        }
        for rowset in components
            .rowsets
            .find_rowsets_with_key(prepared.probe.encoded_key())
        {
            if rowset.check_row_present(&prepared.probe)? {
                return rowset.mutate_row(ts, &prepared.probe, changes);
            }
        }
        Err(TabletError::not_found(
            "row",
            format!("{:02x?}", prepared.probe.encoded_key()),
        ))
    }

    pub fn commit_write(&self, state: &mut WriteTransactionState) {
        if let Some(ts) = state.timestamp.take() {
            self.mvcc.commit(ts);
        }
        state.components = None;
    }

    /// Abort a transaction whose write was never applied. An abort leaves
    /// no trace, so it is only valid before `insert_unlocked` or
    /// `mutate_unlocked` has succeeded.
    pub fn abort_write(&self, state: &mut WriteTransactionState) {
        if let Some(ts) = state.timestamp.take() {
            self.mvcc.abort(ts);
        }
        state.components = None;
    }

    /// Prepare, apply, and commit a single-row insert.
    pub fn insert(&self, row: Row) -> TabletResult<Timestamp> {
        let prepared = self.create_prepared_insert(row)?;
        self.apply_prepared(prepared)
    }

    /// Prepare, apply, and commit a single-row mutation.
    pub fn mutate(&self, key_row: &Row, changes: RowChangeList) -> TabletResult<Timestamp> {
        let prepared = self.create_prepared_mutate(key_row, changes)?;
        self.apply_prepared(prepared)
    }

    fn apply_prepared(&self, prepared: PreparedRowWrite) -> TabletResult<Timestamp> {
        let mut state = WriteTransactionState::default();
        self.start_transaction(&mut state);
        let ts = state.timestamp.expect("transaction just started");
        let result = match prepared.kind {
            WriteKind::Insert(_) => self.insert_unlocked(&state, &prepared),
            WriteKind::Mutate(_) => self.mutate_unlocked(&state, &prepared),
        };
        match result {
            Ok(()) => {
                self.commit_write(&mut state);
                Ok(ts)
            }
            Err(e) => {
                self.abort_write(&mut state);
                Err(e)
            }
        }
        // The prepared write, and with it the row lock, drops here: locks
        // are held from before timestamp assignment until after
        // commit/abort.
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Open a key-ordered iterator over `column_ids`, at `snapshot` or the
    /// current MVCC state. The iterator keeps the captured components
    /// alive for its whole lifetime.
    pub fn new_row_iterator(
        &self,
        column_ids: &[ColumnId],
        snapshot: Option<MvccSnapshot>,
    ) -> TabletResult<TabletIterator> {
        let components = self.components.read().clone();
        let snapshot = snapshot.unwrap_or_else(|| self.mvcc.take_snapshot());
        let projection = components.schema.project(column_ids)?;

        let mut children: Vec<Box<dyn RowSetIterator>> =
            Vec::with_capacity(1 + components.rowsets.len());
        children.push(
            components
                .memrowset
                .clone()
                .new_iterator(&projection, &snapshot)?,
        );
        for rowset in components.rowsets.iter() {
            children.push(rowset.clone().new_iterator(&projection, &snapshot)?);
        }
        Ok(TabletIterator {
            merge: MergeIterator::new(children)?,
            snapshot,
            _components: components,
        })
    }

    /// Count rows whose latest visible mutation is not a delete, under a
    /// snapshot covering all committed writes.
    pub fn count_rows(&self) -> TabletResult<u64> {
        let schema = self.schema();
        let key_ids: Vec<ColumnId> = schema.key_columns().iter().map(|c| c.id()).collect();
        let mut iter = self.new_row_iterator(&key_ids, None)?;
        let mut count = 0;
        while iter.next_row()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn mem_row_set_size(&self) -> usize {
        self.components.read().memrowset.size_bytes()
    }

    pub fn delta_mem_stores_size(&self) -> usize {
        let components = self.components.read().clone();
        components
            .rowsets
            .iter()
            .map(|rs| rs.delta_stats().dms_size_bytes)
            .sum()
    }

    pub fn estimate_on_disk_size(&self) -> u64 {
        let components = self.components.read().clone();
        components
            .rowsets
            .iter()
            .map(|rs| rs.estimate_on_disk_size())
            .sum()
    }

    pub fn num_rowsets(&self) -> usize {
        self.components.read().rowsets.len()
    }

    pub fn current_mrs_id(&self) -> i64 {
        self.components.read().memrowset.mrs_id()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Dump every row and rowset to log lines. Only useful on tablets
    /// small enough to eyeball.
    pub fn debug_dump(&self) -> Vec<String> {
        let components = self.components.read().clone();
        let mut lines = Vec::new();
        components.memrowset.debug_dump(&mut lines);
        for rowset in components.rowsets.iter() {
            rowset.debug_dump(&mut lines);
        }
        for line in &lines {
            info!("{}", line);
        }
        lines
    }

    // ------------------------------------------------------------------
    // Schema alter
    // ------------------------------------------------------------------

    /// Validate the target column set against the current schema. The key
    /// prefix must be unchanged.
    pub fn create_prepared_alter_schema(
        &self,
        columns: Vec<ColumnCatalog>,
    ) -> TabletResult<PreparedAlterSchema> {
        self.check_not_failed()?;
        let current = self.schema();
        let new_schema = current.build_successor(columns)?;
        Ok(PreparedAlterSchema {
            new_schema,
            base_version: current.version(),
        })
    }

    /// Apply a prepared alter: flush the MemRowSet and every DeltaMemStore,
    /// then swap the schema pointer into a fresh components version under
    /// the write-lock. Concurrent writes are quiesced by that lock, and
    /// writes prepared against the old schema fail with `Aborted` at
    /// apply. Intentionally coarse.
    pub fn alter_schema(&self, prepared: PreparedAlterSchema) -> TabletResult<()> {
        self.check_not_failed()?;
        let _flush_guard = self.rowsets_flush_lock.lock();
        if self.schema().version() != prepared.base_version {
            return Err(TabletError::Aborted(
                "lost a race to a concurrent schema alter".into(),
            )
            .into());
        }

        self.flush_every_dms()?;

        // Writers may sneak rows into the MemRowSet between a flush and
        // the components write-lock; retry a bounded number of times.
        let mut new_mrs_id = None;
        for _ in 0..3 {
            self.flush_unlocked()?;
            let mut components = self.components.write();
            if !components.memrowset.is_empty() {
                continue;
            }
            let schema: SchemaRef = Arc::new(prepared.new_schema.clone());
            let mrs_id = self.next_mrs_id.fetch_add(1, Ordering::SeqCst);
            let old_mrs_id = components.memrowset.mrs_id();
            let memrowset = Arc::new(MemRowSet::new(
                mrs_id,
                schema.clone(),
                self.mem_tracker.clone(),
            ));
            let replacement =
                TabletComponents::new(schema, memrowset, components.rowsets.clone());
            *components = replacement;
            drop(components);
            self.anchor_registry.anchor_mrs(&self.tablet_id, mrs_id);
            // The displaced MemRowSet was empty; nothing anchored it.
            self.anchor_registry.release_mrs(&self.tablet_id, old_mrs_id);
            new_mrs_id = Some(mrs_id);
            break;
        }
        let new_mrs_id = new_mrs_id.ok_or_else(|| {
            TracedTabletError::from(TabletError::ServiceUnavailable(
                "concurrent writes kept the MemRowSet non-empty".into(),
            ))
        })?;

        self.metadata.set_schema(prepared.new_schema)?;
        self.metadata
            .update_on_disk_state(&[], Vec::new(), Some(new_mrs_id + 1))?;
        info!(
            "tablet {}: altered schema to version {}",
            self.tablet_id,
            self.schema().version()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance registration
    // ------------------------------------------------------------------

    pub fn register_maintenance_ops(self: &Arc<Self>, manager: &MaintenanceManager) {
        let ops = compaction::tablet_maintenance_ops(self);
        for op in &ops {
            manager.register_op(op.clone());
        }
        self.maintenance_ops.lock().extend(ops);
    }

    pub fn unregister_maintenance_ops(&self, manager: &MaintenanceManager) {
        let ops = std::mem::take(&mut *self.maintenance_ops.lock());
        manager.unregister_ops(&ops);
    }
}

/// Snapshot-filtered, key-ordered scan over the whole tablet.
pub struct TabletIterator {
    merge: MergeIterator,
    snapshot: MvccSnapshot,
    /// Keeps the captured stores alive while the scan runs.
    _components: Arc<TabletComponents>,
}

impl TabletIterator {
    pub fn next_row(&mut self) -> TabletResult<Option<(Vec<u8>, Row)>> {
        self.merge.next_row()
    }

    pub fn snapshot(&self) -> &MvccSnapshot {
        &self.snapshot
    }

    /// Drain the iterator, returning rows in key order.
    pub fn collect_rows(&mut self) -> TabletResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some((_, row)) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }
}
