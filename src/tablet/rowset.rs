// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! The rowset interface and its on-disk implementation.
//!
//! A [`DiskRowSet`] is immutable base data (one CFile per column, written
//! in key order) plus a [`DeltaTracker`] absorbing later mutations. Every
//! rowset carries a key range and a bloom filter so that point probes can
//! skip it cheaply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::bloom::{BloomFileReader, BloomFilterBuilder, BloomSizing};
use super::cfile::{BlockCache, CFileReader, CFileWriter};
use super::delta::DeltaTracker;
use super::error::{TabletError, TabletResult};
use super::iterator::RowSetIterator;
use super::key::RowSetKeyProbe;
use super::metadata::RowSetMetadata;
use super::mvcc::{MvccSnapshot, Timestamp};
use super::row::{Row, RowChangeList};
use crate::catalog::Projection;
use crate::types::{ColumnId, DataValue};

/// Advisory per-rowset lock preventing concurrent selection by more than
/// one flush/compaction. Writers never take it.
#[derive(Default)]
pub struct CompactFlushLock {
    held: AtomicBool,
}

impl CompactFlushLock {
    pub fn new_held() -> Self {
        Self {
            held: AtomicBool::new(true),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// RAII release of a rowset's compact/flush lock.
pub struct CompactFlushGuard {
    rowset: Arc<dyn RowSet>,
}

impl CompactFlushGuard {
    pub fn try_acquire(rowset: &Arc<dyn RowSet>) -> Option<Self> {
        rowset.compact_flush_lock().try_acquire().then(|| Self {
            rowset: rowset.clone(),
        })
    }
}

impl Drop for CompactFlushGuard {
    fn drop(&mut self) {
        self.rowset.compact_flush_lock().release();
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaStats {
    pub dms_size_bytes: usize,
    pub num_delta_files: usize,
}

/// Common interface over the stores a key can live in: a disk rowset, the
/// frozen MemRowSet being flushed, or a DuplicatingRowSet standing in for
/// inputs of an in-progress compaction.
pub trait RowSet: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> String;

    /// Whether this rowset holds an entry for the key, live or deleted.
    fn check_row_present(&self, probe: &RowSetKeyProbe) -> TabletResult<bool>;

    /// Append a mutation for an existing row. `NotFound` if the key is
    /// absent or its row is delete-marked.
    fn mutate_row(
        &self,
        ts: Timestamp,
        probe: &RowSetKeyProbe,
        changes: &RowChangeList,
    ) -> TabletResult<()>;

    fn new_iterator(
        self: Arc<Self>,
        projection: &Projection,
        snap: &MvccSnapshot,
    ) -> TabletResult<Box<dyn RowSetIterator>>;

    /// Number of base entries, including delete-marked ones.
    fn entry_count(&self) -> u64;

    fn estimate_on_disk_size(&self) -> u64;

    /// `(min, max)` encoded-key bounds, or `None` when empty.
    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)>;

    fn delta_stats(&self) -> DeltaStats;

    /// Mutations with timestamps in `(after, upto]`, for missed-delta
    /// re-application during flush/compaction.
    fn collect_missed_deltas(
        &self,
        after: Timestamp,
        upto: Timestamp,
    ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)>;

    fn compact_flush_lock(&self) -> &CompactFlushLock;

    /// Downcast for operations restricted to on-disk rowsets.
    fn as_disk(&self) -> Option<&DiskRowSet> {
        None
    }

    fn debug_dump(&self, lines: &mut Vec<String>);
}

pub const KEY_FILE_NAME: &str = "key.col";

fn column_file_name(column_id: ColumnId) -> String {
    format!("{}.col", column_id)
}

/// Immutable on-disk rowset.
pub struct DiskRowSet {
    rowset_id: u32,
    dir: PathBuf,
    key_file: CFileReader,
    columns: HashMap<ColumnId, CFileReader>,
    bloom: BloomFileReader,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    row_count: u64,
    base_ts: Timestamp,
    on_disk_size: u64,
    delta_tracker: DeltaTracker,
    compact_flush_lock: CompactFlushLock,
}

impl DiskRowSet {
    pub fn open(
        dir: PathBuf,
        meta: &RowSetMetadata,
        cache: BlockCache,
    ) -> TabletResult<DiskRowSet> {
        let key_file = CFileReader::open(
            dir.join(KEY_FILE_NAME),
            cache.clone(),
            meta.id,
            ColumnId::MAX,
        )?;
        let mut columns = HashMap::with_capacity(meta.column_ids.len());
        for column_id in &meta.column_ids {
            columns.insert(
                *column_id,
                CFileReader::open(
                    dir.join(column_file_name(*column_id)),
                    cache.clone(),
                    meta.id,
                    *column_id,
                )?,
            );
        }
        let bloom = BloomFileReader::open(&dir)?;
        let delta_tracker = DeltaTracker::open(&dir, &meta.delta_files)?;
        let on_disk_size = dir_size(&dir)?;
        Ok(DiskRowSet {
            rowset_id: meta.id,
            key_file,
            columns,
            bloom,
            min_key: meta.min_key.clone(),
            max_key: meta.max_key.clone(),
            row_count: meta.row_count,
            base_ts: meta.base_ts,
            on_disk_size,
            delta_tracker,
            compact_flush_lock: CompactFlushLock::default(),
            dir,
        })
    }

    /// Open a just-written rowset with a caller-built delta tracker, e.g.
    /// one seeded with the mutations a compaction routed to the output
    /// while it was written.
    pub fn open_with_tracker(
        dir: PathBuf,
        meta: &RowSetMetadata,
        cache: BlockCache,
        tracker: DeltaTracker,
    ) -> TabletResult<DiskRowSet> {
        let mut rowset = Self::open(dir, meta, cache)?;
        rowset.delta_tracker = tracker;
        Ok(rowset)
    }

    pub fn rowset_id(&self) -> u32 {
        self.rowset_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_ts(&self) -> Timestamp {
        self.base_ts
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn delta_tracker(&self) -> &DeltaTracker {
        &self.delta_tracker
    }

    /// Binary search the key column for an encoded key.
    pub fn find_ordinal(&self, encoded_key: &[u8]) -> TabletResult<Option<u64>> {
        let mut lo = 0u64;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let probe = self.key_at(mid)?;
            match probe.as_slice().cmp(encoded_key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(mid)),
            }
        }
        Ok(None)
    }

    pub(crate) fn column_ids(&self) -> Vec<ColumnId> {
        let mut ids: Vec<ColumnId> = self.columns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Base value of one column at `ordinal`, or `default` for columns
    /// this rowset predates.
    pub(crate) fn base_value(
        &self,
        column_id: ColumnId,
        ordinal: u64,
        default: &DataValue,
    ) -> TabletResult<DataValue> {
        match self.columns.get(&column_id) {
            Some(reader) => reader.value_at(ordinal),
            None => Ok(default.clone()),
        }
    }

    pub(crate) fn key_at(&self, ordinal: u64) -> TabletResult<Vec<u8>> {
        match self.key_file.value_at(ordinal)? {
            DataValue::Blob(key) => Ok(key),
            other => Err(TabletError::corruption(format!(
                "key column holds non-blob value {}",
                other
            ))),
        }
    }

    /// Materialize the row at `ordinal` under `projection`, or `None` if it
    /// is deleted as of `snap`.
    fn materialize_row(
        &self,
        ordinal: u64,
        encoded_key: &[u8],
        projection: &Projection,
        snap: &MvccSnapshot,
    ) -> TabletResult<Option<Row>> {
        let mut values = Vec::with_capacity(projection.num_columns());
        for col in projection.columns() {
            match self.columns.get(&col.id()) {
                Some(reader) => values.push(reader.value_at(ordinal)?),
                // Columns added after this rowset was written read back as
                // their declared default.
                None => values.push(col.desc().default_value().clone()),
            }
        }
        let mut row = Row::new(values);
        for (_, changes) in self.delta_tracker.deltas_for_key(encoded_key, snap) {
            if !changes.apply_to_projected(projection, &mut row) {
                return Ok(None);
            }
        }
        Ok(Some(row))
    }
}

fn dir_size(dir: &Path) -> TabletResult<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        total += entry?.metadata()?.len();
    }
    Ok(total)
}

impl RowSet for DiskRowSet {
    fn name(&self) -> String {
        format!("RS({})", self.rowset_id)
    }

    fn check_row_present(&self, probe: &RowSetKeyProbe) -> TabletResult<bool> {
        let key = probe.encoded_key();
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(false);
        }
        if !self.bloom.may_contain(probe) {
            return Ok(false);
        }
        Ok(self.find_ordinal(key)?.is_some())
    }

    fn mutate_row(
        &self,
        ts: Timestamp,
        probe: &RowSetKeyProbe,
        changes: &RowChangeList,
    ) -> TabletResult<()> {
        let key = probe.encoded_key();
        if self.find_ordinal(key)?.is_none() || self.delta_tracker.key_is_deleted(key) {
            return Err(TabletError::not_found("row", format!("{:02x?}", key)));
        }
        self.delta_tracker.append(key, ts, changes);
        Ok(())
    }

    fn new_iterator(
        self: Arc<Self>,
        projection: &Projection,
        snap: &MvccSnapshot,
    ) -> TabletResult<Box<dyn RowSetIterator>> {
        Ok(Box::new(DiskRowSetIterator {
            rowset: self,
            projection: projection.clone(),
            snap: snap.clone(),
            ordinal: 0,
        }))
    }

    fn entry_count(&self) -> u64 {
        self.row_count
    }

    fn estimate_on_disk_size(&self) -> u64 {
        self.on_disk_size
    }

    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        Some((self.min_key.clone(), self.max_key.clone()))
    }

    fn delta_stats(&self) -> DeltaStats {
        DeltaStats {
            dms_size_bytes: self.delta_tracker.dms_size_bytes(),
            num_delta_files: self.delta_tracker.num_delta_files(),
        }
    }

    fn collect_missed_deltas(
        &self,
        after: Timestamp,
        upto: Timestamp,
    ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)> {
        self.delta_tracker.collect_range(after, upto)
    }

    fn compact_flush_lock(&self) -> &CompactFlushLock {
        &self.compact_flush_lock
    }

    fn as_disk(&self) -> Option<&DiskRowSet> {
        Some(self)
    }

    fn debug_dump(&self, lines: &mut Vec<String>) {
        lines.push(format!(
            "{}: {} rows, base_ts={}, {} delta files, dms {} bytes",
            self.name(),
            self.row_count,
            self.base_ts,
            self.delta_tracker.num_delta_files(),
            self.delta_tracker.dms_size_bytes(),
        ));
    }
}

struct DiskRowSetIterator {
    rowset: Arc<DiskRowSet>,
    projection: Projection,
    snap: MvccSnapshot,
    ordinal: u64,
}

impl RowSetIterator for DiskRowSetIterator {
    fn next_row(&mut self) -> TabletResult<Option<(Vec<u8>, Row)>> {
        while self.ordinal < self.rowset.row_count {
            let ordinal = self.ordinal;
            self.ordinal += 1;
            let key = self.rowset.key_at(ordinal)?;
            if let Some(row) =
                self.rowset
                    .materialize_row(ordinal, &key, &self.projection, &self.snap)?
            {
                return Ok(Some((key, row)));
            }
        }
        Ok(None)
    }
}

/// Streams key-ordered rows into a new rowset directory: one CFile per
/// column, the key CFile, and the bloom file.
pub struct DiskRowSetWriter {
    rowset_id: u32,
    dir: PathBuf,
    column_ids: Vec<ColumnId>,
    key_writer: CFileWriter,
    column_writers: Vec<CFileWriter>,
    bloom: BloomFilterBuilder,
    row_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
}

impl DiskRowSetWriter {
    pub fn create(
        rowset_id: u32,
        dir: PathBuf,
        column_ids: Vec<ColumnId>,
        expected_keys: usize,
        sizing: BloomSizing,
    ) -> TabletResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let key_writer = CFileWriter::new(dir.join(KEY_FILE_NAME));
        let column_writers = column_ids
            .iter()
            .map(|id| CFileWriter::new(dir.join(column_file_name(*id))))
            .collect();
        Ok(Self {
            rowset_id,
            column_ids,
            key_writer,
            column_writers,
            bloom: BloomFilterBuilder::with_sizing(expected_keys, sizing),
            row_count: 0,
            min_key: None,
            max_key: None,
            dir,
        })
    }

    /// Append one row. Rows must arrive in strictly increasing key order
    /// and positionally match the writer's column list.
    pub fn append(&mut self, encoded_key: &[u8], row: &Row) -> TabletResult<()> {
        debug_assert!(self
            .max_key
            .as_ref()
            .is_none_or(|max| max.as_slice() < encoded_key));
        self.key_writer.append(DataValue::Blob(encoded_key.to_vec()));
        for (writer, value) in self.column_writers.iter_mut().zip(row.values()) {
            writer.append(value.clone());
        }
        self.bloom
            .insert(&RowSetKeyProbe::from_encoded(encoded_key.to_vec()));
        if self.min_key.is_none() {
            self.min_key = Some(encoded_key.to_vec());
        }
        self.max_key = Some(encoded_key.to_vec());
        self.row_count += 1;
        Ok(())
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Finish all files and return the metadata entry describing them.
    /// Panics if no rows were appended; callers discard empty outputs.
    pub fn finish(self, base_ts: Timestamp) -> TabletResult<RowSetMetadata> {
        assert!(self.row_count > 0, "empty rowset");
        self.key_writer.finish()?;
        for writer in self.column_writers {
            writer.finish()?;
        }
        self.bloom.write(&self.dir)?;
        sync_dir(&self.dir)?;
        let dir_name = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(RowSetMetadata {
            id: self.rowset_id,
            dir_name,
            min_key: self.min_key.unwrap(),
            max_key: self.max_key.unwrap(),
            row_count: self.row_count,
            base_ts,
            column_ids: self.column_ids,
            delta_files: Vec::new(),
        })
    }

    /// Drop a partially written output.
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!("failed to remove abandoned rowset dir {:?}: {}", self.dir, e);
        }
    }
}

fn sync_dir(dir: &Path) -> TabletResult<()> {
    std::fs::File::open(dir)?.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::cfile::new_block_cache;

    fn write_rowset(dir: PathBuf) -> RowSetMetadata {
        let mut writer =
            DiskRowSetWriter::create(7, dir, vec![0, 1], 3, BloomSizing::default()).unwrap();
        for (key, v) in [(b"a", 1), (b"b", 2), (b"c", 3)] {
            let row = Row::new(vec![
                DataValue::String(String::from_utf8_lossy(key).into_owned()),
                DataValue::Int32(v),
            ]);
            writer.append(key.as_slice(), &row).unwrap();
        }
        writer.finish(Timestamp::new(5)).unwrap()
    }

    fn full_projection() -> Projection {
        use crate::catalog::{ColumnCatalog, ColumnDesc, Schema};
        use crate::types::DataType;
        Schema::new(
            vec![
                ColumnCatalog::new(0, "key", ColumnDesc::new(DataType::String, false)),
                ColumnCatalog::new(1, "val", ColumnDesc::new(DataType::Int32, true)),
            ],
            1,
        )
        .unwrap()
        .full_projection()
    }

    #[test]
    fn test_disk_rowset_probe_and_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rs_7");
        let meta = write_rowset(dir.clone());
        assert_eq!(meta.min_key, b"a".to_vec());
        assert_eq!(meta.max_key, b"c".to_vec());

        let rowset = Arc::new(DiskRowSet::open(dir, &meta, new_block_cache(64)).unwrap());
        assert!(rowset
            .check_row_present(&RowSetKeyProbe::from_encoded(b"b".to_vec()))
            .unwrap());
        assert!(!rowset
            .check_row_present(&RowSetKeyProbe::from_encoded(b"bb".to_vec()))
            .unwrap());
        assert!(!rowset
            .check_row_present(&RowSetKeyProbe::from_encoded(b"z".to_vec()))
            .unwrap());

        let snap = MvccSnapshot::at(Timestamp::new(100));
        let mut iter = rowset.new_iterator(&full_projection(), &snap).unwrap();
        let mut rows = vec![];
        while let Some((key, row)) = iter.next_row().unwrap() {
            rows.push((key, row));
        }
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, b"a".to_vec());
        assert_eq!(rows[2].1.values()[1], DataValue::Int32(3));
    }

    #[test]
    fn test_disk_rowset_mutation_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("rs_7");
        let meta = write_rowset(dir.clone());
        let rowset = Arc::new(DiskRowSet::open(dir, &meta, new_block_cache(64)).unwrap());

        let probe = RowSetKeyProbe::from_encoded(b"b".to_vec());
        rowset
            .mutate_row(
                Timestamp::new(6),
                &probe,
                &RowChangeList::new().set_column(1, DataValue::Int32(20)),
            )
            .unwrap();
        rowset
            .mutate_row(
                Timestamp::new(7),
                &probe,
                &RowChangeList::new().delete(),
            )
            .unwrap();
        // Mutating a delete-marked row fails.
        assert!(rowset
            .mutate_row(
                Timestamp::new(8),
                &probe,
                &RowChangeList::new().set_column(1, DataValue::Int32(30)),
            )
            .is_err());

        // At ts 6 the update is visible, at ts 7 the row is gone.
        let projection = full_projection();
        let mut iter = rowset
            .clone()
            .new_iterator(&projection, &MvccSnapshot::at(Timestamp::new(6)))
            .unwrap();
        let mut values = vec![];
        while let Some((_, row)) = iter.next_row().unwrap() {
            values.push(row.values()[1].clone());
        }
        assert_eq!(
            values,
            vec![
                DataValue::Int32(1),
                DataValue::Int32(20),
                DataValue::Int32(3)
            ]
        );

        let mut iter = rowset
            .new_iterator(&projection, &MvccSnapshot::at(Timestamp::new(7)))
            .unwrap();
        let mut keys = vec![];
        while let Some((key, _)) = iter.next_row().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }
}
