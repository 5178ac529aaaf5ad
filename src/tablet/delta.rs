// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Delta storage for disk rowsets.
//!
//! Every disk rowset owns a [`DeltaTracker`]: an ordered list of closed
//! on-disk delta files plus one mutable [`DeltaMemStore`]. Mutations are
//! addressed by `(encoded key, timestamp)`, which makes re-application
//! idempotent; the flush/compact driver relies on this when it routes the
//! same mutation through more than one path.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::RwLock;
use tracing::debug;

use super::encoding::{decode_change_list, decode_slice, encode_change_list, encode_slice};
use super::error::{TabletError, TabletResult};
use super::mvcc::{MvccSnapshot, Timestamp};
use super::row::RowChangeList;

pub type DeltaKey = (Vec<u8>, Timestamp);

/// In-memory delta buffer belonging to one rowset.
#[derive(Default)]
pub struct DeltaMemStore {
    state: RwLock<BTreeMap<DeltaKey, RowChangeList>>,
    size: AtomicUsize,
}

impl DeltaMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation. Upserting the same `(key, timestamp)` twice is a
    /// no-op as the content is identical; both routing paths of a
    /// compaction may deliver the same mutation.
    pub fn upsert(&self, encoded_key: &[u8], ts: Timestamp, changes: &RowChangeList) {
        let mut state = self.state.write();
        if state
            .insert((encoded_key.to_vec(), ts), changes.clone())
            .is_none()
        {
            self.size.fetch_add(
                encoded_key.len() + changes.size_bytes(),
                Ordering::Relaxed,
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.state.read().len()
    }

    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Mutations for one key visible under `snap`, in timestamp order.
    pub fn collect_for_key(
        &self,
        encoded_key: &[u8],
        snap: &MvccSnapshot,
    ) -> Vec<(Timestamp, RowChangeList)> {
        self.state
            .read()
            .range(key_range(encoded_key))
            .filter(|((_, ts), _)| snap.is_visible(*ts))
            .map(|((_, ts), changes)| (*ts, changes.clone()))
            .collect()
    }

    /// Whether any delta for this key is a delete.
    pub fn key_is_deleted(&self, encoded_key: &[u8]) -> bool {
        self.state
            .read()
            .range(key_range(encoded_key))
            .any(|(_, changes)| changes.is_delete())
    }

    /// All mutations with timestamps in `(after, upto]`.
    pub fn collect_range(
        &self,
        after: Timestamp,
        upto: Timestamp,
    ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)> {
        self.state
            .read()
            .iter()
            .filter(|((_, ts), _)| *ts > after && *ts <= upto)
            .map(|((key, ts), changes)| (key.clone(), *ts, changes.clone()))
            .collect()
    }

    /// Drop every entry with timestamp at or below `ts`. Used when a
    /// compaction output adopts this store: entries at or below the base
    /// timestamp are already materialized in the base data.
    pub fn prune_at_or_below(&self, ts: Timestamp) {
        let mut state = self.state.write();
        let mut reclaimed = 0;
        state.retain(|(key, entry_ts), changes| {
            let keep = *entry_ts > ts;
            if !keep {
                reclaimed += key.len() + changes.size_bytes();
            }
            keep
        });
        self.size.fetch_sub(reclaimed, Ordering::Relaxed);
    }

    fn snapshot_entries(&self) -> BTreeMap<DeltaKey, RowChangeList> {
        self.state.read().clone()
    }
}

fn key_range(encoded_key: &[u8]) -> (Bound<DeltaKey>, Bound<DeltaKey>) {
    (
        Bound::Included((encoded_key.to_vec(), Timestamp::MIN)),
        Bound::Included((encoded_key.to_vec(), Timestamp::new(u64::MAX))),
    )
}

/// A closed, immutable delta file. Entries are loaded eagerly at open;
/// delta files are small relative to base data.
pub struct DeltaFile {
    file_name: String,
    entries: BTreeMap<DeltaKey, RowChangeList>,
}

impl DeltaFile {
    pub fn write(
        dir: &Path,
        file_name: &str,
        entries: &BTreeMap<DeltaKey, RowChangeList>,
    ) -> TabletResult<DeltaFile> {
        let mut buf = Vec::new();
        buf.put_u32(entries.len() as u32);
        for ((key, ts), changes) in entries {
            encode_slice(key, &mut buf);
            buf.put_u64(ts.value());
            encode_change_list(changes, &mut buf);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);

        let path = dir.join(file_name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&buf)?;
        file.sync_data()?;

        Ok(DeltaFile {
            file_name: file_name.to_string(),
            entries: entries.clone(),
        })
    }

    pub fn open(dir: &Path, file_name: &str) -> TabletResult<DeltaFile> {
        let mut data = Vec::new();
        File::open(dir.join(file_name))?.read_to_end(&mut data)?;
        if data.len() < 8 {
            return Err(TabletError::corruption(format!(
                "delta file {} truncated",
                file_name
            )));
        }
        let (body, mut tail) = data.split_at(data.len() - 4);
        let expected = tail.get_u32();
        let found = crc32fast::hash(body);
        if found != expected {
            return Err(TabletError::corruption(format!(
                "delta file {} checksum mismatch: found {:#x}, expected {:#x}",
                file_name, found, expected
            )));
        }

        let mut buf = body;
        let count = buf.get_u32();
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = decode_slice(&mut buf)?;
            let ts = Timestamp::new(buf.get_u64());
            let changes = decode_change_list(&mut buf)?;
            entries.insert((key, ts), changes);
        }
        Ok(DeltaFile {
            file_name: file_name.to_string(),
            entries,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn collect_for_key(
        &self,
        encoded_key: &[u8],
        snap: &MvccSnapshot,
    ) -> Vec<(Timestamp, RowChangeList)> {
        self.entries
            .range(key_range(encoded_key))
            .filter(|((_, ts), _)| snap.is_visible(*ts))
            .map(|((_, ts), changes)| (*ts, changes.clone()))
            .collect()
    }

    fn key_is_deleted(&self, encoded_key: &[u8]) -> bool {
        self.entries
            .range(key_range(encoded_key))
            .any(|(_, changes)| changes.is_delete())
    }
}

/// The delta stores of one disk rowset: closed delta files plus the
/// current DeltaMemStore.
pub struct DeltaTracker {
    dms: RwLock<Arc<DeltaMemStore>>,
    delta_files: RwLock<Vec<Arc<DeltaFile>>>,
    next_seq: AtomicU64,
}

impl DeltaTracker {
    pub fn new(dms: Arc<DeltaMemStore>) -> Self {
        Self {
            dms: RwLock::new(dms),
            delta_files: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn with_files(files: Vec<Arc<DeltaFile>>, dms: Arc<DeltaMemStore>, next_seq: u64) -> Self {
        Self {
            dms: RwLock::new(dms),
            delta_files: RwLock::new(files),
            next_seq: AtomicU64::new(next_seq),
        }
    }

    pub fn open(dir: &Path, file_names: &[String]) -> TabletResult<Self> {
        let mut delta_files = Vec::with_capacity(file_names.len());
        let mut max_seq = 0;
        for name in file_names {
            delta_files.push(Arc::new(DeltaFile::open(dir, name)?));
            if let Some(seq) = parse_delta_seq(name) {
                max_seq = max_seq.max(seq + 1);
            }
        }
        Ok(Self {
            dms: RwLock::new(Arc::new(DeltaMemStore::new())),
            delta_files: RwLock::new(delta_files),
            next_seq: AtomicU64::new(max_seq),
        })
    }

    pub fn append(&self, encoded_key: &[u8], ts: Timestamp, changes: &RowChangeList) {
        self.dms.read().upsert(encoded_key, ts, changes);
    }

    /// All mutations for one key visible under `snap`, across delta files
    /// and the DeltaMemStore, in timestamp order.
    pub fn deltas_for_key(
        &self,
        encoded_key: &[u8],
        snap: &MvccSnapshot,
    ) -> Vec<(Timestamp, RowChangeList)> {
        let mut deltas = Vec::new();
        for file in self.delta_files.read().iter() {
            deltas.extend(file.collect_for_key(encoded_key, snap));
        }
        deltas.extend(self.dms.read().collect_for_key(encoded_key, snap));
        deltas.sort_by_key(|(ts, _)| *ts);
        deltas
    }

    pub fn key_is_deleted(&self, encoded_key: &[u8]) -> bool {
        self.delta_files
            .read()
            .iter()
            .any(|f| f.key_is_deleted(encoded_key))
            || self.dms.read().key_is_deleted(encoded_key)
    }

    /// Mutations with timestamps in `(after, upto]`, for missed-delta
    /// re-application.
    pub fn collect_range(
        &self,
        after: Timestamp,
        upto: Timestamp,
    ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)> {
        // During a compaction the inputs' delta files are frozen by the
        // compact_flush_lock, so only the DeltaMemStore can hold entries in
        // the window.
        self.dms.read().collect_range(after, upto)
    }

    pub fn dms_size_bytes(&self) -> usize {
        self.dms.read().size_bytes()
    }

    pub fn num_delta_files(&self) -> usize {
        self.delta_files.read().len()
    }

    pub fn delta_file_names(&self) -> Vec<String> {
        self.delta_files
            .read()
            .iter()
            .map(|f| f.file_name().to_string())
            .collect()
    }

    /// Write the current DeltaMemStore out as a new delta file and install
    /// a fresh empty one. Returns `None` if the store was empty.
    pub fn flush_dms(&self, dir: &Path) -> TabletResult<Option<String>> {
        let entries = {
            let mut dms = self.dms.write();
            if dms.is_empty() {
                return Ok(None);
            }
            let entries = dms.snapshot_entries();
            *dms = Arc::new(DeltaMemStore::new());
            entries
        };
        let file_name = format!("delta_{}.df", self.next_seq.fetch_add(1, Ordering::SeqCst));
        let file = DeltaFile::write(dir, &file_name, &entries)?;
        debug!(
            "flushed {} delta entries to {}",
            file.entry_count(),
            file_name
        );
        self.delta_files.write().push(Arc::new(file));
        Ok(Some(file_name))
    }

    /// Merge every closed delta file into one. Returns the surviving file
    /// list if anything changed.
    pub fn minor_compact(&self, dir: &Path) -> TabletResult<Option<Vec<String>>> {
        let inputs = self.delta_files.read().clone();
        if inputs.len() < 2 {
            return Ok(None);
        }
        let mut merged = BTreeMap::new();
        for file in &inputs {
            merged.extend(
                file.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        let file_name = format!("delta_{}.df", self.next_seq.fetch_add(1, Ordering::SeqCst));
        let file = DeltaFile::write(dir, &file_name, &merged)?;

        let mut files = self.delta_files.write();
        // Concurrent flush_dms may have appended; only replace the inputs.
        files.drain(..inputs.len());
        files.insert(0, Arc::new(file));
        let names = files.iter().map(|f| f.file_name().to_string()).collect();
        Ok(Some(names))
    }

    /// The live DeltaMemStore. A rowset rewrite shares this store with its
    /// replacement so no concurrent mutation is lost.
    pub fn current_dms(&self) -> Arc<DeltaMemStore> {
        self.dms.read().clone()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub fn alloc_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Largest timestamp tracked anywhere in this tracker.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        let from_files = self
            .delta_files
            .read()
            .iter()
            .filter_map(|f| f.entries.keys().map(|(_, ts)| *ts).max())
            .max();
        let from_dms = self
            .dms
            .read()
            .state
            .read()
            .keys()
            .map(|(_, ts)| *ts)
            .max();
        from_files.max(from_dms)
    }

    /// Merged entries of the closed delta files only. Per key these form a
    /// prefix of the mutation chain: the DeltaMemStore holds the suffix.
    pub fn closed_file_entries(&self) -> BTreeMap<DeltaKey, RowChangeList> {
        let mut all = BTreeMap::new();
        for file in self.delta_files.read().iter() {
            all.extend(file.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }
}

fn parse_delta_seq(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("delta_")?
        .strip_suffix(".df")?
        .parse()
        .ok()
}
