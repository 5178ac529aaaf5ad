// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Key-range index over the tablet's rowsets.
//!
//! Entries are sorted by minimum key and augmented with a running maximum
//! so a point probe scans only the prefix of entries whose ranges could
//! still cover the key. Immutable once built; flush and compaction publish
//! replacement trees instead of editing one in place.

use std::sync::Arc;

use smallvec::SmallVec;

use super::rowset::RowSet;

struct TreeEntry {
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    /// Largest max key among entries up to and including this one.
    running_max: Vec<u8>,
    rowset: Arc<dyn RowSet>,
}

#[derive(Default)]
pub struct RowSetTree {
    entries: Vec<TreeEntry>,
}

impl RowSetTree {
    pub fn new(rowsets: Vec<Arc<dyn RowSet>>) -> Self {
        let mut keyed: Vec<(Vec<u8>, Vec<u8>, Arc<dyn RowSet>)> = rowsets
            .into_iter()
            .filter_map(|rs| rs.key_bounds().map(|(min, max)| (min, max, rs)))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::with_capacity(keyed.len());
        let mut running_max: Vec<u8> = Vec::new();
        for (min_key, max_key, rowset) in keyed {
            if max_key > running_max {
                running_max = max_key.clone();
            }
            entries.push(TreeEntry {
                min_key,
                max_key,
                running_max: running_max.clone(),
                rowset,
            });
        }
        Self { entries }
    }

    /// Every rowset whose key range covers `key`.
    pub fn find_rowsets_with_key(&self, key: &[u8]) -> SmallVec<[Arc<dyn RowSet>; 1]> {
        let mut out = SmallVec::new();
        let end = self.entries.partition_point(|e| e.min_key.as_slice() <= key);
        for entry in self.entries[..end].iter().rev() {
            if entry.running_max.as_slice() < key {
                break;
            }
            if entry.max_key.as_slice() >= key {
                out.push(entry.rowset.clone());
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn RowSet>> {
        self.entries.iter().map(|e| &e.rowset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the successor tree with `to_remove` (matched by `Arc`
    /// identity) replaced by `to_add`.
    pub fn replacing(
        &self,
        to_remove: &[Arc<dyn RowSet>],
        to_add: Vec<Arc<dyn RowSet>>,
    ) -> RowSetTree {
        let mut rowsets: Vec<Arc<dyn RowSet>> = self
            .iter()
            .filter(|rs| !to_remove.iter().any(|r| Arc::ptr_eq(r, rs)))
            .cloned()
            .collect();
        rowsets.extend(to_add);
        RowSetTree::new(rowsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::error::TabletResult;
    use crate::tablet::iterator::RowSetIterator;
    use crate::tablet::key::RowSetKeyProbe;
    use crate::tablet::mvcc::{MvccSnapshot, Timestamp};
    use crate::tablet::row::{Row, RowChangeList};
    use crate::tablet::rowset::{CompactFlushLock, DeltaStats};
    use crate::catalog::Projection;

    struct FakeRowSet {
        min: Vec<u8>,
        max: Vec<u8>,
        lock: CompactFlushLock,
    }

    impl FakeRowSet {
        fn new(min: &[u8], max: &[u8]) -> Arc<dyn RowSet> {
            Arc::new(Self {
                min: min.to_vec(),
                max: max.to_vec(),
                lock: CompactFlushLock::default(),
            })
        }
    }

    impl RowSet for FakeRowSet {
        fn name(&self) -> String {
            format!("fake({:02x?})", self.min)
        }
        fn check_row_present(&self, _: &RowSetKeyProbe) -> TabletResult<bool> {
            Ok(false)
        }
        fn mutate_row(
            &self,
            _: Timestamp,
            _: &RowSetKeyProbe,
            _: &RowChangeList,
        ) -> TabletResult<()> {
            unimplemented!()
        }
        fn new_iterator(
            self: Arc<Self>,
            _: &Projection,
            _: &MvccSnapshot,
        ) -> TabletResult<Box<dyn RowSetIterator>> {
            unimplemented!()
        }
        fn entry_count(&self) -> u64 {
            0
        }
        fn estimate_on_disk_size(&self) -> u64 {
            0
        }
        fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
            Some((self.min.clone(), self.max.clone()))
        }
        fn delta_stats(&self) -> DeltaStats {
            DeltaStats::default()
        }
        fn collect_missed_deltas(
            &self,
            _: Timestamp,
            _: Timestamp,
        ) -> Vec<(Vec<u8>, Timestamp, RowChangeList)> {
            vec![]
        }
        fn compact_flush_lock(&self) -> &CompactFlushLock {
            &self.lock
        }
        fn debug_dump(&self, _: &mut Vec<String>) {}
    }

    #[test]
    fn test_point_probe_finds_covering_rowsets() {
        let tree = RowSetTree::new(vec![
            FakeRowSet::new(b"a", b"f"),
            FakeRowSet::new(b"c", b"d"),
            FakeRowSet::new(b"g", b"k"),
        ]);
        assert_eq!(tree.find_rowsets_with_key(b"b").len(), 1);
        assert_eq!(tree.find_rowsets_with_key(b"c").len(), 2);
        assert_eq!(tree.find_rowsets_with_key(b"h").len(), 1);
        assert_eq!(tree.find_rowsets_with_key(b"z").len(), 0);
    }

    #[test]
    fn test_replacing_preserves_others() {
        let a = FakeRowSet::new(b"a", b"b");
        let b = FakeRowSet::new(b"c", b"d");
        let tree = RowSetTree::new(vec![a.clone(), b.clone()]);
        let replaced = tree.replacing(&[a], vec![FakeRowSet::new(b"a", b"b")]);
        assert_eq!(replaced.len(), 2);
        assert!(replaced
            .iter()
            .any(|rs| Arc::ptr_eq(rs, &b)));
    }
}
