// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Persisted tablet state.
//!
//! One JSON superblock per tablet lists the schema, the next MemRowSet id,
//! and the set of rowset directories with their key ranges and delta
//! files. Updates rewrite the file to a temporary name and rename it into
//! place, so a crash leaves either the old or the new state, never a torn
//! one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{with_io_retry, TabletResult};
use super::mvcc::Timestamp;
use crate::catalog::Schema;
use crate::types::ColumnId;

const SUPERBLOCK_FILE_NAME: &str = "tablet.meta";
const SUPERBLOCK_TMP_FILE_NAME: &str = "tablet.meta.tmp";

/// One rowset directory as recorded in the superblock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowSetMetadata {
    pub id: u32,
    /// Directory under the tablet root. Usually `rs_<id>`, but a base
    /// rewrite keeps the directory while assigning a fresh id.
    pub dir_name: String,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub row_count: u64,
    /// High-water timestamp of the snapshot the base data was written
    /// under; every earlier mutation is folded into the base.
    pub base_ts: Timestamp,
    pub column_ids: Vec<ColumnId>,
    pub delta_files: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SuperBlock {
    tablet_id: String,
    schema: Schema,
    next_mrs_id: i64,
    next_rowset_id: u32,
    rowsets: Vec<RowSetMetadata>,
}

/// Handle to the tablet's on-disk metadata.
pub struct TabletMetadata {
    root: PathBuf,
    state: Mutex<SuperBlock>,
}

impl TabletMetadata {
    /// Create the tablet directory and its initial superblock.
    pub fn create_new(
        root: impl AsRef<Path>,
        tablet_id: impl Into<String>,
        schema: Schema,
    ) -> TabletResult<Arc<TabletMetadata>> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let meta = TabletMetadata {
            root,
            state: Mutex::new(SuperBlock {
                tablet_id: tablet_id.into(),
                schema,
                next_mrs_id: 0,
                next_rowset_id: 0,
                rowsets: Vec::new(),
            }),
        };
        meta.persist()?;
        Ok(Arc::new(meta))
    }

    pub fn load(root: impl AsRef<Path>) -> TabletResult<Arc<TabletMetadata>> {
        let root = root.as_ref().to_path_buf();
        let data = std::fs::read(root.join(SUPERBLOCK_FILE_NAME))?;
        let mut block: SuperBlock = serde_json::from_slice(&data)?;
        block.schema.reindex();
        info!(
            "loaded tablet {} with {} rowsets",
            block.tablet_id,
            block.rowsets.len()
        );
        Ok(Arc::new(TabletMetadata {
            root,
            state: Mutex::new(block),
        }))
    }

    fn persist(&self) -> TabletResult<()> {
        let data = {
            let state = self.state.lock();
            serde_json::to_vec_pretty(&*state)?
        };
        with_io_retry("superblock write", || {
            let tmp = self.root.join(SUPERBLOCK_TMP_FILE_NAME);
            std::fs::write(&tmp, &data)?;
            let file = std::fs::File::open(&tmp)?;
            file.sync_data()?;
            std::fs::rename(&tmp, self.root.join(SUPERBLOCK_FILE_NAME))?;
            std::fs::File::open(&self.root)?.sync_data()?;
            Ok(())
        })
    }

    pub fn tablet_id(&self) -> String {
        self.state.lock().tablet_id.clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema(&self) -> Schema {
        self.state.lock().schema.clone()
    }

    pub fn rowsets(&self) -> Vec<RowSetMetadata> {
        self.state.lock().rowsets.clone()
    }

    pub fn rowset_dir(&self, meta: &RowSetMetadata) -> PathBuf {
        self.root.join(&meta.dir_name)
    }

    pub fn new_rowset_dir(&self, rowset_id: u32) -> (String, PathBuf) {
        let name = format!("rs_{}", rowset_id);
        let path = self.root.join(&name);
        (name, path)
    }

    pub fn next_mrs_id(&self) -> i64 {
        self.state.lock().next_mrs_id
    }

    pub fn gen_rowset_id(&self) -> u32 {
        let mut state = self.state.lock();
        let id = state.next_rowset_id;
        state.next_rowset_id += 1;
        id
    }

    /// Atomically persist a rowset membership change: `remove` rowset ids
    /// replaced by `add`, with the active MemRowSet id advanced to
    /// `new_mrs_id` when the change covers a MemRowSet flush. Crash-safe.
    pub fn update_on_disk_state(
        &self,
        remove: &[u32],
        add: Vec<RowSetMetadata>,
        new_mrs_id: Option<i64>,
    ) -> TabletResult<()> {
        {
            let mut state = self.state.lock();
            state.rowsets.retain(|rs| !remove.contains(&rs.id));
            state.rowsets.extend(add);
            if let Some(mrs_id) = new_mrs_id {
                state.next_mrs_id = state.next_mrs_id.max(mrs_id);
            }
        }
        self.persist()
    }

    /// Persist a change to one rowset's delta file list.
    pub fn update_rowset_deltas(
        &self,
        rowset_id: u32,
        delta_files: Vec<String>,
    ) -> TabletResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(rs) = state.rowsets.iter_mut().find(|rs| rs.id == rowset_id) {
                rs.delta_files = delta_files;
            }
        }
        self.persist()
    }

    /// Persist a rewrite of one rowset's base files and delta list, as
    /// produced by a major delta compaction. The rewrite carries a fresh
    /// id; `old_id` names the entry it supersedes.
    pub fn replace_rowset(&self, old_id: u32, meta: RowSetMetadata) -> TabletResult<()> {
        {
            let mut state = self.state.lock();
            state.rowsets.retain(|rs| rs.id != old_id && rs.id != meta.id);
            state.rowsets.push(meta);
        }
        self.persist()
    }

    pub fn set_schema(&self, schema: Schema) -> TabletResult<()> {
        self.state.lock().schema = schema;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnCatalog, ColumnDesc};
    use crate::types::DataType;

    fn schema() -> Schema {
        Schema::new(
            vec![ColumnCatalog::new(
                0,
                "key",
                ColumnDesc::new(DataType::String, false),
            )],
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_superblock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = TabletMetadata::create_new(dir.path(), "t1", schema()).unwrap();
        assert_eq!(meta.gen_rowset_id(), 0);
        meta.update_on_disk_state(
            &[],
            vec![RowSetMetadata {
                id: 0,
                dir_name: "rs_0".into(),
                min_key: b"a".to_vec(),
                max_key: b"z".to_vec(),
                row_count: 10,
                base_ts: Timestamp::new(4),
                column_ids: vec![0],
                delta_files: vec![],
            }],
            Some(1),
        )
        .unwrap();

        let reloaded = TabletMetadata::load(dir.path()).unwrap();
        assert_eq!(reloaded.tablet_id(), "t1");
        assert_eq!(reloaded.next_mrs_id(), 1);
        assert_eq!(reloaded.gen_rowset_id(), 1);
        let rowsets = reloaded.rowsets();
        assert_eq!(rowsets.len(), 1);
        assert_eq!(rowsets[0].base_ts, Timestamp::new(4));
        assert_eq!(reloaded.schema().num_key_columns(), 1);
    }

    #[test]
    fn test_update_replaces_rowsets() {
        let dir = tempfile::tempdir().unwrap();
        let meta = TabletMetadata::create_new(dir.path(), "t1", schema()).unwrap();
        let entry = |id: u32| RowSetMetadata {
            id,
            dir_name: format!("rs_{}", id),
            min_key: b"a".to_vec(),
            max_key: b"z".to_vec(),
            row_count: 1,
            base_ts: Timestamp::MIN,
            column_ids: vec![0],
            delta_files: vec![],
        };
        meta.update_on_disk_state(&[], vec![entry(0), entry(1)], None)
            .unwrap();
        meta.update_on_disk_state(&[0, 1], vec![entry(2)], None)
            .unwrap();
        let ids: Vec<u32> = meta.rowsets().iter().map(|rs| rs.id).collect();
        assert_eq!(ids, vec![2]);
    }
}
