use std::sync::Arc;

use super::mem_rowset::MemRowSet;
use super::rowset_tree::RowSetTree;
use crate::catalog::SchemaRef;

/// The components of the tablet's storage: the schema, the active
/// MemRowSet, and the rowset tree.
///
/// This structure is immutable and reference counted. A writer or scanner
/// grabs it under the components read-lock and can be sure it never
/// changes; flush, compaction, and schema alter publish replacement
/// instances under the write-lock. Holding a reference extends the
/// lifetime of every contained store.
pub struct TabletComponents {
    pub schema: SchemaRef,
    pub memrowset: Arc<MemRowSet>,
    pub rowsets: Arc<RowSetTree>,
}

impl TabletComponents {
    pub fn new(
        schema: SchemaRef,
        memrowset: Arc<MemRowSet>,
        rowsets: Arc<RowSetTree>,
    ) -> Arc<Self> {
        Arc::new(Self {
            schema,
            memrowset,
            rowsets,
        })
    }
}
