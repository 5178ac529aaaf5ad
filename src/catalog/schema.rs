use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ColumnCatalog;
use crate::tablet::{TabletError, TabletResult};
use crate::types::ColumnId;

pub type SchemaRef = Arc<Schema>;

/// An ordered list of columns whose non-empty prefix forms the primary key,
/// plus a version number bumped by every schema alter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnCatalog>,
    num_key_columns: usize,
    version: u32,
    #[serde(skip)]
    column_map: HashMap<ColumnId, usize>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnCatalog>, num_key_columns: usize) -> TabletResult<Self> {
        let schema = Self {
            column_map: Self::build_column_map(&columns),
            columns,
            num_key_columns,
            version: 0,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn build_column_map(columns: &[ColumnCatalog]) -> HashMap<ColumnId, usize> {
        columns
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.id(), idx))
            .collect()
    }

    /// Rebuild the derived column map, e.g. after deserialization.
    pub fn reindex(&mut self) {
        self.column_map = Self::build_column_map(&self.columns);
    }

    fn validate(&self) -> TabletResult<()> {
        if self.num_key_columns == 0 || self.num_key_columns > self.columns.len() {
            return Err(TabletError::InvalidArgument(format!(
                "invalid key column count {} for {} columns",
                self.num_key_columns,
                self.columns.len()
            ))
            .into());
        }
        if self.column_map.len() != self.columns.len() {
            return Err(TabletError::InvalidArgument("duplicate column id".into()).into());
        }
        for col in self.key_columns() {
            if col.desc().is_nullable() {
                return Err(TabletError::InvalidArgument(format!(
                    "key column {} must not be nullable",
                    col.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn columns(&self) -> &[ColumnCatalog] {
        &self.columns
    }

    pub fn key_columns(&self) -> &[ColumnCatalog] {
        &self.columns[..self.num_key_columns]
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnCatalog> {
        self.column_map.get(&id).map(|idx| &self.columns[*idx])
    }

    pub fn column_index(&self, id: ColumnId) -> Option<usize> {
        self.column_map.get(&id).copied()
    }

    pub fn column_ids(&self) -> Vec<ColumnId> {
        self.columns.iter().map(|c| c.id()).collect()
    }

    /// Build a projection over the given column ids, in the given order.
    pub fn project(&self, ids: &[ColumnId]) -> TabletResult<Projection> {
        let columns = ids
            .iter()
            .map(|id| {
                self.column_by_id(*id)
                    .cloned()
                    .ok_or_else(|| TabletError::InvalidColumn(*id).into())
            })
            .collect::<TabletResult<Vec<_>>>()?;
        Ok(Projection { columns })
    }

    /// A projection over every column of this schema.
    pub fn full_projection(&self) -> Projection {
        Projection {
            columns: self.columns.clone(),
        }
    }

    /// Derive the successor schema for an alter. The key prefix must be
    /// unchanged (same ids, types, order); non-key columns may be added,
    /// dropped, or renamed. Added non-nullable columns must carry a
    /// non-null default.
    pub fn build_successor(&self, columns: Vec<ColumnCatalog>) -> TabletResult<Schema> {
        let mut next = Schema::new(columns, self.num_key_columns)?;
        for (old, new) in self.key_columns().iter().zip(next.key_columns()) {
            if old.id() != new.id() || old.desc().datatype() != new.desc().datatype() {
                return Err(TabletError::InvalidArgument(
                    "alter must not change the key schema".into(),
                )
                .into());
            }
        }
        for col in &next.columns[next.num_key_columns..] {
            let is_new = self.column_by_id(col.id()).is_none();
            if is_new && !col.desc().is_nullable() && col.desc().default_value().is_null() {
                return Err(TabletError::InvalidArgument(format!(
                    "new non-nullable column {} needs a default",
                    col.name()
                ))
                .into());
            }
        }
        next.version = self.version + 1;
        Ok(next)
    }
}

/// An ordered subset of schema columns that a scan materializes.
#[derive(Clone, Debug)]
pub struct Projection {
    columns: Vec<ColumnCatalog>,
}

impl Projection {
    pub fn columns(&self) -> &[ColumnCatalog] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}
