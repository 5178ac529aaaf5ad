// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Rows and mutation change lists.

use serde::{Deserialize, Serialize};

use super::error::{TabletError, TabletResult};
use crate::catalog::{Projection, Schema};
use crate::types::{ColumnId, DataValue};

/// One row's values, positionally aligned with a schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Row(Vec<DataValue>);

impl Row {
    pub fn new(values: Vec<DataValue>) -> Self {
        Row(values)
    }

    pub fn values(&self) -> &[DataValue] {
        &self.0
    }

    pub fn num_columns(&self) -> usize {
        self.0.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.0.iter().map(|v| v.size_bytes()).sum()
    }

    /// Check that this row is a complete, well-typed row of `schema`.
    pub fn validate(&self, schema: &Schema) -> TabletResult<()> {
        if self.0.len() != schema.num_columns() {
            return Err(TabletError::InvalidArgument(format!(
                "row has {} values, schema has {} columns",
                self.0.len(),
                schema.num_columns()
            ))
            .into());
        }
        for (col, value) in schema.columns().iter().zip(&self.0) {
            if !col.accepts(value) {
                return Err(TabletError::InvalidArgument(format!(
                    "bad value {} for column {}",
                    value,
                    col.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Materialize this row (stored under `stored_schema`) in the shape of
    /// `projection`, filling columns the stored row predates with their
    /// declared defaults.
    pub fn project(&self, stored_schema: &Schema, projection: &Projection) -> Row {
        let values = projection
            .columns()
            .iter()
            .map(|col| match stored_schema.column_index(col.id()) {
                Some(idx) => self.0[idx].clone(),
                None => col.desc().default_value().clone(),
            })
            .collect();
        Row(values)
    }
}

/// A single cell-level change within a mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    SetColumn { column_id: ColumnId, value: DataValue },
    Delete,
}

/// An ordered list of changes applied atomically to one row under one
/// timestamp.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RowChangeList(Vec<RowChange>);

impl RowChangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_column(mut self, column_id: ColumnId, value: DataValue) -> Self {
        self.0.push(RowChange::SetColumn { column_id, value });
        self
    }

    pub fn delete(mut self) -> Self {
        self.0.push(RowChange::Delete);
        self
    }

    pub fn changes(&self) -> &[RowChange] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_delete(&self) -> bool {
        self.0.iter().any(|c| matches!(c, RowChange::Delete))
    }

    pub fn size_bytes(&self) -> usize {
        self.0
            .iter()
            .map(|c| match c {
                RowChange::SetColumn { value, .. } => 8 + value.size_bytes(),
                RowChange::Delete => 1,
            })
            .sum()
    }

    /// Check this change list against `schema`: a malformed change list is
    /// a client error. Key columns cannot be updated in place.
    pub fn validate(&self, schema: &Schema) -> TabletResult<()> {
        if self.0.is_empty() {
            return Err(TabletError::InvalidArgument("empty change list".into()).into());
        }
        for change in &self.0 {
            if let RowChange::SetColumn { column_id, value } = change {
                let col = schema
                    .column_by_id(*column_id)
                    .ok_or(TabletError::InvalidColumn(*column_id))?;
                if schema.key_columns().iter().any(|k| k.id() == *column_id) {
                    return Err(TabletError::InvalidArgument(format!(
                        "cannot update key column {}",
                        col.name()
                    ))
                    .into());
                }
                if !col.accepts(value) {
                    return Err(TabletError::InvalidArgument(format!(
                        "bad value {} for column {}",
                        value,
                        col.name()
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Apply to a projected row in place. Returns `false` if the row was
    /// deleted. Changes to columns outside `projection` are ignored; a
    /// delete always applies.
    pub fn apply_to_projected(&self, projection: &Projection, row: &mut Row) -> bool {
        for change in &self.0 {
            match change {
                RowChange::Delete => return false,
                RowChange::SetColumn { column_id, value } => {
                    if let Some(idx) = projection
                        .columns()
                        .iter()
                        .position(|c| c.id() == *column_id)
                    {
                        row.0[idx] = value.clone();
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnCatalog, ColumnDesc};
    use crate::types::DataType;

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnCatalog::new(0, "key", ColumnDesc::new(DataType::String, false)),
                ColumnCatalog::new(1, "val", ColumnDesc::new(DataType::Int32, true)),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_changelist_validation() {
        let schema = schema();
        assert!(RowChangeList::new().validate(&schema).is_err());
        assert!(RowChangeList::new()
            .set_column(0, DataValue::String("x".into()))
            .validate(&schema)
            .is_err());
        assert!(RowChangeList::new()
            .set_column(1, DataValue::String("x".into()))
            .validate(&schema)
            .is_err());
        assert!(RowChangeList::new()
            .set_column(1, DataValue::Int32(3))
            .validate(&schema)
            .is_ok());
        assert!(RowChangeList::new().delete().validate(&schema).is_ok());
    }

    #[test]
    fn test_apply_to_projected() {
        let schema = schema();
        let projection = schema.full_projection();
        let mut row = Row::new(vec![DataValue::String("k".into()), DataValue::Int32(1)]);
        let alive = RowChangeList::new()
            .set_column(1, DataValue::Int32(2))
            .apply_to_projected(&projection, &mut row);
        assert!(alive);
        assert_eq!(row.values()[1], DataValue::Int32(2));

        let alive = RowChangeList::new()
            .delete()
            .apply_to_projected(&projection, &mut row);
        assert!(!alive);
    }

    #[test]
    fn test_project_fills_defaults() {
        let schema = schema();
        let wider = schema
            .build_successor(vec![
                ColumnCatalog::new(0, "key", ColumnDesc::new(DataType::String, false)),
                ColumnCatalog::new(1, "val", ColumnDesc::new(DataType::Int32, true)),
                ColumnCatalog::new(
                    2,
                    "c3",
                    ColumnDesc::new(DataType::Int32, false).with_default(DataValue::Int32(0)),
                ),
            ])
            .unwrap();
        let row = Row::new(vec![DataValue::String("k".into()), DataValue::Int32(1)]);
        let projected = row.project(&schema, &wider.full_projection());
        assert_eq!(projected.values()[2], DataValue::Int32(0));
    }
}
