use serde::{Deserialize, Serialize};

use crate::types::{ColumnId, DataType, DataValue};

/// Describes the shape of one column: its type, nullability, and the value
/// rows written before the column existed read back as.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    datatype: DataType,
    nullable: bool,
    default_value: DataValue,
}

impl ColumnDesc {
    pub fn new(datatype: DataType, nullable: bool) -> Self {
        Self {
            datatype,
            nullable,
            default_value: DataValue::Null,
        }
    }

    pub fn with_default(mut self, default_value: DataValue) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// The value materialized for rows that predate this column.
    pub fn default_value(&self) -> &DataValue {
        &self.default_value
    }
}

/// A named column with a stable id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnCatalog {
    id: ColumnId,
    name: String,
    desc: ColumnDesc,
}

impl ColumnCatalog {
    pub fn new(id: ColumnId, name: impl Into<String>, desc: ColumnDesc) -> Self {
        Self {
            id,
            name: name.into(),
            desc,
        }
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &ColumnDesc {
        &self.desc
    }

    /// Whether `value` may be stored in this column.
    pub fn accepts(&self, value: &DataValue) -> bool {
        match value.data_type() {
            None => self.desc.is_nullable(),
            Some(ty) => ty == self.desc.datatype(),
        }
    }
}
