// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Data types and runtime values stored in tablet rows.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable numeric id of a column. The engine identifies columns by id, not
/// name, so schema alters that rename a column preserve its data.
pub type ColumnId = u32;

/// The type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    Int64,
    String,
    /// Raw bytes. Used internally for encoded primary keys; also available
    /// to user schemas.
    Blob,
}

/// A single runtime value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Int32(i32),
    Int64(i64),
    String(String),
    Blob(Vec<u8>),
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// The data type of this value, or `None` for null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            DataValue::Null => None,
            DataValue::Int32(_) => Some(DataType::Int32),
            DataValue::Int64(_) => Some(DataType::Int64),
            DataValue::String(_) => Some(DataType::String),
            DataValue::Blob(_) => Some(DataType::Blob),
        }
    }

    /// Approximate in-memory footprint, used for memory accounting.
    pub fn size_bytes(&self) -> usize {
        match self {
            DataValue::Null => 1,
            DataValue::Int32(_) => 4,
            DataValue::Int64(_) => 8,
            DataValue::String(s) => s.len() + 8,
            DataValue::Blob(b) => b.len() + 8,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => write!(f, "NULL"),
            DataValue::Int32(v) => write!(f, "{}", v),
            DataValue::Int64(v) => write!(f, "{}", v),
            DataValue::String(v) => write!(f, "{:?}", v),
            DataValue::Blob(v) => write!(f, "{:02x?}", v),
        }
    }
}
