// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Column and schema descriptors.
//!
//! A [`Schema`] is an ordered list of named, typed columns plus a non-empty
//! prefix designated as the primary key. Columns carry stable numeric ids;
//! every on-disk structure refers to columns by id so that renames preserve
//! data.

mod column;
mod schema;

pub use self::column::{ColumnCatalog, ColumnDesc};
pub use self::schema::{Projection, Schema, SchemaRef};
