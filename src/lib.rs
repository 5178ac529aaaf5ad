// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Rutile is a per-tablet storage engine for a distributed columnar table
//! store. A tablet owns a contiguous range of primary keys and is the unit
//! of write, read, flush and compaction. The engine provides MVCC-ordered
//! inserts and updates of primary-keyed rows, snapshot-consistent scans,
//! durable flushing of in-memory state to on-disk rowsets, and background
//! compaction that merges rowsets and collapses deltas.

#![deny(unused_must_use)]

pub mod catalog;
pub mod tablet;
pub mod types;

pub use self::tablet::{Tablet, TabletError, TabletOptions, TabletResult};
