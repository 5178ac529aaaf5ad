// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Memcomparable primary key encoding.
//!
//! The key columns of a row are concatenated into a single byte string
//! whose lexicographic order matches the column-wise order of the values.
//! Integers are sign-flipped big-endian; variable-length values are
//! escaped (0x00 becomes 0x00 0xff) and terminated with 0x00 0x00 so that
//! prefixes sort first.

use std::io::Cursor;

use bytes::BufMut;

use super::error::{TabletError, TabletResult};
use super::row::Row;
use crate::catalog::Schema;
use crate::types::DataValue;

const BLOOM_HASH_SEED_1: u32 = 0xbc9f_1d34;
const BLOOM_HASH_SEED_2: u32 = 0x34f1_d34b;

pub fn encode_key(schema: &Schema, row: &Row) -> TabletResult<Vec<u8>> {
    if row.num_columns() < schema.num_key_columns() {
        return Err(
            TabletError::InvalidArgument("row is missing key columns".into()).into(),
        );
    }
    let mut buf = Vec::new();
    for (col, value) in schema.key_columns().iter().zip(row.values()) {
        if !col.accepts(value) || value.is_null() {
            return Err(TabletError::InvalidArgument(format!(
                "bad key value {} for column {}",
                value,
                col.name()
            ))
            .into());
        }
        encode_key_part(value, &mut buf);
    }
    Ok(buf)
}

fn encode_key_part(value: &DataValue, buf: &mut Vec<u8>) {
    match value {
        DataValue::Int32(v) => buf.put_u32((*v as u32) ^ (1 << 31)),
        DataValue::Int64(v) => buf.put_u64((*v as u64) ^ (1 << 63)),
        DataValue::String(v) => encode_escaped(v.as_bytes(), buf),
        DataValue::Blob(v) => encode_escaped(v, buf),
        DataValue::Null => unreachable!("key values are checked non-null"),
    }
}

fn encode_escaped(bytes: &[u8], buf: &mut Vec<u8>) {
    for b in bytes {
        if *b == 0x00 {
            buf.put_u8(0x00);
            buf.put_u8(0xff);
        } else {
            buf.put_u8(*b);
        }
    }
    buf.put_u8(0x00);
    buf.put_u8(0x00);
}

fn bloom_hash(encoded_key: &[u8], seed: u32) -> u32 {
    let mut cursor = Cursor::new(encoded_key);
    murmur3::murmur3_32(&mut cursor, seed).expect("hashing an in-memory buffer cannot fail")
}

/// A probe for one encoded key: the key itself plus the pair of hashes the
/// bloom filters use, computed once and reused against every rowset.
#[derive(Clone, Debug)]
pub struct RowSetKeyProbe {
    encoded_key: Vec<u8>,
    hash1: u32,
    hash2: u32,
}

impl RowSetKeyProbe {
    pub fn new(schema: &Schema, row: &Row) -> TabletResult<Self> {
        Ok(Self::from_encoded(encode_key(schema, row)?))
    }

    pub fn from_encoded(encoded_key: Vec<u8>) -> Self {
        let hash1 = bloom_hash(&encoded_key, BLOOM_HASH_SEED_1);
        let hash2 = bloom_hash(&encoded_key, BLOOM_HASH_SEED_2);
        Self {
            encoded_key,
            hash1,
            hash2,
        }
    }

    pub fn encoded_key(&self) -> &[u8] {
        &self.encoded_key
    }

    /// The i-th bloom probe position before modulo, via double hashing.
    pub fn bloom_probe(&self, i: u32) -> u32 {
        self.hash1.wrapping_add(i.wrapping_mul(self.hash2))
    }
}
