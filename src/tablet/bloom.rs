// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Bloom filter files.
//!
//! Each disk rowset carries one bloom filter over its encoded primary
//! keys, consulted by key probes before any base-data lookup. Probes use
//! double hashing: two murmur3 hashes of the encoded key combine into `k`
//! probe positions, so the per-write hash work is independent of `k`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use bitvec::prelude::{BitVec, Lsb0};
use bytes::{Buf, BufMut};

use super::error::{TabletError, TabletResult};
use super::key::RowSetKeyProbe;

pub const BLOOM_FILE_NAME: &str = "bloom.bf";

/// Sizing knobs for newly built filters.
#[derive(Clone, Copy, Debug)]
pub struct BloomSizing {
    pub false_positive_rate: f64,
}

impl Default for BloomSizing {
    fn default() -> Self {
        Self {
            false_positive_rate: 0.01,
        }
    }
}

/// Accumulates keys while a rowset is written.
pub struct BloomFilterBuilder {
    bits: BitVec<u64, Lsb0>,
    num_hashes: u32,
}

impl BloomFilterBuilder {
    pub fn with_sizing(expected_keys: usize, sizing: BloomSizing) -> Self {
        let n = expected_keys.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * sizing.false_positive_rate.ln()) / (ln2 * ln2)).ceil() as usize;
        let num_bits = num_bits.max(64);
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        let mut bits = BitVec::new();
        bits.resize(num_bits, false);
        Self { bits, num_hashes }
    }

    pub fn insert(&mut self, probe: &RowSetKeyProbe) {
        for i in 0..self.num_hashes {
            let idx = probe.bloom_probe(i) as usize % self.bits.len();
            self.bits.set(idx, true);
        }
    }

    /// Serialize to `dir/bloom.bf` and fsync.
    pub fn write(self, dir: &Path) -> TabletResult<()> {
        let mut buf = Vec::new();
        buf.put_u32(self.bits.len() as u32);
        buf.put_u32(self.num_hashes);
        for word in self.bits.as_raw_slice() {
            buf.put_u64(*word);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(BLOOM_FILE_NAME))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Membership probes against one rowset's bloom file.
pub struct BloomFileReader {
    bits: BitVec<u64, Lsb0>,
    num_hashes: u32,
}

impl BloomFileReader {
    pub fn open(dir: &Path) -> TabletResult<Self> {
        let mut data = Vec::new();
        File::open(dir.join(BLOOM_FILE_NAME))?.read_to_end(&mut data)?;
        if data.len() < 12 {
            return Err(TabletError::corruption("bloom file truncated"));
        }
        let (body, mut tail) = data.split_at(data.len() - 4);
        let expected = tail.get_u32();
        let found = crc32fast::hash(body);
        if found != expected {
            return Err(TabletError::corruption(format!(
                "bloom file checksum mismatch: found {:#x}, expected {:#x}",
                found, expected
            )));
        }

        let mut buf = body;
        let num_bits = buf.get_u32() as usize;
        let num_hashes = buf.get_u32();
        let mut words = Vec::with_capacity(num_bits.div_ceil(64));
        while buf.remaining() >= 8 {
            words.push(buf.get_u64());
        }
        let mut bits = BitVec::from_vec(words);
        bits.truncate(num_bits);
        Ok(Self { bits, num_hashes })
    }

    /// May return a false positive, never a false negative.
    pub fn may_contain(&self, probe: &RowSetKeyProbe) -> bool {
        (0..self.num_hashes).all(|i| self.bits[probe.bloom_probe(i) as usize % self.bits.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(key: &[u8]) -> RowSetKeyProbe {
        RowSetKeyProbe::from_encoded(key.to_vec())
    }

    #[test]
    fn test_bloom_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = BloomFilterBuilder::with_sizing(100, BloomSizing::default());
        for i in 0..100 {
            builder.insert(&probe(format!("k{:03}", i).as_bytes()));
        }
        builder.write(dir.path()).unwrap();

        let reader = BloomFileReader::open(dir.path()).unwrap();
        for i in 0..100 {
            assert!(reader.may_contain(&probe(format!("k{:03}", i).as_bytes())));
        }
        let false_positives = (0..1000)
            .filter(|i| reader.may_contain(&probe(format!("absent{}", i).as_bytes())))
            .count();
        assert!(false_positives < 100, "{} false positives", false_positives);
    }
}
