// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Columnar files ("CFiles").
//!
//! One CFile holds the values of a single column for every base row of a
//! rowset, in key order. Values are grouped into fixed-cardinality blocks,
//! each independently checksummed, with a footer index mapping block
//! ordinals to offsets. Decoded blocks are shared through the tablet's
//! block cache.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use moka::sync::Cache;
use parking_lot::Mutex;

use super::encoding::{decode_value, encode_value};
use super::error::{TabletError, TabletResult};
use crate::types::{ColumnId, DataValue};

const CFILE_MAGIC: u32 = 0xc01f_11e5;
pub const VALUES_PER_BLOCK: usize = 256;

/// Identifies one decoded block in the tablet block cache.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct BlockCacheKey {
    pub rowset_id: u32,
    pub column_id: ColumnId,
    pub block_idx: u32,
}

pub type Block = Arc<Vec<DataValue>>;
pub type BlockCache = Cache<BlockCacheKey, Block>;

struct BlockIndexEntry {
    offset: u64,
    length: u32,
    value_count: u32,
}

/// Appends one column's values in key order and writes the block index.
pub struct CFileWriter {
    path: PathBuf,
    buf: Vec<u8>,
    pending: Vec<DataValue>,
    index: Vec<BlockIndexEntry>,
    value_count: u64,
}

impl CFileWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            buf: Vec::new(),
            pending: Vec::new(),
            index: Vec::new(),
            value_count: 0,
        }
    }

    pub fn append(&mut self, value: DataValue) {
        self.pending.push(value);
        self.value_count += 1;
        if self.pending.len() >= VALUES_PER_BLOCK {
            self.seal_block();
        }
    }

    fn seal_block(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let offset = self.buf.len() as u64;
        let mut block = Vec::new();
        block.put_u16(self.pending.len() as u16);
        for value in self.pending.drain(..) {
            encode_value(&value, &mut block);
        }
        let checksum = crc32fast::hash(&block);
        block.put_u32(checksum);
        self.index.push(BlockIndexEntry {
            offset,
            length: block.len() as u32,
            value_count: self.index.last().map_or(0, |e| e.value_count)
                + (block_value_count(&block)),
        });
        self.buf.extend_from_slice(&block);
    }

    /// Write out data, footer, and fsync.
    pub fn finish(mut self) -> TabletResult<()> {
        self.seal_block();

        let footer_offset = self.buf.len() as u64;
        let mut footer = Vec::new();
        footer.put_u32(self.index.len() as u32);
        for entry in &self.index {
            footer.put_u64(entry.offset);
            footer.put_u32(entry.length);
            footer.put_u32(entry.value_count);
        }
        footer.put_u64(self.value_count);
        let checksum = crc32fast::hash(&footer);
        footer.put_u32(checksum);
        self.buf.extend_from_slice(&footer);
        self.buf.put_u64(footer_offset);
        self.buf.put_u32(CFILE_MAGIC);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(&self.buf)?;
        file.sync_data()?;
        Ok(())
    }
}

fn block_value_count(block: &[u8]) -> u32 {
    let mut prefix = block;
    prefix.get_u16() as u32
}

/// Random and sequential reads over one CFile.
pub struct CFileReader {
    file: Mutex<File>,
    index: Vec<BlockIndexEntry>,
    value_count: u64,
    cache: BlockCache,
    rowset_id: u32,
    column_id: ColumnId,
}

impl CFileReader {
    pub fn open(
        path: impl AsRef<Path>,
        cache: BlockCache,
        rowset_id: u32,
        column_id: ColumnId,
    ) -> TabletResult<Self> {
        let mut file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        if file_len < 12 {
            return Err(TabletError::corruption("cfile truncated"));
        }
        file.seek(SeekFrom::End(-12))?;
        let mut tail = [0u8; 12];
        file.read_exact(&mut tail)?;
        let mut tail_buf = &tail[..];
        let footer_offset = tail_buf.get_u64();
        let magic = tail_buf.get_u32();
        if magic != CFILE_MAGIC {
            return Err(TabletError::corruption("bad cfile magic"));
        }

        let footer_len = file_len - 12 - footer_offset;
        file.seek(SeekFrom::Start(footer_offset))?;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact(&mut footer)?;
        let (body, mut checksum_buf) = footer.split_at(footer.len() - 4);
        let expected = checksum_buf.get_u32();
        let found = crc32fast::hash(body);
        if found != expected {
            return Err(TabletError::corruption(format!(
                "cfile footer checksum mismatch: found {:#x}, expected {:#x}",
                found, expected
            )));
        }

        let mut buf = body;
        let block_count = buf.get_u32();
        let mut index = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            index.push(BlockIndexEntry {
                offset: buf.get_u64(),
                length: buf.get_u32(),
                value_count: buf.get_u32(),
            });
        }
        let value_count = buf.get_u64();

        Ok(Self {
            file: Mutex::new(file),
            index,
            value_count,
            cache,
            rowset_id,
            column_id,
        })
    }

    pub fn value_count(&self) -> u64 {
        self.value_count
    }

    fn read_block(&self, block_idx: u32) -> TabletResult<Block> {
        let key = BlockCacheKey {
            rowset_id: self.rowset_id,
            column_id: self.column_id,
            block_idx,
        };
        if let Some(block) = self.cache.get(&key) {
            return Ok(block);
        }

        let entry = &self.index[block_idx as usize];
        let mut raw = vec![0u8; entry.length as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut raw)?;
        }
        let (body, mut checksum_buf) = raw.split_at(raw.len() - 4);
        let expected = checksum_buf.get_u32();
        let found = crc32fast::hash(body);
        if found != expected {
            return Err(TabletError::corruption(format!(
                "cfile block checksum mismatch: found {:#x}, expected {:#x}",
                found, expected
            )));
        }

        let mut buf = body;
        let count = buf.get_u16();
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(decode_value(&mut buf)?);
        }
        let block = Arc::new(values);
        self.cache.insert(key, block.clone());
        Ok(block)
    }

    /// Random read of the value at a row ordinal.
    pub fn value_at(&self, ordinal: u64) -> TabletResult<DataValue> {
        if ordinal >= self.value_count {
            return Err(TabletError::InvalidArgument(format!(
                "ordinal {} beyond {} values",
                ordinal, self.value_count
            ))
            .into());
        }
        let block_idx = self
            .index
            .partition_point(|e| (e.value_count as u64) <= ordinal) as u32;
        let block = self.read_block(block_idx)?;
        let block_start = if block_idx == 0 {
            0
        } else {
            self.index[block_idx as usize - 1].value_count as u64
        };
        Ok(block[(ordinal - block_start) as usize].clone())
    }

    pub fn iter(&self) -> CFileIterator<'_> {
        CFileIterator {
            reader: self,
            block: None,
            block_idx: 0,
            pos_in_block: 0,
        }
    }
}

/// Sequential scan over a CFile.
pub struct CFileIterator<'a> {
    reader: &'a CFileReader,
    block: Option<Block>,
    block_idx: u32,
    pos_in_block: usize,
}

impl CFileIterator<'_> {
    pub fn next_value(&mut self) -> TabletResult<Option<DataValue>> {
        loop {
            if let Some(block) = &self.block {
                if self.pos_in_block < block.len() {
                    let value = block[self.pos_in_block].clone();
                    self.pos_in_block += 1;
                    return Ok(Some(value));
                }
                self.block = None;
                self.block_idx += 1;
                self.pos_in_block = 0;
            }
            if (self.block_idx as usize) >= self.reader.index.len() {
                return Ok(None);
            }
            self.block = Some(self.reader.read_block(self.block_idx)?);
        }
    }
}

pub fn new_block_cache(capacity: u64) -> BlockCache {
    Cache::new(capacity)
}
