//! Binary encoding shared by the on-disk file formats.

use bytes::{Buf, BufMut};

use super::error::{TabletError, TabletResult};
use super::row::{RowChange, RowChangeList};
use crate::types::DataValue;

const TAG_NULL: u8 = 0;
const TAG_INT32: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BLOB: u8 = 4;

const CHANGE_SET_COLUMN: u8 = 0;
const CHANGE_DELETE: u8 = 1;

pub fn encode_slice(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn decode_slice(buf: &mut &[u8]) -> TabletResult<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let mut out = vec![0; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn encode_value(value: &DataValue, buf: &mut Vec<u8>) {
    match value {
        DataValue::Null => buf.put_u8(TAG_NULL),
        DataValue::Int32(v) => {
            buf.put_u8(TAG_INT32);
            buf.put_i32(*v);
        }
        DataValue::Int64(v) => {
            buf.put_u8(TAG_INT64);
            buf.put_i64(*v);
        }
        DataValue::String(v) => {
            buf.put_u8(TAG_STRING);
            encode_slice(v.as_bytes(), buf);
        }
        DataValue::Blob(v) => {
            buf.put_u8(TAG_BLOB);
            encode_slice(v, buf);
        }
    }
}

pub fn decode_value(buf: &mut &[u8]) -> TabletResult<DataValue> {
    if !buf.has_remaining() {
        return Err(truncated());
    }
    match buf.get_u8() {
        TAG_NULL => Ok(DataValue::Null),
        TAG_INT32 => {
            if buf.remaining() < 4 {
                return Err(truncated());
            }
            Ok(DataValue::Int32(buf.get_i32()))
        }
        TAG_INT64 => {
            if buf.remaining() < 8 {
                return Err(truncated());
            }
            Ok(DataValue::Int64(buf.get_i64()))
        }
        TAG_STRING => {
            let bytes = decode_slice(buf)?;
            String::from_utf8(bytes)
                .map(DataValue::String)
                .map_err(|_| TabletError::corruption("non-utf8 string value"))
        }
        TAG_BLOB => Ok(DataValue::Blob(decode_slice(buf)?)),
        tag => Err(TabletError::corruption(format!("unknown value tag {}", tag))),
    }
}

pub fn encode_change_list(changes: &RowChangeList, buf: &mut Vec<u8>) {
    buf.put_u16(changes.changes().len() as u16);
    for change in changes.changes() {
        match change {
            RowChange::SetColumn { column_id, value } => {
                buf.put_u8(CHANGE_SET_COLUMN);
                buf.put_u32(*column_id);
                encode_value(value, buf);
            }
            RowChange::Delete => buf.put_u8(CHANGE_DELETE),
        }
    }
}

pub fn decode_change_list(buf: &mut &[u8]) -> TabletResult<RowChangeList> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let count = buf.get_u16();
    let mut changes = RowChangeList::new();
    for _ in 0..count {
        if !buf.has_remaining() {
            return Err(truncated());
        }
        changes = match buf.get_u8() {
            CHANGE_SET_COLUMN => {
                if buf.remaining() < 4 {
                    return Err(truncated());
                }
                let column_id = buf.get_u32();
                changes.set_column(column_id, decode_value(buf)?)
            }
            CHANGE_DELETE => changes.delete(),
            tag => {
                return Err(TabletError::corruption(format!(
                    "unknown change tag {}",
                    tag
                )))
            }
        };
    }
    Ok(changes)
}

fn truncated() -> super::error::TracedTabletError {
    TabletError::corruption("truncated buffer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let values = [
            DataValue::Null,
            DataValue::Int32(-7),
            DataValue::Int64(1 << 40),
            DataValue::String("héllo".into()),
            DataValue::Blob(vec![0, 255, 3]),
        ];
        for value in &values {
            let mut buf = Vec::new();
            encode_value(value, &mut buf);
            let decoded = decode_value(&mut &buf[..]).unwrap();
            assert_eq!(&decoded, value);
        }
    }

    #[test]
    fn test_change_list_round_trip() {
        let changes = RowChangeList::new()
            .set_column(3, DataValue::Int32(9))
            .delete();
        let mut buf = Vec::new();
        encode_change_list(&changes, &mut buf);
        let decoded = decode_change_list(&mut &buf[..]).unwrap();
        assert_eq!(decoded, changes);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let mut buf = Vec::new();
        encode_value(&DataValue::Int64(1), &mut buf);
        buf.truncate(buf.len() - 1);
        assert!(decode_value(&mut &buf[..]).is_err());
    }
}
