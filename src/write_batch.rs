//! Write-batch codec (C7): a sequence of (put/delete, key, value?) ops
//! under a `(sequence, count)` header, per §6.
//!
//! Wire format: `[seq: u64-LE][count: u32-LE][op...]`, each op
//! `[tag: u8][key_len varint][key][value_len varint][value]` (the value
//! fields are absent for Delete).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::{bytes_from, Bytes};
use crate::varint;

const TAG_DELETE: u8 = 0;
const TAG_PUT: u8 = 1;

#[derive(Debug, Clone)]
pub enum Op {
    Put(Bytes, Bytes),
    Delete(Bytes),
}

impl Op {
    pub fn key(&self) -> &Bytes {
        match self {
            Op::Put(k, _) => k,
            Op::Delete(k) => k,
        }
    }
}

/// A group of ops stamped with the sequence of its first op; the i-th op
/// (0-indexed) commits at `sequence + i`.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub sequence: u64,
    pub ops: Vec<Op>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Bytes, value: Bytes) {
        self.ops.push(Op::Put(key, value));
    }

    pub fn delete(&mut self, key: Bytes) {
        self.ops.push(Op::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends `other`'s ops onto `self`, consuming it. Used when a leader
    /// folds followers' batches into one group (§4.6).
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(self.sequence)?;
        buf.write_u32::<LittleEndian>(self.ops.len() as u32)?;
        for op in &self.ops {
            match op {
                Op::Put(k, v) => {
                    buf.push(TAG_PUT);
                    varint::encode_u32(k.len() as u32, &mut buf);
                    buf.extend_from_slice(k);
                    varint::encode_u32(v.len() as u32, &mut buf);
                    buf.extend_from_slice(v);
                }
                Op::Delete(k) => {
                    buf.push(TAG_DELETE);
                    varint::encode_u32(k.len() as u32, &mut buf);
                    buf.extend_from_slice(k);
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let sequence = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut pos = cursor.position() as usize;

        let mut ops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = *buf
                .get(pos)
                .ok_or_else(|| Error::Corruption("write batch truncated before op tag".into()))?;
            pos += 1;
            let (key_len, n) = varint::decode_u32(&buf[pos..])?;
            pos += n;
            let key = require(buf, pos, key_len as usize)?;
            pos += key_len as usize;

            match tag {
                TAG_PUT => {
                    let (value_len, n) = varint::decode_u32(&buf[pos..])?;
                    pos += n;
                    let value = require(buf, pos, value_len as usize)?;
                    pos += value_len as usize;
                    ops.push(Op::Put(bytes_from(key.to_vec()), bytes_from(value.to_vec())));
                }
                TAG_DELETE => ops.push(Op::Delete(bytes_from(key.to_vec()))),
                other => return Err(Error::Corruption(format!("unknown write batch op tag: {other}"))),
            }
        }
        Ok(Self { sequence, ops })
    }
}

fn require(buf: &[u8], pos: usize, len: usize) -> Result<&[u8]> {
    if buf.len() < pos + len {
        return Err(Error::Corruption("write batch truncated".into()));
    }
    Ok(&buf[pos..pos + len])
}
