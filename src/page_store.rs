//! The page store (§1: "OUT OF SCOPE... specified only at its interface").
//!
//! `PageStore` is the trait boundary the node manager and the checkpoint
//! path depend on: an ordered key-value engine supporting snapshot reads
//! by a monotonically increasing sequence number, with
//! `get(key, snapshot_seq)` and `put(key, bytes)`. `FilePageStore` is a
//! minimal default implementation so the crate is runnable standalone; it
//! is grounded on the CRC-checksummed record idiom of the block-file and
//! WAL modules rather than on any external database.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::error::{Error, Result, StorageError};
use crate::key::{bytes_from, Bytes};
use crate::varint;

pub trait PageStore: Send + Sync {
    /// Reads the value most recently committed for `key` at or before
    /// `snapshot_seq`; `snapshot_seq == 0` means "latest". Returns `None`
    /// if no such value exists.
    fn get(&self, key: &[u8], snapshot_seq: u64) -> Result<Option<Bytes>>;

    /// Writes `key -> value`, returning the sequence number it committed at.
    fn put(&self, key: &[u8], value: Bytes) -> Result<u64>;

    /// The latest committed sequence number.
    fn committed_seq(&self) -> u64;
}

struct Version {
    seq: u64,
    value: Bytes,
}

struct Inner {
    file: File,
    index: HashMap<Vec<u8>, Vec<Version>>,
}

/// Append-only, CRC-framed key-value log with an in-memory multi-version
/// index, living under `<dbname>_internal/` per §6's directory layout.
pub struct FilePageStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    seq: AtomicU64,
}

const RECORD_MAGIC: u8 = 0xA5;

impl FilePageStore {
    pub fn open<P: AsRef<Path>>(dir: P, create_if_missing: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            if !create_if_missing {
                return Err(StorageError(format!("page store directory missing: {dir:?}")).into());
            }
            std::fs::create_dir_all(&dir)?;
        }
        let path = dir.join("pages.log");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (index, max_seq) = replay(&mut file)?;

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, index }),
            seq: AtomicU64::new(max_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn destroy(dir: &Path) -> Result<()> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

impl PageStore for FilePageStore {
    fn get(&self, key: &[u8], snapshot_seq: u64) -> Result<Option<Bytes>> {
        let inner = self.inner.lock();
        let Some(versions) = inner.index.get(key) else {
            return Ok(None);
        };
        if snapshot_seq == 0 {
            return Ok(versions.last().map(|v| v.value.clone()));
        }
        Ok(versions
            .iter()
            .rev()
            .find(|v| v.seq <= snapshot_seq)
            .map(|v| v.value.clone()))
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<u64> {
        let mut inner = self.inner.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        append_record(&mut inner.file, seq, key, &value)?;
        inner
            .index
            .entry(key.to_vec())
            .or_default()
            .push(Version { seq, value });
        Ok(seq)
    }

    fn committed_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

fn append_record(file: &mut File, seq: u64, key: &[u8], value: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(1 + 8 + 5 + key.len() + 5 + value.len());
    buf.push(RECORD_MAGIC);
    buf.write_u64::<LittleEndian>(seq)?;
    varint::encode_u32(key.len() as u32, &mut buf);
    buf.extend_from_slice(key);
    varint::encode_u32(value.len() as u32, &mut buf);
    buf.extend_from_slice(value);
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.write_u32::<LittleEndian>(hasher.finalize())?;

    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

/// Replays the log to rebuild the in-memory index, truncating a corrupt
/// trailing record the same way the WAL tail-scan does (§8 scenario F is
/// the WAL's version of this; the page store gets the identical treatment
/// for symmetry).
fn replay(file: &mut File) -> Result<(HashMap<Vec<u8>, Vec<Version>>, u64)> {
    let mut index: HashMap<Vec<u8>, Vec<Version>> = HashMap::new();
    let mut max_seq = 0u64;
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut offset = 0usize;
    while offset < buf.len() {
        match parse_record(&buf[offset..]) {
            Some((seq, key, value, consumed)) => {
                max_seq = max_seq.max(seq);
                index.entry(key).or_default().push(Version { seq, value });
                offset += consumed;
            }
            None => break,
        }
    }
    if offset != buf.len() {
        file.set_len(offset as u64)?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok((index, max_seq))
}

fn parse_record(buf: &[u8]) -> Option<(u64, Vec<u8>, Bytes, usize)> {
    if buf.is_empty() || buf[0] != RECORD_MAGIC {
        return None;
    }
    let mut pos = 1usize;
    if buf.len() < pos + 8 {
        return None;
    }
    let seq = u64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?);
    pos += 8;
    let (key_len, n) = varint::decode_u32(&buf[pos..]).ok()?;
    pos += n;
    let key_len = key_len as usize;
    if buf.len() < pos + key_len {
        return None;
    }
    let key = buf[pos..pos + key_len].to_vec();
    pos += key_len;
    let (value_len, n) = varint::decode_u32(&buf[pos..]).ok()?;
    pos += n;
    let value_len = value_len as usize;
    if buf.len() < pos + value_len + 4 {
        return None;
    }
    let value = &buf[pos..pos + value_len];
    pos += value_len;
    let stored_crc = u32::from_le_bytes(buf[pos..pos + 4].try_into().ok()?);
    let record_end = pos + 4;
    let mut hasher = Hasher::new();
    hasher.update(&buf[..pos]);
    if hasher.finalize() != stored_crc {
        return None;
    }
    Some((seq, key, bytes_from(value.to_vec()), record_end))
}

// Fixed little-endian u64 metadata codec helpers, for the keys listed in §6.
pub fn encode_u64(v: u64) -> Bytes {
    bytes_from(v.to_le_bytes().to_vec())
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != 8 {
        return Err(Error::Corruption("metadata value is not 8 bytes".into()));
    }
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub const KEY_LOG_FILE_NUMBER: &str = "LOGFILENUMBER";
pub const KEY_LAST_SEQ_IN_LAST_LOG_FILE: &str = "LastSeqInLastLogFile";
pub const KEY_LAST_CHECKPOINT_SNAPSHOT_SEQ: &str = "LastCheckpointSnapshotSeq";
pub const KEY_NEXT_NODE_ID: &str = "NextNodeId";
pub const KEY_ROOT_PAGE_ID: &str = "RootPageId";
