//! Write-ahead log writer/reader (C6): a framed append-only record stream
//! where one record is one write-batch payload (§6 — "CRC-framed log
//! record reader/writer... only the payload format is specified").
//!
//! Record framing follows the same `[len][payload][crc32]` shape as the
//! page store's append log; replay follows the teacher's tail-scan
//! idiom in `storage/wal.rs` (`scan_wal_tail`) — stop at the first
//! unparseable record and truncate the file there rather than failing
//! the whole open, per §8 scenario F.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::Result;

const RECORD_MAGIC: u8 = 0x5A;

pub struct WalWriter {
    file: File,
    path: PathBuf,
    number: u64,
}

impl WalWriter {
    pub fn file_name(number: u64) -> String {
        format!("{number:06}.log")
    }

    pub fn path_for(dir: &Path, number: u64) -> PathBuf {
        dir.join(Self::file_name(number))
    }

    pub fn create_new(dir: &Path, number: u64) -> Result<Self> {
        let path = Self::path_for(dir, number);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { file, path, number })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one write-batch payload; fsyncs only if `sync` is set,
    /// matching the group-commit rule that non-sync writers never pay for
    /// a sync they did not ask for.
    pub fn append(&mut self, payload: &[u8], sync: bool) -> Result<()> {
        write_record(&mut self.file, payload)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

fn write_record(file: &mut File, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
    buf.push(RECORD_MAGIC);
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.extend_from_slice(payload);
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.write_u32::<LittleEndian>(hasher.finalize())?;
    file.write_all(&buf)?;
    Ok(())
}

/// Lists `<dir>/<number>.log` files with `number > after`, ascending.
pub fn list_log_files(dir: &Path, after: u64) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".log") else { continue };
        let Ok(number) = stem.parse::<u64>() else { continue };
        if number > after {
            files.push((number, entry.path()));
        }
    }
    files.sort_by_key(|(n, _)| *n);
    Ok(files)
}

/// Replays one log file, returning every valid record payload in order. A
/// corrupt or truncated tail record stops replay and truncates the file at
/// that point, logging a diagnostic; prior records are still returned.
pub fn replay_log_file(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut payloads = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        match parse_record(&buf[offset..]) {
            Some((payload, consumed)) => {
                payloads.push(payload);
                offset += consumed;
            }
            None => {
                eprintln!(
                    "wal: truncating corrupt tail of {} at offset {offset}",
                    path.display()
                );
                break;
            }
        }
    }
    if offset != buf.len() {
        file.set_len(offset as u64)?;
        file.seek(SeekFrom::End(0))?;
    }
    Ok(payloads)
}

fn parse_record(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    if buf.is_empty() || buf[0] != RECORD_MAGIC {
        return None;
    }
    if buf.len() < 5 {
        return None;
    }
    let payload_len = u32::from_le_bytes(buf[1..5].try_into().ok()?) as usize;
    let total = 1 + 4 + payload_len + 4;
    if buf.len() < total {
        return None;
    }
    let payload = &buf[5..5 + payload_len];
    let stored_crc = u32::from_le_bytes(buf[5 + payload_len..total].try_into().ok()?);
    let mut hasher = Hasher::new();
    hasher.update(&buf[..5 + payload_len]);
    if hasher.finalize() != stored_crc {
        return None;
    }
    Some((payload.to_vec(), total))
}
