//! Per-transaction write-ahead log.
//!
//! Each transaction owns one append-only file, `<log_dir>/<txnId>.log`:
//!
//! ```text
//! +-----------+-------------+------------------------------------+
//! | b"CLGWAL" | version u16 | frame*                             |
//! +-----------+-------------+------------------------------------+
//! frame = payload length (u32 LE) ++ bincode(LogRecord)
//! ```
//!
//! A crash in the middle of an append leaves a torn final frame. Opening the
//! log truncates it away; every earlier frame was complete when its append
//! returned.

pub mod record;

use log::{debug, error, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{CollageError, Result};
use crate::types::{Decision, Phase, TxnId};

pub use record::{LogRecord, TransactionParams};

const MAGIC: &[u8; 6] = b"CLGWAL";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;
const FRAME_PREFIX_LEN: usize = 4;
const LOG_EXTENSION: &str = "log";

/// The write-ahead log of a single transaction.
///
/// Records are kept in memory as well, so lookups never re-read the file.
#[derive(Debug)]
pub struct Wal {
    txn_id: TxnId,
    path: PathBuf,
    file: File,
    len: u64,
    records: Vec<LogRecord>,
    /// Set when a partial frame could not be cut off. Appending after it
    /// would leave an undecodable frame in the middle of the log.
    broken: bool,
    #[cfg(test)]
    failing_appends: usize,
}

impl Wal {
    /// Returns the file backing the log of `txn_id` in `dir`.
    pub fn path_for(dir: &Path, txn_id: &TxnId) -> PathBuf {
        dir.join(format!("{txn_id}.{LOG_EXTENSION}"))
    }

    /// Opens the log of `txn_id`, creating it (and `dir`) if needed.
    ///
    /// Existing records are replayed into memory and a torn final frame is
    /// truncated.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::CorruptLog`] if the header is not a known log
    /// header or a frame other than the last one cannot be decoded, and
    /// [`CollageError::Io`] on file system failures.
    pub fn open(dir: &Path, txn_id: &TxnId) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, txn_id);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (records, len) = if bytes.len() < HEADER_LEN {
            if !MAGIC.starts_with(&bytes[..bytes.len().min(MAGIC.len())]) {
                return Err(corrupt(&path, "unknown log header"));
            }
            // New file, or a crash while the header was being written.
            file.set_len(0)?;
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            sync_dir(dir)?;
            debug!("Created transaction log {}", path.display());
            (Vec::new(), HEADER_LEN)
        } else {
            let (records, valid_len) = replay(&path, &bytes)?;
            if valid_len < bytes.len() {
                warn!(
                    "Truncating torn tail of {} ({} of {} bytes valid)",
                    path.display(),
                    valid_len,
                    bytes.len()
                );
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
            (records, valid_len)
        };

        Ok(Self {
            txn_id: txn_id.clone(),
            path,
            file,
            len: len as u64,
            records,
            broken: false,
            #[cfg(test)]
            failing_appends: 0,
        })
    }

    /// Appends a record. The bytes reach the OS before this returns but are
    /// only durable after [`Wal::sync`].
    ///
    /// # Errors
    ///
    /// A failed write is cut back off the file. If that fails too the log
    /// refuses every later append with [`CollageError::CorruptLog`]; reopening
    /// it truncates the partial frame.
    pub fn append(&mut self, record: LogRecord) -> Result<()> {
        if self.broken {
            return Err(corrupt(&self.path, "a failed append could not be undone"));
        }
        let payload = bincode::serialize(&record)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            corrupt(&self.path, "record exceeds the maximum frame length")
        })?;
        let mut frame = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        if let Err(e) = self.write_frame(&frame) {
            if let Err(truncate) = self.file.set_len(self.len) {
                error!(
                    "Could not cut a failed append off {}: {}",
                    self.path.display(),
                    truncate
                );
                self.broken = true;
            }
            return Err(e.into());
        }
        self.len += frame.len() as u64;
        self.records.push(record);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if self.failing_appends > 0 {
                self.failing_appends -= 1;
                return Err(std::io::Error::other("simulated write failure"));
            }
        }
        self.file.write_all(frame)
    }

    /// Makes the next `count` appends fail as if the disk refused the write.
    #[cfg(test)]
    pub(crate) fn fail_next_appends(&mut self, count: usize) {
        self.failing_appends = count;
    }

    /// Blocks until every appended record is on stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Appends a record and makes it durable.
    pub fn append_durable(&mut self, record: LogRecord) -> Result<()> {
        self.append(record)?;
        self.sync()
    }

    pub fn txn_id(&self) -> &TxnId {
        &self.txn_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Coordinator parameters, present only if they are the first record.
    pub fn params(&self) -> Option<&TransactionParams> {
        match self.records.first() {
            Some(LogRecord::Params(params)) => Some(params),
            _ => None,
        }
    }

    /// The last phase marker, which recovery treats as authoritative.
    pub fn last_phase(&self) -> Option<Phase> {
        self.records.iter().rev().find_map(|record| match record {
            LogRecord::Phase { txn_id, phase } if *txn_id == self.txn_id => Some(*phase),
            _ => None,
        })
    }

    /// The vote recorded for this transaction, if any.
    pub fn recorded_vote(&self) -> Option<(bool, &[String])> {
        self.records.iter().find_map(|record| match record {
            LogRecord::Vote {
                txn_id,
                vote,
                files,
            } if *txn_id == self.txn_id => Some((*vote, files.as_slice())),
            _ => None,
        })
    }

    /// The decision this node already acknowledged, if any.
    pub fn recorded_ack(&self) -> Option<Decision> {
        self.records.iter().find_map(|record| match record {
            LogRecord::Ack { txn_id, decision } if *txn_id == self.txn_id => Some(*decision),
            _ => None,
        })
    }

    /// Closes and deletes the log. Called once the transaction is done.
    pub fn remove(self) -> Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        fs::remove_file(&path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        debug!("Deleted transaction log {}", path.display());
        Ok(())
    }
}

fn replay(path: &Path, bytes: &[u8]) -> Result<(Vec<LogRecord>, usize)> {
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt(path, "unknown log header"));
    }
    let version = u16::from_le_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(path, &format!("unsupported log version {version}")));
    }

    let mut records = Vec::new();
    let mut offset = HEADER_LEN;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < FRAME_PREFIX_LEN {
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let Some(payload) = rest.get(FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + len) else {
            break;
        };
        let end = offset + FRAME_PREFIX_LEN + len;
        match bincode::deserialize::<LogRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) if end == bytes.len() => break,
            Err(e) => {
                return Err(corrupt(path, &format!("undecodable record at offset {offset}: {e}")));
            }
        }
        offset = end;
    }

    Ok((records, offset))
}

/// Lists the transactions that have a log in `dir`.
///
/// A missing directory means there is nothing to recover. Files that are not
/// transaction logs are ignored.
pub fn list_transactions(dir: &Path) -> Result<Vec<TxnId>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        match path.file_stem().and_then(|stem| stem.to_str()).map(TxnId::parse) {
            Some(Ok(id)) => ids.push(id),
            _ => warn!("Ignoring unexpected file {} in log directory", path.display()),
        }
    }
    ids.sort();
    Ok(ids)
}

/// Makes directory entry changes (creation, rename, removal) durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn corrupt(path: &Path, reason: &str) -> CollageError {
    CollageError::CorruptLog {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
