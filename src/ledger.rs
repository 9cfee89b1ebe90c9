//! Replay ledger: one line per stored execution, mapping a request digest to
//! the result digest it produced.
//!
//! `FileLedger` keeps an index of the latest entry per request and only
//! parses lines appended since its last read. `compact` rewrites the file
//! down to those latest entries; the engine runs it as part of gc.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cas::lock;
use crate::schema::ErrorCode;
use crate::version::{CAS_FORMAT_VERSION, HASH_ALGORITHM_VERSION, REPLAY_LOG_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub replay_log_version: u32,
    pub cas_format_version: u32,
    pub hash_algorithm_version: u32,
    pub request_id: String,
    pub request_digest: String,
    pub result_digest: String,
    /// CAS digest of the stored result document.
    pub record_digest: String,
    pub recorded_at: String,
}

impl LedgerEntry {
    pub fn new(
        request_id: impl Into<String>,
        request_digest: impl Into<String>,
        result_digest: impl Into<String>,
        record_digest: impl Into<String>,
        recorded_at: impl Into<String>,
    ) -> Self {
        Self {
            replay_log_version: REPLAY_LOG_VERSION,
            cas_format_version: CAS_FORMAT_VERSION,
            hash_algorithm_version: HASH_ALGORITHM_VERSION,
            request_id: request_id.into(),
            request_digest: request_digest.into(),
            result_digest: result_digest.into(),
            record_digest: record_digest.into(),
            recorded_at: recorded_at.into(),
        }
    }

    fn check_versions(&self) -> Result<(), LedgerError> {
        let checks = [
            ("replay_log_version", self.replay_log_version, REPLAY_LOG_VERSION),
            ("cas_format_version", self.cas_format_version, CAS_FORMAT_VERSION),
            ("hash_algorithm_version", self.hash_algorithm_version, HASH_ALGORITHM_VERSION),
        ];
        for (field, found, expected) in checks {
            if found != expected {
                return Err(LedgerError::VersionMismatch {
                    field,
                    found,
                    expected,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("version_mismatch: replay log entry has {field} {found}, this build reads {expected}")]
    VersionMismatch {
        field: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("replay log {path} line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("replay log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("replay log encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LedgerError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            LedgerError::Corrupt { .. } | LedgerError::Encode(_) => ErrorCode::JsonParseError,
            LedgerError::Io(_) => ErrorCode::IoError,
        }
    }
}

pub trait Ledger: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;
    /// Latest entry recorded for `request_digest`.
    fn lookup(&self, request_digest: &str) -> Result<Option<LedgerEntry>, LedgerError>;
    fn len(&self) -> Result<usize, LedgerError>;

    fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Default, Debug)]
pub struct InMemoryLedger {
    inner: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for InMemoryLedger {
    fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        entry.check_versions()?;
        let mut g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        g.push(entry.clone());
        Ok(())
    }

    fn lookup(&self, request_digest: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let g = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(g.iter().rev().find(|e| e.request_digest == request_digest).cloned())
    }

    fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.inner.lock().unwrap_or_else(|p| p.into_inner()).len())
    }
}

#[derive(Debug, Default)]
struct Index {
    /// Byte offset just past the last complete line parsed.
    offset: u64,
    file_id: Option<u64>,
    lines: usize,
    entries: usize,
    /// Latest entry per request digest, with its position in the log.
    latest: HashMap<String, (usize, LedgerEntry)>,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Append-only NDJSON file. Writers serialize on a mutex within the process
/// and on `<log>.lock` across processes; each entry is a single `write_all`
/// of one line on an `O_APPEND` handle.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
    index: Mutex<Index>,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            index: Mutex::new(Index::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Brings the index up to date with the file. A replaced or shortened
    /// file is re-read from the start; a torn trailing line is left for the
    /// next call.
    fn refresh(&self) -> Result<MutexGuard<'_, Index>, LedgerError> {
        let mut index = self.index.lock().unwrap_or_else(|p| p.into_inner());
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                *index = Index::default();
                return Ok(index);
            }
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        let id = file_id(&meta);
        if id != index.file_id || meta.len() < index.offset {
            *index = Index {
                file_id: id,
                ..Index::default()
            };
        }
        if meta.len() == index.offset {
            return Ok(index);
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(index.offset))?;
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = reader.read_line(&mut buf)?;
            if n == 0 || !buf.ends_with('\n') {
                break;
            }
            let line = index.lines + 1;
            let text = buf.trim();
            if !text.is_empty() {
                let entry: LedgerEntry =
                    serde_json::from_str(text).map_err(|source| LedgerError::Corrupt {
                        path: self.path.clone(),
                        line,
                        source,
                    })?;
                entry.check_versions()?;
                let seq = index.entries;
                index.entries += 1;
                index.latest.insert(entry.request_digest.clone(), (seq, entry));
            }
            index.lines = line;
            index.offset += n as u64;
        }
        Ok(index)
    }

    /// Rewrites the log keeping only the latest entry per request digest,
    /// in their original order. Returns the number of entries dropped.
    pub fn compact(&self) -> Result<usize, LedgerError> {
        let _g = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let _file_lock = lock::acquire(&self.lock_path())?;
        let mut index = self.refresh()?;
        let dropped = index.entries - index.latest.len();
        if dropped == 0 {
            return Ok(0);
        }

        let mut keep: Vec<&(usize, LedgerEntry)> = index.latest.values().collect();
        keep.sort_by_key(|(seq, _)| *seq);
        let mut tmp_name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        {
            let mut out = io::BufWriter::new(File::create(&tmp)?);
            for (_, entry) in keep {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        *index = Index::default();
        info!(path = %self.path.display(), dropped, "replay log compacted");
        Ok(dropped)
    }
}

impl Ledger for FileLedger {
    fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        entry.check_versions()?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let _g = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _file_lock = lock::acquire(&self.lock_path())?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        debug!(request_digest = %entry.request_digest, "replay log entry appended");
        Ok(())
    }

    fn lookup(&self, request_digest: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self
            .refresh()?
            .latest
            .get(request_digest)
            .map(|(_, entry)| entry.clone()))
    }

    fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.refresh()?.entries)
    }
}
