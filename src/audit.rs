//! Hash-chained audit log.
//!
//! `audit.log` under the CAS root holds one canonical JSON line per stored
//! execution. Each line names the BLAKE3 digest of the line before it in
//! `prev`, so editing, dropping or reordering a line breaks the chain at the
//! next one. Nothing is ever rewritten; gc leaves this file alone.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::canonical;
use crate::cas::lock;
use crate::digest::Digest;
use crate::schema::{ErrorCode, ExecutionResult};
use crate::version::{
    AUDIT_LOG_VERSION, CAS_FORMAT_VERSION, ENGINE_ABI_VERSION, ENGINE_SEMVER,
    HASH_ALGORITHM_VERSION,
};

pub const AUDIT_LOG_FILE: &str = "audit.log";

/// `prev` of the first record.
pub const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One stored execution, as it appears in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub audit_log_version: u32,
    /// 1-based position in the log.
    pub seq: u64,
    /// Digest of the previous line, or [`GENESIS`].
    pub prev: String,
    pub request_id: String,
    pub request_digest: String,
    pub result_digest: String,
    /// CAS digest of the stored result document.
    pub record_digest: String,
    pub engine_semver: String,
    pub engine_abi_version: u32,
    pub hash_algorithm_version: u32,
    pub cas_format_version: u32,
    pub ok: bool,
    pub error_code: ErrorCode,
    pub duration_ms: u64,
    pub recorded_at: String,
    pub worker_id: String,
    pub node_id: String,
}

impl ProvenanceRecord {
    /// Record for `result`. `seq` and `prev` are assigned by [`AuditLog::append`].
    pub fn for_result(
        result: &ExecutionResult,
        record: &Digest,
        worker_id: impl Into<String>,
        node_id: impl Into<String>,
        recorded_at: impl Into<String>,
    ) -> Self {
        Self {
            audit_log_version: AUDIT_LOG_VERSION,
            seq: 0,
            prev: String::new(),
            request_id: result.request_id.clone(),
            request_digest: result.request_digest.clone(),
            result_digest: result.result_digest.clone(),
            record_digest: record.to_hex(),
            engine_semver: ENGINE_SEMVER.to_string(),
            engine_abi_version: ENGINE_ABI_VERSION,
            hash_algorithm_version: HASH_ALGORITHM_VERSION,
            cas_format_version: CAS_FORMAT_VERSION,
            ok: result.ok,
            error_code: result.error_code,
            duration_ms: result.duration_ms,
            recorded_at: recorded_at.into(),
            worker_id: worker_id.into(),
            node_id: node_id.into(),
        }
    }

    /// The exact text written to the log, without the newline.
    pub fn canonical_line(&self) -> Result<String, AuditError> {
        Ok(canonical::to_canonical_string(&serde_json::to_value(self)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("audit log encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AuditError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuditError::Io(_) => ErrorCode::IoError,
            AuditError::Encode(_) => ErrorCode::JsonParseError,
        }
    }
}

/// Where the chain first stops holding.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditBreak {
    pub line: usize,
    pub error_code: ErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditReport {
    pub ok: bool,
    pub error_code: ErrorCode,
    /// Lines checked before the first break, or all of them.
    pub entries: u64,
    /// Digest of the last intact line. Compare against a copy kept elsewhere
    /// to detect truncation or an edited final line.
    pub head_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_break: Option<AuditBreak>,
}

#[derive(Debug, Clone)]
struct Tail {
    offset: u64,
    seq: u64,
    head: String,
}

impl Default for Tail {
    fn default() -> Self {
        Self {
            offset: 0,
            seq: 0,
            head: GENESIS.to_string(),
        }
    }
}

/// Append-only handle on an audit log file. Appends from several handles or
/// processes serialize on `<log>.lock`.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    tail: Mutex<Tail>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tail: Mutex::new(Tail::default()),
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

    /// Advances `tail` over lines other writers appended. Lines are chained
    /// by their raw bytes, so a damaged line does not stop new appends; a
    /// torn final line left by a crash is cut off. Caller holds the file lock.
    fn catch_up(&self, tail: &mut Tail) -> Result<(), AuditError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                *tail = Tail::default();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < tail.offset {
            warn!(path = %self.path.display(), "audit log shrank; re-reading from the start");
            *tail = Tail::default();
        }
        if len == tail.offset {
            return Ok(());
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(tail.offset))?;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                warn!(path = %self.path.display(), bytes = n, "dropping torn audit log line");
                OpenOptions::new().write(true).open(&self.path)?.set_len(tail.offset)?;
                break;
            }
            tail.seq += 1;
            tail.head = Digest::of(&buf[..n - 1]).to_hex();
            tail.offset += n as u64;
        }
        Ok(())
    }

    /// Assigns `seq` and `prev`, writes the line and returns the record as
    /// written.
    pub fn append(&self, mut record: ProvenanceRecord) -> Result<ProvenanceRecord, AuditError> {
        let mut tail = self.tail.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _file_lock = lock::acquire(&self.lock_path())?;
        self.catch_up(&mut tail)?;

        record.audit_log_version = AUDIT_LOG_VERSION;
        record.seq = tail.seq + 1;
        record.prev = tail.head.clone();
        let line = record.canonical_line()?;
        let mut bytes = line.into_bytes();
        let head = Digest::of(&bytes).to_hex();
        bytes.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_data()?;

        tail.seq = record.seq;
        tail.head = head;
        tail.offset += bytes.len() as u64;
        debug!(seq = record.seq, request_digest = %record.request_digest, "audit record appended");
        Ok(record)
    }

    pub fn verify(&self) -> Result<AuditReport, AuditError> {
        self.verify_with(|_| None)
    }

    /// Walks the whole chain. `check` may reject an otherwise intact record
    /// by returning a reason; it is reported as a `cas_integrity_failed`
    /// break.
    pub fn verify_with(
        &self,
        mut check: impl FnMut(&ProvenanceRecord) -> Option<String>,
    ) -> Result<AuditReport, AuditError> {
        let mut report = AuditReport {
            ok: true,
            error_code: ErrorCode::None,
            entries: 0,
            head_digest: GENESIS.to_string(),
            first_break: None,
        };
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let fail = |code: ErrorCode, reason: String| AuditBreak {
                line: idx + 1,
                error_code: code,
                reason,
            };
            let found = match serde_json::from_str::<ProvenanceRecord>(&line) {
                Err(e) => Some(fail(ErrorCode::JsonParseError, e.to_string())),
                Ok(record) => chain_break(&record, &line, &report)
                    .map(|reason| fail(ErrorCode::CasIntegrityFailed, reason))
                    .or_else(|| {
                        (record.audit_log_version != AUDIT_LOG_VERSION).then(|| {
                            fail(
                                ErrorCode::VersionMismatch,
                                format!(
                                    "audit_log_version {} (this build reads {AUDIT_LOG_VERSION})",
                                    record.audit_log_version
                                ),
                            )
                        })
                    })
                    .or_else(|| check(&record).map(|r| fail(ErrorCode::CasIntegrityFailed, r))),
            };
            if let Some(found) = found {
                report.ok = false;
                report.error_code = found.error_code;
                report.first_break = Some(found);
                break;
            }
            report.entries += 1;
            report.head_digest = Digest::of(line.as_bytes()).to_hex();
        }
        Ok(report)
    }
}

fn chain_break(record: &ProvenanceRecord, line: &str, so_far: &AuditReport) -> Option<String> {
    if record.seq != so_far.entries + 1 {
        return Some(format!("seq {} where {} was expected", record.seq, so_far.entries + 1));
    }
    if record.prev != so_far.head_digest {
        return Some(format!("prev does not match the digest of line {}", so_far.entries));
    }
    match record.canonical_line() {
        Ok(canonical) if canonical == line => None,
        _ => Some("line is not in canonical form".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u8) -> ProvenanceRecord {
        let result = ExecutionResult {
            ok: true,
            request_id: format!("req-{n}"),
            request_digest: format!("{n:02x}").repeat(32),
            result_digest: format!("{:02x}", n + 100).repeat(32),
            duration_ms: 7,
            ..ExecutionResult::default()
        };
        ProvenanceRecord::for_result(
            &result,
            &Digest::of(&[n]),
            "w-1",
            "node-a",
            "1970-01-01T00:00:00.000Z",
        )
    }

    fn rewrite_line(path: &Path, idx: usize, edit: impl FnOnce(&mut ProvenanceRecord)) {
        let text = std::fs::read_to_string(path).unwrap();
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut rec: ProvenanceRecord = serde_json::from_str(&lines[idx]).unwrap();
        edit(&mut rec);
        lines[idx] = rec.canonical_line().unwrap();
        std::fs::write(path, format!("{}\n", lines.join("\n"))).unwrap();
    }

    #[test]
    fn test_append_links_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(AUDIT_LOG_FILE));
        let first = log.append(record(1)).unwrap();
        let second = log.append(record(2)).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.prev, GENESIS);
        assert_eq!(second.seq, 2);
        assert_eq!(second.prev, Digest::of(first.canonical_line().unwrap().as_bytes()).to_hex());

        let report = log.verify().unwrap();
        assert!(report.ok, "{report:?}");
        assert_eq!(report.entries, 2);
        assert_eq!(
            report.head_digest,
            Digest::of(second.canonical_line().unwrap().as_bytes()).to_hex()
        );
    }

    #[test]
    fn test_handles_continue_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUDIT_LOG_FILE);
        let a = AuditLog::new(&path);
        let b = AuditLog::new(&path);
        a.append(record(1)).unwrap();
        assert_eq!(b.append(record(2)).unwrap().seq, 2);
        assert_eq!(a.append(record(3)).unwrap().seq, 3);
        assert!(AuditLog::new(&path).verify().unwrap().ok);
    }

    #[test]
    fn test_edited_record_breaks_the_next_link() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUDIT_LOG_FILE);
        let log = AuditLog::new(&path);
        for n in 1..=3 {
            log.append(record(n)).unwrap();
        }
        rewrite_line(&path, 1, |r| r.result_digest = "ee".repeat(32));

        let report = AuditLog::new(&path).verify().unwrap();
        assert!(!report.ok);
        assert_eq!(report.error_code, ErrorCode::CasIntegrityFailed);
        assert_eq!(report.entries, 2);
        assert_eq!(report.first_break.unwrap().line, 3);
    }

    #[test]
    fn test_dropped_record_breaks_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUDIT_LOG_FILE);
        let log = AuditLog::new(&path);
        for n in 1..=3 {
            log.append(record(n)).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = text.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        std::fs::write(&path, format!("{}\n", kept.join("\n"))).unwrap();

        let report = AuditLog::new(&path).verify().unwrap();
        let found = report.first_break.unwrap();
        assert_eq!(found.line, 2);
        assert!(found.reason.contains("seq 3"), "{}", found.reason);
    }

    #[test]
    fn test_garbage_and_foreign_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUDIT_LOG_FILE);
        std::fs::write(&path, "{not json\n").unwrap();
        assert_eq!(
            AuditLog::new(&path).verify().unwrap().error_code,
            ErrorCode::JsonParseError
        );

        std::fs::remove_file(&path).unwrap();
        AuditLog::new(&path).append(record(1)).unwrap();
        rewrite_line(&path, 0, |r| r.audit_log_version = 9);
        assert_eq!(
            AuditLog::new(&path).verify().unwrap().error_code,
            ErrorCode::VersionMismatch
        );
    }

    #[test]
    fn test_torn_tail_is_cut_before_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUDIT_LOG_FILE);
        AuditLog::new(&path).append(record(1)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,").unwrap();

        let appended = AuditLog::new(&path).append(record(2)).unwrap();
        assert_eq!(appended.seq, 2);
        let report = AuditLog::new(&path).verify().unwrap();
        assert!(report.ok, "{report:?}");
        assert_eq!(report.entries, 2);
    }

    #[test]
    fn test_missing_log_verifies_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = AuditLog::new(dir.path().join(AUDIT_LOG_FILE)).verify().unwrap();
        assert!(report.ok);
        assert_eq!(report.entries, 0);
        assert_eq!(report.head_digest, GENESIS);
    }

    #[test]
    fn test_check_hook_rejects_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(AUDIT_LOG_FILE));
        log.append(record(1)).unwrap();
        log.append(record(2)).unwrap();
        let report = log
            .verify_with(|r| (r.seq == 2).then(|| "stored record disagrees".to_string()))
            .unwrap();
        assert_eq!(report.error_code, ErrorCode::CasIntegrityFailed);
        assert_eq!(report.entries, 1);
    }
}
