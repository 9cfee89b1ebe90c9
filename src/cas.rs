//! Content-addressable store, layout v2.
//!
//! ```text
//! <base>/cas/v2/
//!   FORMAT                      layout marker (format + hash versions)
//!   objects/AB/CD/<digest>      immutable content
//!   objects/AB/CD/<digest>.meta sidecar: size, encoding
//!   refs/<namespace>/<name>     pinning roots for gc
//!   locks/<digest>.lock         per-object advisory locks
//!   tmp/*.partial               writes in flight
//!   replay.log                  append-only replay ledger
//! ```
//!
//! Objects are written to `tmp/`, fsynced and renamed into place, so a digest
//! is either fully present or absent. Reads re-hash the content.

pub mod gc;
pub mod lock;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::{Digest, DigestError};
use crate::observability::log_cas_operation;
use crate::schema::ErrorCode;
use crate::version::{CAS_FORMAT_VERSION, CAS_LAYOUT_DIR, HASH_ALGORITHM_VERSION, HASH_PRIMITIVE};

pub use gc::{GcOptions, GcSummary};

const OBJECTS_DIR: &str = "objects";
const REFS_DIR: &str = "refs";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const FORMAT_FILE: &str = "FORMAT";
const META_EXT: &str = "meta";
pub const REPLAY_LOG_FILE: &str = "replay.log";

/// Default base directory when no `--cas` is given.
pub const DEFAULT_CAS_BASE: &str = ".detexec";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum CasError {
    #[error("invalid_digest: {0}")]
    InvalidDigest(#[from] DigestError),

    #[error("cas_integrity_failed: object {digest} hashes to {actual}")]
    Integrity { digest: String, actual: String },

    #[error("version_mismatch: CAS layout is format v{found}, this build reads v{expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("version_mismatch: CAS layout marker disagrees: {0}")]
    FormatMarker(String),

    #[error("schema_violation: invalid ref name {0:?}")]
    InvalidRefName(String),

    #[error("CAS I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CAS metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CasError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CasError::InvalidDigest(_) => ErrorCode::InvalidDigest,
            CasError::Integrity { .. } | CasError::Json(_) => ErrorCode::CasIntegrityFailed,
            CasError::VersionMismatch { .. } | CasError::FormatMarker(_) => {
                ErrorCode::VersionMismatch
            }
            CasError::InvalidRefName(_) => ErrorCode::SchemaViolation,
            CasError::Io { .. } => ErrorCode::IoError,
        }
    }
}

pub(crate) fn io_at(path: &Path) -> impl FnOnce(io::Error) -> CasError + '_ {
    move |source| CasError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatMarker {
    pub cas_format_version: u32,
    pub hash_algorithm_version: u32,
    pub hash_primitive: String,
}

impl FormatMarker {
    pub fn current() -> Self {
        Self {
            cas_format_version: CAS_FORMAT_VERSION,
            hash_algorithm_version: HASH_ALGORITHM_VERSION,
            hash_primitive: HASH_PRIMITIVE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub digest: Digest,
    pub size: u64,
    pub encoding: String,
    pub hash_algorithm_version: u32,
}

/// A pinning root. Everything listed in `digests` survives gc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinRecord {
    pub kind: String,
    pub digests: Vec<Digest>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub cas_format_version: u32,
}

impl PinRecord {
    pub fn new(kind: impl Into<String>, digests: Vec<Digest>) -> Self {
        Self {
            kind: kind.into(),
            digests,
            labels: BTreeMap::new(),
            cas_format_version: CAS_FORMAT_VERSION,
        }
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CasCounters {
    pub puts: u64,
    pub put_hits: u64,
    pub gets: u64,
    pub get_misses: u64,
    pub bytes_written: u64,
    pub integrity_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    puts: AtomicU64,
    put_hits: AtomicU64,
    gets: AtomicU64,
    get_misses: AtomicU64,
    bytes_written: AtomicU64,
    integrity_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VerifySummary {
    pub checked: usize,
    pub corrupt: Vec<String>,
}

#[derive(Debug)]
pub struct CasStore {
    root: PathBuf,
    counters: AtomicCounters,
}

impl CasStore {
    /// Opens (creating if needed) the v2 layout under `base`. `base` may also
    /// point directly at a `.../cas/v2` directory.
    pub fn open(base: impl AsRef<Path>) -> Result<Self, CasError> {
        let base = base.as_ref();
        let cas_dir = if base.file_name().and_then(|n| n.to_str()) == Some(CAS_LAYOUT_DIR)
            && base.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) == Some("cas")
        {
            base.parent().map(Path::to_path_buf).unwrap_or_else(|| base.join("cas"))
        } else {
            base.join("cas")
        };
        check_no_newer_layout(&cas_dir)?;

        let root = cas_dir.join(CAS_LAYOUT_DIR);
        for dir in [OBJECTS_DIR, REFS_DIR, LOCKS_DIR, TMP_DIR] {
            let p = root.join(dir);
            fs::create_dir_all(&p).map_err(io_at(&p))?;
        }
        let store = Self {
            root,
            counters: AtomicCounters::default(),
        };
        store.check_format_marker()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn replay_log_path(&self) -> PathBuf {
        self.root.join(REPLAY_LOG_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(crate::audit::AUDIT_LOG_FILE)
    }

    fn check_format_marker(&self) -> Result<(), CasError> {
        let path = self.root.join(FORMAT_FILE);
        match fs::read(&path) {
            Ok(bytes) => {
                let marker: FormatMarker = serde_json::from_slice(&bytes)
                    .map_err(|e| CasError::FormatMarker(e.to_string()))?;
                if marker.cas_format_version != CAS_FORMAT_VERSION {
                    return Err(CasError::VersionMismatch {
                        expected: CAS_FORMAT_VERSION,
                        found: marker.cas_format_version,
                    });
                }
                if marker != FormatMarker::current() {
                    return Err(CasError::FormatMarker(format!(
                        "hash {} v{} (expected {} v{})",
                        marker.hash_primitive,
                        marker.hash_algorithm_version,
                        HASH_PRIMITIVE,
                        HASH_ALGORITHM_VERSION
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let bytes = serde_json::to_vec_pretty(&FormatMarker::current())?;
                self.write_atomic(&path, &bytes)
            }
            Err(e) => Err(io_at(&path)(e)),
        }
    }

    pub(crate) fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join(OBJECTS_DIR)
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    fn meta_path(&self, digest: &Digest) -> PathBuf {
        self.object_path(digest).with_extension(META_EXT)
    }

    pub(crate) fn lock_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{digest}.lock"))
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub(crate) fn refs_dir(&self) -> PathBuf {
        self.root.join(REFS_DIR)
    }

    pub(crate) fn objects_dir(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    /// Writes `bytes` under `dest` via a unique temp file and rename.
    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), CasError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = self
            .tmp_dir()
            .join(format!("{name}.{}.{n}.partial", std::process::id()));
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, dest)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(io_at(dest)(e));
        }
        Ok(())
    }

    /// Stores `bytes` and returns their digest.
    pub fn put(&self, bytes: &[u8]) -> Result<Digest, CasError> {
        let digest = Digest::of(bytes);
        self.put_with_digest(&digest, bytes)?;
        Ok(digest)
    }

    /// Stores `bytes` under a caller-supplied digest. Re-putting identical
    /// content is a no-op; content that does not hash to `digest` is rejected.
    pub fn put_with_digest(&self, digest: &Digest, bytes: &[u8]) -> Result<(), CasError> {
        let actual = Digest::of(bytes);
        if actual != *digest {
            return Err(CasError::Integrity {
                digest: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        let lock_path = self.lock_path(digest);
        let _lock = lock::acquire(&lock_path).map_err(io_at(&lock_path))?;
        let object_path = self.object_path(digest);

        if object_path.exists() {
            match self.read_verified(digest, &object_path) {
                Ok(_) => {
                    // Refresh mtime so a concurrent gc grace window covers the
                    // caller until it pins the object.
                    touch(&object_path);
                    self.counters.put_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(%digest, "cas hit");
                    return Ok(());
                }
                Err(CasError::Integrity { .. }) => {
                    warn!(%digest, "replacing corrupt CAS object");
                }
                Err(e) => return Err(e),
            }
        }

        self.write_atomic(&object_path, bytes)?;
        let info = ObjectInfo {
            digest: *digest,
            size: bytes.len() as u64,
            encoding: "identity".to_string(),
            hash_algorithm_version: HASH_ALGORITHM_VERSION,
        };
        self.write_atomic(&self.meta_path(digest), &serde_json::to_vec(&info)?)?;
        self.counters
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        log_cas_operation("put", &digest.to_hex(), bytes.len() as u64, true);
        Ok(())
    }

    fn read_verified(&self, digest: &Digest, path: &Path) -> Result<Vec<u8>, CasError> {
        let bytes = fs::read(path).map_err(io_at(path))?;
        let actual = Digest::of(&bytes);
        if actual != *digest {
            self.counters
                .integrity_failures
                .fetch_add(1, Ordering::Relaxed);
            log_cas_operation("verify", &digest.to_hex(), bytes.len() as u64, false);
            return Err(CasError::Integrity {
                digest: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(bytes)
    }

    /// Returns the content, or `None` when absent. Never returns bytes that
    /// do not hash to `digest`.
    pub fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>, CasError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let path = self.object_path(digest);
        if !path.exists() {
            self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.read_verified(digest, &path).map(Some)
    }

    /// `get` keyed by a hex string, rejecting malformed digests.
    pub fn get_hex(&self, digest: &str) -> Result<Option<Vec<u8>>, CasError> {
        let digest: Digest = digest.parse()?;
        self.get(&digest)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).is_file()
    }

    pub fn info(&self, digest: &Digest) -> Result<Option<ObjectInfo>, CasError> {
        let path = self.object_path(digest);
        let meta = match path.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_at(&path)(e)),
        };
        match fs::read(self.meta_path(digest)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(_) => Ok(Some(ObjectInfo {
                digest: *digest,
                size: meta.len(),
                encoding: "identity".to_string(),
                hash_algorithm_version: HASH_ALGORITHM_VERSION,
            })),
        }
    }

    /// Every object digest on disk, sorted.
    pub fn scan_objects(&self) -> Result<Vec<Digest>, CasError> {
        let mut out = Vec::new();
        gc::walk_objects(&self.objects_dir(), &mut |digest, _path| out.push(digest))?;
        out.sort();
        Ok(out)
    }

    /// Re-hashes every object.
    pub fn verify_all(&self) -> Result<VerifySummary, CasError> {
        let mut summary = VerifySummary::default();
        for digest in self.scan_objects()? {
            summary.checked += 1;
            match self.read_verified(&digest, &self.object_path(&digest)) {
                Ok(_) => {}
                Err(CasError::Integrity { .. }) => summary.corrupt.push(digest.to_hex()),
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    fn ref_path(&self, namespace: &str, name: &str) -> Result<PathBuf, CasError> {
        for part in [namespace, name] {
            let valid = !part.is_empty()
                && !part.starts_with('.')
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !valid {
                return Err(CasError::InvalidRefName(part.to_string()));
            }
        }
        Ok(self.refs_dir().join(namespace).join(name))
    }

    /// Writes (or replaces) a pinning root.
    pub fn pin(&self, namespace: &str, name: &str, record: &PinRecord) -> Result<(), CasError> {
        let path = self.ref_path(namespace, name)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&path, &bytes)
    }

    pub fn read_pin(&self, namespace: &str, name: &str) -> Result<Option<PinRecord>, CasError> {
        let path = self.ref_path(namespace, name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_at(&path)(e)),
        }
    }

    pub fn unpin(&self, namespace: &str, name: &str) -> Result<bool, CasError> {
        let path = self.ref_path(namespace, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_at(&path)(e)),
        }
    }

    pub fn counters(&self) -> CasCounters {
        let c = &self.counters;
        CasCounters {
            puts: c.puts.load(Ordering::Relaxed),
            put_hits: c.put_hits.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            get_misses: c.get_misses.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            integrity_failures: c.integrity_failures.load(Ordering::Relaxed),
        }
    }

    /// Mark-and-sweep collection; see [`gc`].
    pub fn gc(&self, options: &GcOptions) -> Result<GcSummary, CasError> {
        gc::collect(self, options)
    }
}

fn touch(path: &Path) {
    if let Ok(file) = File::options().write(true).open(path) {
        let _ = file.set_modified(std::time::SystemTime::now());
    }
}

/// Refuses to open a store that a newer layout has taken over.
fn check_no_newer_layout(cas_dir: &Path) -> Result<(), CasError> {
    let entries = match fs::read_dir(cas_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_at(cas_dir)(e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(version) = name
            .to_str()
            .and_then(|n| n.strip_prefix('v'))
            .and_then(|v| v.parse::<u32>().ok())
        else {
            continue;
        };
        if version > CAS_FORMAT_VERSION && entry.path().is_dir() {
            return Err(CasError::VersionMismatch {
                expected: CAS_FORMAT_VERSION,
                found: version,
            });
        }
    }
    Ok(())
}
