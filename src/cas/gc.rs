//! Mark-and-sweep garbage collection.
//!
//! Roots are the pin records under `refs/`. An unreferenced object is only
//! reclaimed when it is older than the grace window and its per-object lock
//! is free, so a `put` racing with gc either finishes first (and the object
//! is young) or waits on the lock gc holds while deleting.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{io_at, lock, CasError, CasStore, PinRecord};
use crate::digest::{Digest, DIGEST_HEX_LEN};

#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Objects modified within this window are never reclaimed.
    pub grace: Duration,
    pub dry_run: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct GcSummary {
    pub scanned: usize,
    pub live: usize,
    pub reclaimed: usize,
    pub reclaimed_bytes: u64,
    pub skipped_recent: usize,
    pub skipped_in_flight: usize,
    pub partials_removed: usize,
    /// Superseded replay-log entries dropped. Filled in by the engine.
    pub replay_log_compacted: usize,
    pub dry_run: bool,
}

/// Calls `f` for every well-formed object file under `objects/`.
pub(crate) fn walk_objects(
    objects: &Path,
    f: &mut dyn FnMut(Digest, &Path),
) -> Result<(), CasError> {
    for shard_a in read_dir_or_empty(objects)? {
        for shard_b in read_dir_or_empty(&shard_a)? {
            for file in read_dir_or_empty(&shard_b)? {
                let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.len() != DIGEST_HEX_LEN {
                    continue;
                }
                if let Ok(digest) = name.parse::<Digest>() {
                    f(digest, &file);
                }
            }
        }
    }
    Ok(())
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<std::path::PathBuf>, CasError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.flatten().map(|e| e.path()).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound || e.kind() == io::ErrorKind::NotADirectory => {
            Ok(Vec::new())
        }
        Err(e) => Err(io_at(dir)(e)),
    }
}

/// Union of every digest named by a pin record.
pub fn mark(store: &CasStore) -> Result<BTreeSet<Digest>, CasError> {
    let mut live = BTreeSet::new();
    for namespace in read_dir_or_empty(&store.refs_dir())? {
        for entry in read_dir_or_empty(&namespace)? {
            if !entry.is_file() {
                continue;
            }
            let bytes = fs::read(&entry).map_err(io_at(&entry))?;
            match serde_json::from_slice::<PinRecord>(&bytes) {
                Ok(record) => live.extend(record.digests),
                Err(e) => {
                    // An unreadable root must not let its objects be swept.
                    return Err(CasError::Json(e));
                }
            }
        }
    }
    Ok(live)
}

fn older_than(path: &Path, grace: Duration, now: SystemTime) -> bool {
    path.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age >= grace)
}

pub(crate) fn collect(store: &CasStore, options: &GcOptions) -> Result<GcSummary, CasError> {
    let live = mark(store)?;
    let now = SystemTime::now();
    let mut summary = GcSummary {
        dry_run: options.dry_run,
        ..GcSummary::default()
    };

    let mut candidates = Vec::new();
    walk_objects(&store.objects_dir(), &mut |digest, path| {
        candidates.push((digest, path.to_path_buf()));
    })?;

    for (digest, path) in candidates {
        summary.scanned += 1;
        if live.contains(&digest) {
            summary.live += 1;
            continue;
        }
        if !older_than(&path, options.grace, now) {
            summary.skipped_recent += 1;
            continue;
        }
        let lock_path = store.lock_path(&digest);
        let Some(guard) = lock::try_acquire(&lock_path).map_err(io_at(&lock_path))? else {
            debug!(%digest, "object busy; skipping");
            summary.skipped_in_flight += 1;
            continue;
        };
        // Re-check under the lock: a put may have refreshed it meanwhile.
        if !older_than(&path, options.grace, now) {
            summary.skipped_recent += 1;
            continue;
        }
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        if !options.dry_run {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_at(&path)(e)),
            }
            let _ = fs::remove_file(path.with_extension("meta"));
            // Unlink while still holding it so no waiter locks a stale inode.
            let _ = fs::remove_file(guard.path());
        }
        drop(guard);
        summary.reclaimed += 1;
        summary.reclaimed_bytes += size;
    }

    summary.partials_removed = sweep_partials(store, options, now)?;
    info!(
        scanned = summary.scanned,
        reclaimed = summary.reclaimed,
        reclaimed_bytes = summary.reclaimed_bytes,
        skipped_in_flight = summary.skipped_in_flight,
        dry_run = summary.dry_run,
        "cas gc finished"
    );
    Ok(summary)
}

/// Removes temp files abandoned by crashed writers.
fn sweep_partials(store: &CasStore, options: &GcOptions, now: SystemTime) -> Result<usize, CasError> {
    let mut removed = 0;
    for path in read_dir_or_empty(&store.tmp_dir())? {
        let is_partial = path.extension().and_then(|e| e.to_str()) == Some("partial");
        if !is_partial || !older_than(&path, options.grace, now) {
            continue;
        }
        if options.dry_run {
            removed += 1;
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial"),
        }
    }
    Ok(removed)
}
