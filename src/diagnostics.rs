//! Read-only operational reports: health, doctor, validate-replacement,
//! version, metrics and status. Each renders as one JSON document.

use std::path::PathBuf;

use serde::Serialize;

use crate::cas::{CasCounters, CasStore};
use crate::config::ENV_INHIBITOR;
use crate::digest::{hash_health, self_test, HASH_BACKEND, HASH_VERSION};
use crate::engine::Engine;
use crate::sandbox::{capabilities, SandboxCapabilities};
use crate::stats::StatsSnapshot;
use crate::version::{
    manifest, VersionManifest, CAS_FORMAT_VERSION, CAS_LAYOUT_DIR, ENGINE_SEMVER,
    HASH_ALGORITHM_VERSION, HASH_PRIMITIVE, PROTOCOL_VERSION,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub ok: bool,
    pub hash_primitive: &'static str,
    pub hash_backend: &'static str,
    pub hash_version: &'static str,
    pub hash_available: bool,
    pub compat_warning: bool,
    pub cas_version: &'static str,
    pub compression_capabilities: Vec<&'static str>,
}

pub fn health() -> HealthReport {
    let h = hash_health();
    HealthReport {
        ok: h.hash_available && !h.compat_warning,
        hash_primitive: h.hash_primitive,
        hash_backend: h.hash_backend,
        hash_version: h.hash_version,
        hash_available: h.hash_available,
        compat_warning: h.compat_warning,
        cas_version: CAS_LAYOUT_DIR,
        compression_capabilities: vec!["identity"],
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RollbackStatus {
    pub available: bool,
    pub mechanism: &'static str,
    pub engaged: bool,
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CasStatus {
    pub root: PathBuf,
    pub initialized: bool,
    pub writable: bool,
    pub cas_format_version: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DoctorReport {
    pub ok: bool,
    pub blockers: Vec<String>,
    pub engine_version: &'static str,
    pub protocol_version: &'static str,
    pub hash_primitive: &'static str,
    pub hash_backend: &'static str,
    pub hash_version: &'static str,
    pub sandbox: SandboxCapabilities,
    pub cas: CasStatus,
    pub rollback: RollbackStatus,
}

/// Checks the configured store without creating it.
fn cas_status(engine: &Engine) -> CasStatus {
    let base = engine.config().cas_root.clone();
    let root = base.join("cas").join(CAS_LAYOUT_DIR);
    if !root.exists() {
        let writable = nearest_existing(&base)
            .and_then(|p| p.metadata().ok())
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false);
        return CasStatus {
            root,
            initialized: false,
            writable,
            cas_format_version: CAS_FORMAT_VERSION,
        };
    }
    let writable = match engine.cas_if_open() {
        Some(_) => true,
        None => CasStore::open(&base).is_ok(),
    } && can_write(&root.join("tmp"));
    CasStatus {
        root,
        initialized: true,
        writable,
        cas_format_version: CAS_FORMAT_VERSION,
    }
}

fn nearest_existing(path: &std::path::Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute.ancestors().find(|p| p.exists()).map(PathBuf::from)
}

fn can_write(dir: &std::path::Path) -> bool {
    let scratch = dir.join(format!(".doctor.{}.tmp", std::process::id()));
    let ok = std::fs::write(&scratch, b"doctor").is_ok();
    let _ = std::fs::remove_file(&scratch);
    ok
}

pub fn doctor(engine: &Engine) -> DoctorReport {
    let h = hash_health();
    let mut blockers = Vec::new();
    if h.hash_primitive != "blake3" {
        blockers.push("hash_primitive_not_blake3".to_string());
    }
    if h.hash_backend != "vendored" {
        blockers.push("hash_backend_not_vendored".to_string());
    }
    if !h.hash_available {
        blockers.push("blake3_not_available".to_string());
    }
    if h.compat_warning {
        blockers.push("hash_compat_warning".to_string());
    }
    if !self_test() {
        blockers.push("hash_vectors_failed".to_string());
    }
    let cas = cas_status(engine);
    if !cas.writable {
        blockers.push("cas_unwritable".to_string());
    }
    let inhibited = engine.sandbox().config().inhibited;
    DoctorReport {
        ok: blockers.is_empty(),
        blockers,
        engine_version: ENGINE_SEMVER,
        protocol_version: PROTOCOL_VERSION,
        hash_primitive: h.hash_primitive,
        hash_backend: h.hash_backend,
        hash_version: h.hash_version,
        sandbox: capabilities(),
        cas,
        rollback: RollbackStatus {
            available: true,
            mechanism: ENV_INHIBITOR,
            engaged: inhibited,
            instructions: format!("set {ENV_INHIBITOR}=1 to disable all execution"),
        },
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReplacementReport {
    pub ok: bool,
    pub blockers: Vec<String>,
    pub hash_primitive: &'static str,
    pub hash_backend: &'static str,
    pub hash_version: &'static str,
    pub hash_algorithm_version: u32,
    pub cas_format_version: u32,
}

/// Whether this build may replace an existing deployment without breaking
/// stored digests.
pub fn validate_replacement() -> ReplacementReport {
    let h = hash_health();
    let mut blockers = Vec::new();
    if h.hash_primitive != "blake3" {
        blockers.push("hash_primitive_must_be_blake3".to_string());
    }
    if h.hash_backend != "vendored" {
        blockers.push("hash_backend_cannot_be_fallback".to_string());
    }
    if !h.hash_available {
        blockers.push("hash_must_be_available".to_string());
    }
    if h.compat_warning {
        blockers.push("hash_compat_warning_must_be_clear".to_string());
    }
    if HASH_ALGORITHM_VERSION != 1 {
        blockers.push("hash_algorithm_version_must_be_1".to_string());
    }
    if CAS_FORMAT_VERSION != 2 {
        blockers.push("cas_format_version_must_be_2".to_string());
    }
    ReplacementReport {
        ok: blockers.is_empty(),
        blockers,
        hash_primitive: HASH_PRIMITIVE,
        hash_backend: HASH_BACKEND,
        hash_version: HASH_VERSION,
        hash_algorithm_version: HASH_ALGORITHM_VERSION,
        cas_format_version: CAS_FORMAT_VERSION,
    }
}

pub fn version() -> VersionManifest {
    manifest()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeterminismMetrics {
    pub executions: u64,
    pub high_confidence: u64,
    pub high_confidence_ratio: f64,
    pub replays: u64,
    pub replay_mismatches: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CasMetrics {
    pub open: bool,
    #[serde(flatten)]
    pub counters: CasCounters,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemoryMetrics {
    /// Peak resident set size in KiB, when the platform reports it.
    pub max_rss_kb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConcurrencyMetrics {
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub available_parallelism: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LatencyMetrics {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsReport {
    pub determinism: DeterminismMetrics,
    pub cas: CasMetrics,
    pub memory: MemoryMetrics,
    pub concurrency: ConcurrencyMetrics,
    pub failure_categories: std::collections::BTreeMap<String, u64>,
    pub latency: LatencyMetrics,
}

#[cfg(unix)]
fn max_rss_kb() -> Option<u64> {
    use nix::sys::resource::{getrusage, UsageWho};
    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let rss = u64::try_from(usage.max_rss()).ok()?;
    // macOS reports bytes, Linux KiB.
    if cfg!(target_os = "macos") {
        Some(rss / 1024)
    } else {
        Some(rss)
    }
}

#[cfg(not(unix))]
fn max_rss_kb() -> Option<u64> {
    None
}

pub fn metrics(engine: &Engine) -> MetricsReport {
    let s: StatsSnapshot = engine.stats().snapshot();
    let ratio = if s.executions == 0 {
        0.0
    } else {
        s.high_confidence as f64 / s.executions as f64
    };
    MetricsReport {
        determinism: DeterminismMetrics {
            executions: s.executions,
            high_confidence: s.high_confidence,
            high_confidence_ratio: ratio,
            replays: s.replays,
            replay_mismatches: s.replay_mismatches,
        },
        cas: CasMetrics {
            open: engine.cas_if_open().is_some(),
            counters: engine
                .cas_if_open()
                .map(CasStore::counters)
                .unwrap_or_default(),
        },
        memory: MemoryMetrics {
            max_rss_kb: max_rss_kb(),
        },
        concurrency: ConcurrencyMetrics {
            in_flight: s.in_flight,
            peak_in_flight: s.peak_in_flight,
            available_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        },
        failure_categories: s.failure_categories,
        latency: LatencyMetrics {
            p50_ms: s.p50_ms,
            p95_ms: s.p95_ms,
            p99_ms: s.p99_ms,
        },
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub worker_id: String,
    pub node_id: String,
    pub cluster_mode: String,
    pub shard_id: u32,
    pub total_shards: u32,
    pub engine_version: &'static str,
}

pub fn status(engine: &Engine) -> StatusReport {
    StatusReport {
        worker_id: engine.worker_id().to_string(),
        node_id: engine.node_id().to_string(),
        cluster_mode: engine.config().cluster_mode.clone(),
        shard_id: 0,
        total_shards: 1,
        engine_version: ENGINE_SEMVER,
    }
}
