//! The engine facade: one value that owns configuration, the sandbox, the
//! store and the counters. Every surface (CLI, C ABI, tests) goes through it.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::{debug, Instrument};

use crate::adapters::StdTimeAdapter;
use crate::audit::{AuditError, AuditLog, AuditReport, ProvenanceRecord};
use crate::bench::{self, BenchError, BenchResult, BenchSpec};
use crate::cas::{CasError, CasStore, GcOptions, GcSummary, PinRecord};
use crate::config::{ConfigError, EngineConfig};
use crate::digest::Digest;
use crate::ledger::{FileLedger, Ledger, LedgerEntry, LedgerError};
use crate::observability::ExecutionContext;
use crate::ports::{EnvironmentPort, TimePort};
use crate::replay::{self, ReplayMode, ReplayReport};
use crate::sandbox::{Executor, NativeExecutor, Sandbox, SandboxError, SandboxRun};
use crate::schema::{ErrorCode, ExecutionRequest, ExecutionResult, RequestError};
use crate::stats::EngineStats;
use crate::version::AbiMismatch;

pub const EXEC_REF_NAMESPACE: &str = "exec";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bench(#[from] BenchError),

    #[error(transparent)]
    Abi(#[from] AbiMismatch),

    #[error("not_found: {0}")]
    NotFound(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Sandbox(e) => e.code(),
            EngineError::Request(e) => e.code(),
            EngineError::Cas(e) => e.code(),
            EngineError::Ledger(e) => e.code(),
            EngineError::Audit(e) => e.code(),
            EngineError::Config(e) => e.code(),
            EngineError::Bench(e) => e.code(),
            EngineError::Abi(_) => ErrorCode::AbiVersionMismatch,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_inhibited(&self) -> bool {
        self.code() == ErrorCode::ExecutionInhibited
    }
}

/// Structured error document printed by every surface.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDoc {
    pub ok: bool,
    pub error_code: ErrorCode,
    pub message: String,
}

impl From<&EngineError> for ErrorDoc {
    fn from(e: &EngineError) -> Self {
        Self {
            ok: false,
            error_code: e.code(),
            message: e.to_string(),
        }
    }
}

/// What `execute` produced and where it went.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub result: ExecutionResult,
    /// CAS digest of the stored result document, when stored.
    pub record_digest: Option<Digest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    pub store: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { store: true }
    }
}

struct Store {
    cas: CasStore,
    ledger: FileLedger,
    audit: AuditLog,
}

pub struct Engine {
    config: EngineConfig,
    sandbox: Sandbox,
    clock: Arc<dyn TimePort>,
    cas_base: PathBuf,
    store: OnceLock<Store>,
    stats: EngineStats,
    worker_id: String,
    node_id: String,
}

impl Engine {
    /// Engine with the native executor and the system clock.
    pub fn new(config: EngineConfig, env: &dyn EnvironmentPort) -> Self {
        Self::with_parts(config, env, Arc::new(NativeExecutor), Arc::new(StdTimeAdapter))
    }

    pub fn with_parts(
        config: EngineConfig,
        env: &dyn EnvironmentPort,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn TimePort>,
    ) -> Self {
        let sandbox = Sandbox::new(config.sandbox_config(env), executor, clock.clone());
        Self {
            cas_base: config.cas_root.clone(),
            worker_id: config.worker_id(env),
            node_id: config.node_id(env),
            config,
            sandbox,
            clock,
            store: OnceLock::new(),
            stats: EngineStats::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Fails with `execution_inhibited` when the kill-switch is set.
    pub fn ensure_enabled(&self) -> Result<(), EngineError> {
        Ok(self.sandbox.ensure_enabled()?)
    }

    fn store(&self) -> Result<&Store, EngineError> {
        if let Some(store) = self.store.get() {
            return Ok(store);
        }
        let cas = CasStore::open(&self.cas_base)?;
        let ledger = FileLedger::new(cas.replay_log_path());
        let audit = AuditLog::new(cas.audit_log_path());
        // A concurrent opener may have won; either value is equivalent.
        let _ = self.store.set(Store { cas, ledger, audit });
        self.store
            .get()
            .ok_or_else(|| EngineError::Internal("CAS store initialisation raced".to_string()))
    }

    /// Opens the CAS on first use.
    pub fn cas(&self) -> Result<&CasStore, EngineError> {
        Ok(&self.store()?.cas)
    }

    pub fn ledger(&self) -> Result<&dyn Ledger, EngineError> {
        Ok(&self.store()?.ledger)
    }

    /// Whether the CAS has been opened by this engine.
    pub fn cas_if_open(&self) -> Option<&CasStore> {
        self.store.get().map(|s| &s.cas)
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        options: ExecOptions,
    ) -> Result<ExecOutcome, EngineError> {
        self.ensure_enabled()?;
        let _in_flight = self.stats.enter();
        let ctx = ExecutionContext::new(
            request.request_id.clone(),
            crate::canonical::request_digest(request).short(),
        );
        let run = match self.sandbox.execute(request).instrument(ctx.span()).await {
            Ok(run) => run,
            Err(e) => {
                ctx.record_error(e.code().as_str(), &e.to_string());
                self.stats.record_failure(e.code());
                return Err(e.into());
            }
        };
        if run.result.error_code == ErrorCode::PathEscape {
            ctx.record_policy_violation("path_escape");
        }

        let record_digest = if options.store && run.spawned {
            Some(self.store_run(&run)?)
        } else {
            None
        };
        ctx.record_completion(&run.result);
        self.stats.record_result(&run.result);
        Ok(ExecOutcome {
            result: run.result,
            record_digest,
        })
    }

    /// Writes the blobs, the result record, the pin, the replay-log entry and
    /// the audit record.
    fn store_run(&self, run: &SandboxRun) -> Result<Digest, EngineError> {
        let store = self.store()?;
        let cas = &store.cas;
        let stdout = cas.put(&run.artifacts.stdout)?;
        let stderr = cas.put(&run.artifacts.stderr)?;
        let mut digests = Vec::with_capacity(3 + run.artifacts.outputs.len());
        for (_, bytes) in &run.artifacts.outputs {
            digests.push(cas.put(bytes)?);
        }
        let record_bytes = serde_json::to_vec(&run.result)
            .map_err(|e| EngineError::Internal(format!("result encode: {e}")))?;
        let record = cas.put(&record_bytes)?;

        let mut roots = vec![record, stdout, stderr];
        roots.extend(digests);
        let pin = PinRecord::new(EXEC_REF_NAMESPACE, roots)
            .with_label("request_id", run.result.request_id.clone())
            .with_label("result_digest", run.result.result_digest.clone());
        cas.pin(EXEC_REF_NAMESPACE, &run.result.request_digest, &pin)?;

        store.ledger.append(&LedgerEntry::new(
            run.result.request_id.clone(),
            run.result.request_digest.clone(),
            run.result.result_digest.clone(),
            record.to_hex(),
            self.clock.now_rfc3339(),
        ))?;
        store.audit.append(ProvenanceRecord::for_result(
            &run.result,
            &record,
            self.worker_id.clone(),
            self.node_id.clone(),
            self.clock.now_rfc3339(),
        ))?;
        debug!(record = %record.short(), "execution stored");
        Ok(record)
    }

    /// The stored result for `request_digest`, if any.
    pub fn stored_record(&self, request_digest: &str) -> Result<Option<PinRecord>, EngineError> {
        Ok(self.cas()?.read_pin(EXEC_REF_NAMESPACE, request_digest)?)
    }

    pub async fn replay(
        &self,
        request: &ExecutionRequest,
        expected: Option<&str>,
        mode: ReplayMode,
    ) -> Result<ReplayReport, EngineError> {
        self.ensure_enabled()?;
        let report = replay::replay(self, request, expected, mode).await?;
        self.stats.record_replay(report.ok);
        Ok(report)
    }

    pub async fn bench(&self, spec: &BenchSpec) -> Result<BenchResult, EngineError> {
        self.ensure_enabled()?;
        let _in_flight = self.stats.enter();
        Ok(bench::run_bench(&self.sandbox, spec).await?)
    }

    /// Walks the audit chain and checks each record still present in the CAS
    /// against the result digest the chain recorded for it.
    pub fn audit_verify(&self) -> Result<AuditReport, EngineError> {
        self.ensure_enabled()?;
        let store = self.store()?;
        let cas = &store.cas;
        Ok(store.audit.verify_with(|entry| {
            let digest: Digest = match entry.record_digest.parse() {
                Ok(d) => d,
                Err(_) => return Some(format!("record_digest {} is not a digest", entry.record_digest)),
            };
            // Reclaimed records are fine; only a present record can disagree.
            match cas.get(&digest) {
                Ok(None) => None,
                Ok(Some(bytes)) => match serde_json::from_slice::<ExecutionResult>(&bytes) {
                    Ok(stored) if stored.result_digest == entry.result_digest => None,
                    Ok(_) => Some(format!("stored record {} has a different result_digest", digest.short())),
                    Err(e) => Some(format!("stored record {} is not a result: {e}", digest.short())),
                },
                Err(e) => Some(format!("stored record {}: {e}", digest.short())),
            }
        })?)
    }

    /// Sweeps the CAS, then compacts the replay log unless this is a dry run.
    pub fn gc(&self, options: &GcOptions) -> Result<GcSummary, EngineError> {
        self.ensure_enabled()?;
        let store = self.store()?;
        let mut summary = store.cas.gc(options)?;
        if !options.dry_run {
            summary.replay_log_compacted = store.ledger.compact()?;
        }
        Ok(summary)
    }

    pub fn default_gc_options(&self) -> GcOptions {
        GcOptions {
            grace: std::time::Duration::from_secs(self.config.gc_grace_secs),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FixedTimeAdapter, MapEnvAdapter};
    use crate::canonical;

    fn engine(dir: &std::path::Path, inhibited: bool) -> Engine {
        let config = EngineConfig {
            cas_root: dir.join("store"),
            workspace_root: Some(dir.to_path_buf()),
            inhibited,
            ..EngineConfig::default()
        };
        Engine::with_parts(
            config,
            &MapEnvAdapter::default(),
            Arc::new(NativeExecutor),
            Arc::new(FixedTimeAdapter(0)),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_stores_record_pin_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), false);
        let req = ExecutionRequest::new("/bin/sh", vec!["-c".into(), "echo stored".into()]);
        let out = engine.execute(&req, ExecOptions::default()).await.unwrap();
        assert!(out.result.ok, "{:?}", out.result);
        let record = out.record_digest.unwrap();

        let cas = engine.cas().unwrap();
        let stored: ExecutionResult =
            serde_json::from_slice(&cas.get(&record).unwrap().unwrap()).unwrap();
        assert_eq!(stored.result_digest, out.result.result_digest);
        let stdout: Digest = out.result.stdout_digest.parse().unwrap();
        assert_eq!(cas.get(&stdout).unwrap().unwrap(), b"stored\n");

        let pin = engine.stored_record(&out.result.request_digest).unwrap().unwrap();
        assert_eq!(pin.digests[0], record);
        let entry = engine
            .ledger()
            .unwrap()
            .lookup(&out.result.request_digest)
            .unwrap()
            .unwrap();
        assert_eq!(entry.result_digest, out.result.result_digest);
    }

    #[tokio::test]
    async fn test_refused_runs_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), false);
        let mut req = ExecutionRequest::new("/bin/echo", vec![]);
        req.cwd = "../../etc".into();
        let out = engine.execute(&req, ExecOptions::default()).await.unwrap();
        assert_eq!(out.result.error_code, ErrorCode::PathEscape);
        assert!(out.record_digest.is_none());
        assert!(engine.cas_if_open().is_none());
    }

    #[tokio::test]
    async fn test_inhibited_engine_refuses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), true);
        let req = ExecutionRequest::new("/bin/true", vec![]);
        let err = engine.execute(&req, ExecOptions::default()).await.unwrap_err();
        assert!(err.is_inhibited());
        assert!(engine.gc(&GcOptions::default()).unwrap_err().is_inhibited());
        let doc = ErrorDoc::from(&err);
        assert_eq!(
            serde_json::to_value(&doc).unwrap()["error_code"],
            "execution_inhibited"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stored_runs_extend_the_audit_chain() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), false);
        assert_eq!(engine.audit_verify().unwrap().entries, 0);
        for word in ["one", "two"] {
            let req = ExecutionRequest::new("/bin/echo", vec![word.into()]);
            engine.execute(&req, ExecOptions::default()).await.unwrap();
        }
        let report = engine.audit_verify().unwrap();
        assert!(report.ok, "{report:?}");
        assert_eq!(report.entries, 2);

        let path = engine.cas().unwrap().audit_log_path();
        let text = std::fs::read_to_string(&path).unwrap();
        let first: ProvenanceRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.worker_id, engine.worker_id());
        assert!(first.ok);

        let mut forged = first.clone();
        forged.result_digest = "ab".repeat(32);
        // A forged single-record log still chains; the CAS copy disagrees.
        std::fs::write(&path, format!("{}\n", forged.canonical_line().unwrap())).unwrap();
        let report = engine.audit_verify().unwrap();
        assert!(!report.ok);
        assert_eq!(report.error_code, ErrorCode::CasIntegrityFailed);
        assert_eq!(report.first_break.unwrap().line, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gc_compacts_replay_log() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), false);
        let req = ExecutionRequest::new("/bin/echo", vec!["again".into()]);
        for _ in 0..3 {
            engine.execute(&req, ExecOptions::default()).await.unwrap();
        }
        assert_eq!(engine.ledger().unwrap().len().unwrap(), 3);

        let dry = engine
            .gc(&GcOptions {
                dry_run: true,
                ..GcOptions::default()
            })
            .unwrap();
        assert_eq!(dry.replay_log_compacted, 0);
        assert_eq!(engine.ledger().unwrap().len().unwrap(), 3);

        let summary = engine.gc(&GcOptions::default()).unwrap();
        assert_eq!(summary.replay_log_compacted, 2);
        let ledger = engine.ledger().unwrap();
        assert_eq!(ledger.len().unwrap(), 1);
        assert!(ledger
            .lookup(&canonical::request_digest(&req).to_hex())
            .unwrap()
            .is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_store_leaves_cas_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), false);
        let req = ExecutionRequest::new("/bin/true", vec![]);
        let out = engine.execute(&req, ExecOptions { store: false }).await.unwrap();
        assert!(out.record_digest.is_none());
        assert!(!dir.path().join("store").exists());
    }
}
