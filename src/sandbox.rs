//! Execution sandbox.
//!
//! [`Sandbox::execute`] turns a validated request into an [`ExecutionResult`]:
//! containment checks, environment policy, a watchdog on the child's process
//! group, bounded output capture and digesting. Process plumbing lives behind
//! the [`Executor`] trait.

pub mod containment;
pub mod rlimits;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::canonical::{self, sanitize_request_id};
use crate::digest::{Digest, DigestInfo};
use crate::observability::log_sandbox_operation;
use crate::ports::TimePort;
use crate::schema::{
    DeterminismConfidence, ErrorCode, ExecPolicy, ExecutionRequest, ExecutionResult,
    PolicyApplied, SandboxApplied, TerminationReason, TraceEvent,
};

use self::containment::ContainmentError;
use self::rlimits::ResourceLimits;

pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_REFUSED: i32 = 126;
pub const EXIT_SPAWN_FAILED: i32 = 127;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Upper bound on waiting for pipes to drain after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("execution_inhibited: {0}")]
    Inhibited(String),

    #[error("failed to wait for child process: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SandboxError::Inhibited(_) => ErrorCode::ExecutionInhibited,
            SandboxError::Io(_) => ErrorCode::IoError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Hard kill-switch. When set, nothing is spawned.
    pub inhibited: bool,
    /// Name of the setting that raised the inhibitor, for error messages.
    pub inhibitor_source: String,
    /// Used when a request does not name a workspace root.
    pub workspace_root: PathBuf,
    /// Host variables a child may inherit when `inherit_env` is set.
    pub host_env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            inhibited: false,
            inhibitor_source: "FORCE_RUST".to_string(),
            workspace_root: PathBuf::from("."),
            host_env: BTreeMap::new(),
        }
    }
}

/// Fully resolved instructions for one child process.
#[derive(Debug, Clone)]
pub struct ExecPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    SpawnFailed,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub spawn_error: Option<String>,
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, plan: &ExecPlan) -> Result<ProcessOutcome, SandboxError>;
}

/// Runs plans as real child processes in their own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeExecutor;

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    async fn run(&self, plan: &ExecPlan) -> Result<ProcessOutcome, SandboxError> {
        let mut cmd = tokio::process::Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.cwd)
            .env_clear()
            .envs(&plan.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            let limits = plan.limits;
            if !limits.is_empty() {
                // SAFETY: apply_in_child only issues setrlimit(2), which is
                // async-signal-safe.
                unsafe {
                    cmd.pre_exec(move || rlimits::apply_in_child(limits));
                }
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log_sandbox_operation("native", "spawn", false);
                return Ok(ProcessOutcome {
                    status: ProcessStatus::SpawnFailed,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    stdout_truncated: false,
                    stderr_truncated: false,
                    spawn_error: Some(e.kind().to_string()),
                });
            }
        };
        log_sandbox_operation("native", "spawn", true);

        let pid = child.id();
        let limit = plan.max_output_bytes;
        let out_sink = CaptureSink::default();
        let err_sink = CaptureSink::default();
        let out_task = tokio::spawn(capture(child.stdout.take(), limit, out_sink.clone()));
        let err_task = tokio::spawn(capture(child.stderr.take(), limit, err_sink.clone()));

        let status = match tokio::time::timeout(plan.timeout, child.wait()).await {
            Ok(waited) => status_of(waited?),
            Err(_) => {
                debug!(timeout_ms = plan.timeout.as_millis() as u64, "watchdog fired");
                kill_group(pid);
                let _ = child.kill().await;
                ProcessStatus::TimedOut
            }
        };
        // Reap anything the command left behind in its group so the pipes close.
        kill_group(pid);

        let (stdout, stdout_truncated) = join_capture(out_task, &out_sink, DRAIN_GRACE).await;
        let (stderr, stderr_truncated) = join_capture(err_task, &err_sink, DRAIN_GRACE).await;

        Ok(ProcessOutcome {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            spawn_error: None,
        })
    }
}

#[cfg(unix)]
fn status_of(status: std::process::ExitStatus) -> ProcessStatus {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessStatus::Exited(code),
        (None, Some(sig)) => ProcessStatus::Signaled(sig),
        (None, None) => ProcessStatus::Exited(-1),
    }
}

#[cfg(not(unix))]
fn status_of(status: std::process::ExitStatus) -> ProcessStatus {
    ProcessStatus::Exited(status.code().unwrap_or(-1))
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // ESRCH just means the group is already gone.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    truncated: bool,
}

/// Shared with the capture task so bytes read before a drain timeout
/// survive the task being abandoned.
type CaptureSink = Arc<Mutex<Captured>>;

/// Keeps the first `limit` bytes and drains the rest so the child never
/// blocks on a full pipe.
async fn capture<R>(reader: Option<R>, limit: usize, sink: CaptureSink)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut captured = sink.lock().unwrap_or_else(|p| p.into_inner());
                let room = limit.saturating_sub(captured.kept.len());
                captured.kept.extend_from_slice(&buf[..n.min(room)]);
                if n > room {
                    captured.truncated = true;
                }
            }
        }
    }
}

/// Waits up to `grace` for the pipe to close. Whatever was read by then is
/// returned; an unfinished capture is marked truncated.
async fn join_capture(
    mut task: tokio::task::JoinHandle<()>,
    sink: &CaptureSink,
    grace: Duration,
) -> (Vec<u8>, bool) {
    let complete = match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "output capture task failed");
            false
        }
        Err(_) => {
            task.abort();
            warn!("output pipe still open after process exit; keeping partial capture");
            false
        }
    };
    let mut captured = sink.lock().unwrap_or_else(|p| p.into_inner());
    let kept = std::mem::take(&mut captured.kept);
    (kept, captured.truncated || !complete)
}

/// Capability report used by `doctor`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SandboxCapabilities {
    pub workspace_confinement: bool,
    pub rlimits: bool,
    pub process_groups: bool,
    pub seccomp: bool,
    pub job_objects: bool,
    pub restricted_token: bool,
}

pub fn capabilities() -> SandboxCapabilities {
    SandboxCapabilities {
        workspace_confinement: true,
        rlimits: rlimits::supported(),
        process_groups: cfg!(unix),
        seccomp: false,
        job_objects: false,
        restricted_token: false,
    }
}

/// Raw bytes produced by one execution, kept next to the result so the
/// caller can store them in the CAS.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// (declared path, contents) for every output the command produced.
    pub outputs: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub result: ExecutionResult,
    pub artifacts: Artifacts,
    /// False when the request was refused before spawning.
    pub spawned: bool,
}

pub struct Sandbox {
    config: SandboxConfig,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn TimePort>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, executor: Arc<dyn Executor>, clock: Arc<dyn TimePort>) -> Self {
        Self {
            config,
            executor,
            clock,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Fails closed when the inhibitor is set.
    pub fn ensure_enabled(&self) -> Result<(), SandboxError> {
        if self.config.inhibited {
            return Err(SandboxError::Inhibited(format!(
                "{}=1: execution disabled by configuration",
                self.config.inhibitor_source
            )));
        }
        Ok(())
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<SandboxRun, SandboxError> {
        self.ensure_enabled()?;

        let started = Instant::now();
        let request_digest = canonical::request_digest(request);
        let mut run = RunBuilder::new(request, request_digest, self.clock.now_rfc3339());

        let root = match containment::resolve_workspace_root(&request.workspace_root, &self.config.workspace_root) {
            Ok(root) => root,
            Err(e) => return Ok(self.refuse(run, e, started)),
        };
        let cwd = match containment::resolve_cwd(&root, &request.cwd) {
            Ok(cwd) => cwd,
            Err(e) => return Ok(self.refuse(run, e, started)),
        };
        for output in &request.outputs {
            if let Err(e) = containment::check_output_path(output) {
                return Ok(self.refuse(run, e, started));
            }
        }

        let (env, policy_applied) = build_env(&request.policy, &request.env, &self.config.host_env);
        run.result.policy_applied = policy_applied;

        let limits = ResourceLimits::from_policy(&request.policy);
        let (limit_caps, unsupported) = limits.capability_names();
        let mut enforced = vec![
            "workspace_confinement".to_string(),
            "timeout".to_string(),
            "output_limit".to_string(),
        ];
        if cfg!(unix) {
            enforced.push("process_group".to_string());
        }
        if request.policy.deterministic {
            enforced.push("env_scrub".to_string());
        }
        enforced.extend(limit_caps);
        let mut unsupported = unsupported;
        unsupported.push("seccomp".to_string());
        run.result.sandbox_applied = SandboxApplied {
            enforced,
            unsupported,
        };

        let plan = ExecPlan {
            program: request.command.clone(),
            args: request.argv.clone(),
            cwd: cwd.clone(),
            env,
            timeout: Duration::from_millis(request.timeout_ms),
            max_output_bytes: usize::try_from(request.max_output_bytes).unwrap_or(usize::MAX),
            limits,
        };

        run.event(
            "process_start",
            started,
            [
                ("command", request.command.clone()),
                ("argc", request.argv.len().to_string()),
                ("cwd", containment::relative_display(&root, &cwd)),
            ],
        );

        let outcome = self.executor.run(&plan).await?;
        run.apply_outcome(&outcome, request, started);

        if outcome.status != ProcessStatus::SpawnFailed {
            run.collect_outputs(&root, &cwd, &request.outputs);
        }

        run.artifacts.stdout = outcome.stdout;
        run.artifacts.stderr = outcome.stderr;
        Ok(run.finish(self.clock.now_rfc3339(), started, true))
    }

    fn refuse(&self, mut run: RunBuilder, err: ContainmentError, started: Instant) -> SandboxRun {
        warn!(error_code = %err.code(), "request refused before spawn");
        run.result.ok = false;
        run.result.exit_code = EXIT_REFUSED;
        run.result.error_code = err.code();
        run.result.termination_reason = TerminationReason::Refused;
        run.result.message = Some(err.to_string());
        run.event(
            "refused",
            started,
            [("error_code", err.code().as_str().to_string())],
        );
        run.finish(self.clock.now_rfc3339(), started, false)
    }
}

/// Applies the environment policy. Returns the child's full environment and
/// a record of which keys were allowed, denied or injected.
pub fn build_env(
    policy: &ExecPolicy,
    requested: &BTreeMap<String, String>,
    host_env: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, PolicyApplied) {
    let mut env = BTreeMap::new();
    let mut applied = PolicyApplied {
        mode: policy.mode.clone(),
        time_mode: policy.time_mode.clone(),
        ..PolicyApplied::default()
    };
    let denied = |key: &str| policy.env_denylist.iter().any(|d| d == key);
    let allowed = |key: &str| policy.env_allowlist.is_empty() || policy.env_allowlist.iter().any(|a| a == key);

    if policy.inherit_env && !policy.deterministic {
        for (key, value) in host_env {
            if !denied(key) && allowed(key) {
                env.insert(key.clone(), value.clone());
            }
        }
    }

    for (key, value) in requested {
        if denied(key) || !allowed(key) {
            applied.denied_keys.push(key.clone());
        } else {
            env.insert(key.clone(), value.clone());
            applied.allowed_keys.push(key.clone());
        }
    }

    for (key, value) in &policy.required_env {
        env.insert(key.clone(), value.clone());
        applied.injected_keys.push(key.clone());
    }
    if !env.contains_key("PATH") {
        env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        applied.injected_keys.push("PATH".to_string());
    }
    (env, applied)
}

struct RunBuilder {
    result: ExecutionResult,
    artifacts: Artifacts,
    deterministic: bool,
}

impl RunBuilder {
    fn new(request: &ExecutionRequest, request_digest: Digest, start_timestamp: String) -> Self {
        let sanitized = sanitize_request_id(&request.request_id);
        let request_id = if sanitized.is_empty() {
            format!("req-{}", request_digest.short())
        } else {
            sanitized
        };
        let result = ExecutionResult {
            request_digest: request_digest.to_hex(),
            request_id,
            start_timestamp,
            digest_info: DigestInfo::current(),
            policy_applied: PolicyApplied {
                mode: request.policy.mode.clone(),
                time_mode: request.policy.time_mode.clone(),
                ..PolicyApplied::default()
            },
            ..ExecutionResult::default()
        };
        Self {
            result,
            artifacts: Artifacts::default(),
            deterministic: request.policy.deterministic,
        }
    }

    fn event<const N: usize>(&mut self, kind: &str, started: Instant, data: [(&str, String); N]) {
        let t_ns = if self.deterministic {
            0
        } else {
            u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
        };
        let seq = self.result.trace_events.len() as u64;
        self.result.trace_events.push(TraceEvent {
            seq,
            t_ns,
            kind: kind.to_string(),
            data: data.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        });
    }

    fn apply_outcome(&mut self, outcome: &ProcessOutcome, request: &ExecutionRequest, started: Instant) {
        let r = &mut self.result;
        r.stdout_truncated = outcome.stdout_truncated;
        r.stderr_truncated = outcome.stderr_truncated;
        r.stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
        r.stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
        match outcome.status {
            ProcessStatus::Exited(code) => {
                r.exit_code = code;
                r.termination_reason = TerminationReason::Exited;
            }
            ProcessStatus::Signaled(sig) => {
                r.exit_code = 128 + sig;
                r.termination_reason = TerminationReason::Signal;
            }
            ProcessStatus::TimedOut => {
                r.exit_code = EXIT_TIMEOUT;
                r.termination_reason = TerminationReason::Timeout;
                r.error_code = ErrorCode::Timeout;
            }
            ProcessStatus::SpawnFailed => {
                r.exit_code = EXIT_SPAWN_FAILED;
                r.termination_reason = TerminationReason::SpawnFailed;
                r.error_code = ErrorCode::SpawnFailed;
                r.message = outcome
                    .spawn_error
                    .as_ref()
                    .map(|e| format!("spawn_failed: {e}"));
            }
        }
        if outcome.status == ProcessStatus::TimedOut {
            self.event(
                "timeout",
                started,
                [("timeout_ms", request.timeout_ms.to_string())],
            );
        }
        let exit_code = self.result.exit_code.to_string();
        let reason = self.result.termination_reason.as_str().to_string();
        self.event(
            "process_end",
            started,
            [
                ("exit_code", exit_code),
                ("termination_reason", reason),
                ("stdout_bytes", outcome.stdout.len().to_string()),
                ("stderr_bytes", outcome.stderr.len().to_string()),
            ],
        );
    }

    fn collect_outputs(&mut self, root: &Path, cwd: &Path, outputs: &[String]) {
        for output in outputs {
            match containment::resolve_output(root, cwd, output) {
                Ok(Some(path)) => match std::fs::read(&path) {
                    Ok(bytes) => {
                        self.result
                            .output_digests
                            .insert(output.clone(), Digest::of(&bytes).to_hex());
                        self.artifacts.outputs.push((output.clone(), bytes));
                    }
                    Err(e) => warn!(output = %output, error = %e, "declared output unreadable"),
                },
                Ok(None) => debug!(output = %output, "declared output not produced"),
                Err(e) => {
                    // A symlink planted by the command that points outside
                    // the workspace.
                    self.result.error_code = e.code();
                    self.result.message = Some(e.to_string());
                }
            }
        }
    }

    fn finish(mut self, end_timestamp: String, started: Instant, spawned: bool) -> SandboxRun {
        let stdout_digest = Digest::of(&self.artifacts.stdout);
        let stderr_digest = Digest::of(&self.artifacts.stderr);
        let trace = serde_json::to_value(&self.result.trace_events).unwrap_or_default();
        let trace_digest = Digest::of(canonical::to_canonical_string(&trace).as_bytes());

        let r = &mut self.result;
        r.stdout_digest = stdout_digest.to_hex();
        r.stderr_digest = stderr_digest.to_hex();
        r.trace_digest = trace_digest.to_hex();
        r.ok = r.error_code == ErrorCode::None
            && r.termination_reason == TerminationReason::Exited
            && r.exit_code == 0;
        r.determinism_confidence = confidence(self.deterministic, r);
        r.result_digest = canonical::result_digest(r).to_hex();
        r.end_timestamp = end_timestamp;
        r.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        SandboxRun {
            result: self.result,
            artifacts: self.artifacts,
            spawned,
        }
    }
}

fn confidence(deterministic: bool, result: &ExecutionResult) -> DeterminismConfidence {
    let mut reasons = Vec::new();
    if !deterministic {
        reasons.push("policy_nondeterministic".to_string());
    }
    if result.termination_reason == TerminationReason::Timeout {
        reasons.push("timeout".to_string());
    }
    if result.stdout_truncated || result.stderr_truncated {
        reasons.push("output_truncated".to_string());
    }
    let (level, score) = if reasons.is_empty() {
        ("high", 1.0)
    } else if deterministic && result.termination_reason != TerminationReason::Timeout {
        ("medium", 0.7)
    } else {
        ("best_effort", 0.3)
    };
    DeterminismConfidence {
        level: level.to_string(),
        score,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FixedTimeAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records how many times it was asked to spawn.
    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Executor for CountingExecutor {
        async fn run(&self, plan: &ExecPlan) -> Result<ProcessOutcome, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessOutcome {
                status: ProcessStatus::Exited(0),
                stdout: plan.args.join(" ").into_bytes(),
                stderr: Vec::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                spawn_error: None,
            })
        }
    }

    fn sandbox_with(root: &Path, executor: Arc<dyn Executor>, inhibited: bool) -> Sandbox {
        Sandbox::new(
            SandboxConfig {
                inhibited,
                workspace_root: root.to_path_buf(),
                ..SandboxConfig::default()
            },
            executor,
            Arc::new(FixedTimeAdapter(0)),
        )
    }

    #[tokio::test]
    async fn test_path_escape_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(CountingExecutor::default());
        let sandbox = sandbox_with(dir.path(), exec.clone(), false);
        let mut req = ExecutionRequest::new("/bin/echo", vec!["x".into()]);
        req.cwd = "../../etc".into();
        let run = sandbox.execute(&req).await.unwrap();
        assert_eq!(run.result.error_code, ErrorCode::PathEscape);
        assert!(!run.result.ok);
        assert!(!run.spawned);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.result.result_digest.len(), 64);
    }

    #[tokio::test]
    async fn test_inhibitor_refuses_before_anything() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(CountingExecutor::default());
        let sandbox = sandbox_with(dir.path(), exec.clone(), true);
        let req = ExecutionRequest::new("/bin/true", vec![]);
        let err = sandbox.execute(&req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutionInhibited);
        assert!(err.to_string().contains("FORCE_RUST=1"));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_traversal_request_id_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(dir.path(), Arc::new(CountingExecutor::default()), false);
        let mut req = ExecutionRequest::new("/bin/echo", vec![]);
        req.request_id = "../../../etc/passwd".into();
        let run = sandbox.execute(&req).await.unwrap();
        let doc = serde_json::to_string(&run.result).unwrap();
        assert!(!doc.contains("../"));
    }

    #[tokio::test]
    async fn test_deterministic_results_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(dir.path(), Arc::new(CountingExecutor::default()), false);
        let req = ExecutionRequest::new("/bin/echo", vec!["same".into()]);
        let a = sandbox.execute(&req).await.unwrap().result;
        let b = sandbox.execute(&req).await.unwrap().result;
        assert_eq!(a.result_digest, b.result_digest);
        assert_eq!(a.trace_digest, b.trace_digest);
        assert!(a.trace_events.iter().all(|e| e.t_ns == 0));
        assert_eq!(a.determinism_confidence.level, "high");
    }

    #[tokio::test]
    async fn test_missing_request_id_is_derived_from_digest() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_with(dir.path(), Arc::new(CountingExecutor::default()), false);
        let req = ExecutionRequest::new("/bin/echo", vec![]);
        let run = sandbox.execute(&req).await.unwrap();
        assert_eq!(run.result.request_id, format!("req-{}", &run.result.request_digest[..16]));
    }

    #[test]
    fn test_env_policy() {
        let policy = ExecPolicy::default();
        let requested = BTreeMap::from([
            ("TZ".to_string(), "Asia/Tokyo".to_string()),
            ("APP_MODE".to_string(), "ci".to_string()),
        ]);
        let (env, applied) = build_env(&policy, &requested, &BTreeMap::new());
        assert_eq!(env.get("APP_MODE").map(String::as_str), Some("ci"));
        assert!(!env.contains_key("TZ"));
        assert_eq!(env.get("PYTHONHASHSEED").map(String::as_str), Some("0"));
        assert!(env.contains_key("PATH"));
        assert_eq!(applied.denied_keys, vec!["TZ".to_string()]);
        assert_eq!(applied.allowed_keys, vec!["APP_MODE".to_string()]);
        assert!(applied.injected_keys.contains(&"PYTHONHASHSEED".to_string()));
    }

    #[test]
    fn test_allowlist_restricts_keys() {
        let policy = ExecPolicy {
            env_allowlist: vec!["KEEP".into()],
            ..ExecPolicy::default()
        };
        let requested = BTreeMap::from([
            ("KEEP".to_string(), "1".to_string()),
            ("DROP".to_string(), "1".to_string()),
        ]);
        let (env, applied) = build_env(&policy, &requested, &BTreeMap::new());
        assert!(env.contains_key("KEEP"));
        assert!(!env.contains_key("DROP"));
        assert_eq!(applied.denied_keys, vec!["DROP".to_string()]);
    }

    #[test]
    fn test_inherit_env_reads_host_snapshot() {
        let host = BTreeMap::from([
            ("HOST_ONLY".to_string(), "yes".to_string()),
            ("SECRET".to_string(), "x".to_string()),
        ]);
        let policy = ExecPolicy {
            deterministic: false,
            inherit_env: true,
            env_denylist: vec!["SECRET".into()],
            ..ExecPolicy::default()
        };
        let (env, _) = build_env(&policy, &BTreeMap::new(), &host);
        assert_eq!(env.get("HOST_ONLY").map(String::as_str), Some("yes"));
        assert!(!env.contains_key("SECRET"));

        let strict = ExecPolicy {
            inherit_env: true,
            ..ExecPolicy::default()
        };
        let (env, _) = build_env(&strict, &BTreeMap::new(), &host);
        assert!(!env.contains_key("HOST_ONLY"));
    }

    #[tokio::test]
    async fn test_drain_timeout_keeps_partial_capture() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = tokio::io::duplex(64);
        let sink = CaptureSink::default();
        let task = tokio::spawn(capture(Some(reader), 1024, sink.clone()));
        writer.write_all(b"partial").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The writer stays open, so the capture never sees EOF.
        let (kept, truncated) = join_capture(task, &sink, Duration::from_millis(50)).await;
        assert_eq!(kept, b"partial");
        assert!(truncated);
        drop(writer);
    }

    #[tokio::test]
    async fn test_closed_pipe_capture_is_complete() {
        let sink = CaptureSink::default();
        let task = tokio::spawn(capture(Some(&b"abcdef"[..]), 4, sink.clone()));
        let (kept, truncated) = join_capture(task, &sink, DRAIN_GRACE).await;
        assert_eq!(kept, b"abcd");
        assert!(truncated);

        let sink = CaptureSink::default();
        let task = tokio::spawn(capture(Some(&b"ab"[..]), 4, sink.clone()));
        assert_eq!(join_capture(task, &sink, DRAIN_GRACE).await, (b"ab".to_vec(), false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_capture_truncates_deterministically() {
        let plan = ExecPlan {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "printf 'abcdefghij'".into()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::from([("PATH".to_string(), DEFAULT_PATH.to_string())]),
            timeout: Duration::from_secs(10),
            max_output_bytes: 4,
            limits: ResourceLimits::default(),
        };
        let a = NativeExecutor.run(&plan).await.unwrap();
        let b = NativeExecutor.run(&plan).await.unwrap();
        assert_eq!(a.stdout, b"abcd");
        assert!(a.stdout_truncated);
        assert_eq!(a.stdout, b.stdout);
        assert_eq!(a.status, ProcessStatus::Exited(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_timeout_kills_child() {
        let plan = ExecPlan {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
            cwd: std::env::temp_dir(),
            env: BTreeMap::from([("PATH".to_string(), DEFAULT_PATH.to_string())]),
            timeout: Duration::from_millis(200),
            max_output_bytes: 1024,
            limits: ResourceLimits::default(),
        };
        let started = Instant::now();
        let outcome = NativeExecutor.run(&plan).await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_structured() {
        let plan = ExecPlan {
            program: "/definitely/not/a/binary".into(),
            args: vec![],
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(1),
            max_output_bytes: 16,
            limits: ResourceLimits::default(),
        };
        let outcome = NativeExecutor.run(&plan).await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::SpawnFailed);
        assert!(outcome.spawn_error.is_some());
    }
}
