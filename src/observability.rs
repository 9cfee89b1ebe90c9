//! Logging and metric lines.
//!
//! Everything goes to stderr; stdout belongs to the JSON documents the CLI
//! prints. Metrics are ordinary `info!` events with a `metric_name` and a
//! `value` field so a log shipper can lift them out without a metrics SDK.

use std::time::Instant;

use tracing::{debug, error, info, warn, Span};
use tracing_subscriber::EnvFilter;

use crate::schema::{ExecutionResult, TerminationReason};

/// Environment switch for newline-delimited JSON log output.
pub const ENV_LOG_JSON: &str = "DETEXEC_LOG_JSON";

/// Metric names emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    ExecutionDurationMs,
    ExecutionsTotal,
    OutputTruncatedTotal,
    TimeoutsTotal,
    PolicyViolationsTotal,
    ErrorsTotal,
    CasOperationsTotal,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::ExecutionDurationMs => "detexec_execution_duration_ms",
            Metric::ExecutionsTotal => "detexec_executions_total",
            Metric::OutputTruncatedTotal => "detexec_output_truncated_total",
            Metric::TimeoutsTotal => "detexec_timeouts_total",
            Metric::PolicyViolationsTotal => "detexec_policy_violations_total",
            Metric::ErrorsTotal => "detexec_errors_total",
            Metric::CasOperationsTotal => "detexec_cas_operations_total",
        }
    }
}

fn metric(m: Metric, value: u64, label: &str) {
    info!(metric_name = m.name(), value, label, "metric");
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_observability(default_filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if std::env::var(ENV_LOG_JSON).as_deref() == Ok("1") {
        builder.json().with_current_span(true).try_init()?;
    } else {
        builder.with_target(false).compact().try_init()?;
    }
    debug!(version = crate::version::ENGINE_SEMVER, "logging ready");
    Ok(())
}

/// Per-request logging scope.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: String,
    pub request_digest: String,
    started: Instant,
}

impl ExecutionContext {
    pub fn new(request_id: String, request_digest: String) -> Self {
        Self {
            request_id,
            request_digest,
            started: Instant::now(),
        }
    }

    pub fn span(&self) -> Span {
        tracing::info_span!(
            "exec",
            request_id = %self.request_id,
            request_digest = %self.request_digest,
        )
    }

    pub fn record_completion(&self, result: &ExecutionResult) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let reason = result.termination_reason.as_str();
        info!(
            request_id = %self.request_id,
            exit_code = result.exit_code,
            termination = reason,
            error_code = %result.error_code,
            confidence = %result.determinism_confidence.level,
            result_digest = %result.result_digest,
            elapsed_ms,
            "execution finished"
        );
        metric(Metric::ExecutionsTotal, 1, reason);
        metric(Metric::ExecutionDurationMs, elapsed_ms, reason);
        if result.termination_reason == TerminationReason::Timeout {
            metric(Metric::TimeoutsTotal, 1, &self.request_digest);
        }
        if result.stdout_truncated || result.stderr_truncated {
            metric(Metric::OutputTruncatedTotal, 1, &self.request_digest);
        }
    }

    /// A request refused by containment.
    pub fn record_policy_violation(&self, kind: &str) {
        warn!(request_id = %self.request_id, kind, "request refused by containment");
        metric(Metric::PolicyViolationsTotal, 1, kind);
    }

    pub fn record_error(&self, error_code: &str, message: &str) {
        error!(request_id = %self.request_id, error_code, message, "execution error");
        metric(Metric::ErrorsTotal, 1, error_code);
    }
}

pub fn log_sandbox_operation(executor: &str, operation: &str, success: bool) {
    if success {
        debug!(executor, operation, "sandbox");
    } else {
        warn!(executor, operation, "sandbox operation failed");
    }
}

pub fn log_cas_operation(operation: &str, digest: &str, size: u64, success: bool) {
    if success {
        debug!(operation, digest, size, "cas");
    } else {
        warn!(operation, digest, size, "cas operation failed");
    }
    metric(
        Metric::CasOperationsTotal,
        1,
        if success { operation } else { "failed" },
    );
}

/// Nothing is buffered; this only marks the end of the run in the log.
pub fn shutdown_observability() {
    debug!("logging shut down");
}
