//! Replay verification.
//!
//! A replay proves that a request still maps to the result digest recorded
//! for it, either from the stored record in the CAS or by running the
//! request again.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::canonical;
use crate::cas::CasError;
use crate::digest::{Digest, DigestInfo};
use crate::engine::{Engine, EngineError, ExecOptions};
use crate::schema::{ErrorCode, ExecutionRequest, ExecutionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Stored record when present, otherwise re-execute.
    #[default]
    Auto,
    Stored,
    Reexecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub code: ErrorCode,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub ok: bool,
    pub error_code: ErrorCode,
    pub request_digest: String,
    pub expected_digest: String,
    pub observed_digest: String,
    /// `cas` or `reexecution`.
    pub source: String,
    pub mismatches: Vec<Mismatch>,
}

impl ReplayReport {
    fn new(request_digest: &Digest, expected: Option<&str>, source: &str) -> Self {
        Self {
            ok: false,
            error_code: ErrorCode::None,
            request_digest: request_digest.to_hex(),
            expected_digest: expected.unwrap_or_default().to_string(),
            observed_digest: String::new(),
            source: source.to_string(),
            mismatches: Vec::new(),
        }
    }

    fn mismatch(&mut self, code: ErrorCode, detail: impl Into<String>) {
        self.mismatches.push(Mismatch {
            code,
            detail: detail.into(),
        });
    }

    fn finish(mut self) -> Self {
        if self.expected_digest.is_empty() && self.mismatches.is_empty() {
            self.mismatch(ErrorCode::NotFound, "no expected digest given and none recorded");
        }
        if !self.expected_digest.is_empty()
            && !self.observed_digest.is_empty()
            && self.expected_digest != self.observed_digest
        {
            let detail = format!(
                "expected {} observed {}",
                self.expected_digest, self.observed_digest
            );
            self.mismatch(ErrorCode::ReplayFailed, detail);
        }
        self.ok = self.mismatches.is_empty() && !self.observed_digest.is_empty();
        self.error_code = if self.ok {
            ErrorCode::None
        } else {
            self.mismatches
                .first()
                .map(|m| m.code)
                .unwrap_or(ErrorCode::ReplayFailed)
        };
        self
    }
}

/// Result of checking a result document against its own digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestCheck {
    pub ok: bool,
    pub error_code: ErrorCode,
    pub expected_digest: String,
    pub observed_digest: String,
    pub digest_info: DigestInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unbound: Vec<String>,
}

/// Inline content of `result` that does not hash to the digest it sits
/// next to: stream text and trace events.
///
/// Stream text is the lossy UTF-8 rendering of the captured bytes, so text
/// holding U+FFFD cannot be re-hashed and is only covered by its digest.
pub fn unbound_content(result: &ExecutionResult) -> Vec<String> {
    let mut out = Vec::new();
    for (name, text, digest) in [
        ("stdout", &result.stdout, &result.stdout_digest),
        ("stderr", &result.stderr, &result.stderr_digest),
    ] {
        if text.contains(char::REPLACEMENT_CHARACTER) {
            continue;
        }
        if Digest::of(text.as_bytes()).to_hex() != *digest {
            out.push(format!("{name} text does not match {name}_digest"));
        }
    }
    let trace = serde_json::to_value(&result.trace_events).unwrap_or_default();
    let trace_digest = Digest::of(canonical::to_canonical_string(&trace).as_bytes()).to_hex();
    if trace_digest != result.trace_digest {
        out.push("trace_events do not match trace_digest".to_string());
    }
    out
}

/// Recomputes `result_digest` from the canonical fields of `result` and
/// checks the inline content against its digests.
pub fn verify_result(result: &ExecutionResult) -> DigestCheck {
    let observed = canonical::result_digest(result).to_hex();
    let unbound = unbound_content(result);
    let error_code = if !result.digest_info.is_comparable_with(&DigestInfo::current()) {
        ErrorCode::HashBackendMismatch
    } else if result.result_digest.parse::<Digest>().is_err() {
        ErrorCode::InvalidDigest
    } else if observed != result.result_digest || !unbound.is_empty() {
        ErrorCode::ReplayFailed
    } else {
        ErrorCode::None
    };
    DigestCheck {
        ok: error_code == ErrorCode::None,
        error_code,
        expected_digest: result.result_digest.clone(),
        observed_digest: observed,
        digest_info: result.digest_info.clone(),
        unbound,
    }
}

pub async fn replay(
    engine: &Engine,
    request: &ExecutionRequest,
    expected: Option<&str>,
    mode: ReplayMode,
) -> Result<ReplayReport, EngineError> {
    if let Some(e) = expected {
        e.parse::<Digest>().map_err(CasError::from)?;
    }
    let request_digest = canonical::request_digest(request);
    let report = match mode {
        ReplayMode::Stored => from_store(engine, &request_digest, expected)?,
        ReplayMode::Reexecute => reexecute(engine, request, &request_digest, expected).await?,
        ReplayMode::Auto => {
            if engine.stored_record(&request_digest.to_hex())?.is_some() {
                from_store(engine, &request_digest, expected)?
            } else {
                reexecute(engine, request, &request_digest, expected).await?
            }
        }
    };
    if report.ok {
        info!(request_digest = %request_digest.short(), source = %report.source, "replay verified");
    } else {
        warn!(
            request_digest = %request_digest.short(),
            error_code = %report.error_code,
            expected = %report.expected_digest,
            observed = %report.observed_digest,
            "replay failed"
        );
    }
    Ok(report)
}

/// Digest recorded in the replay log, checking its version tags.
fn logged_digest(engine: &Engine, request_digest: &Digest, report: &mut ReplayReport) -> Option<String> {
    let ledger = match engine.ledger() {
        Ok(l) => l,
        Err(e) => {
            report.mismatch(e.code(), e.to_string());
            return None;
        }
    };
    match ledger.lookup(&request_digest.to_hex()) {
        Ok(entry) => entry.map(|e| e.result_digest),
        Err(e) => {
            report.mismatch(e.code(), e.to_string());
            None
        }
    }
}

fn from_store(
    engine: &Engine,
    request_digest: &Digest,
    expected: Option<&str>,
) -> Result<ReplayReport, EngineError> {
    let mut report = ReplayReport::new(request_digest, expected, "cas");
    let cas = engine.cas()?;

    let Some(pin) = engine.stored_record(&request_digest.to_hex())? else {
        report.mismatch(
            ErrorCode::NotFound,
            format!("no stored execution for request {}", request_digest.short()),
        );
        return Ok(report.finish());
    };
    let Some(record_digest) = pin.digests.first() else {
        report.mismatch(ErrorCode::CasIntegrityFailed, "execution ref lists no record");
        return Ok(report.finish());
    };

    let record = match cas.get(record_digest) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            report.mismatch(
                ErrorCode::NotFound,
                format!("missing_cas_object: result record {record_digest}"),
            );
            return Ok(report.finish());
        }
        Err(CasError::Integrity { digest, .. }) => {
            report.mismatch(
                ErrorCode::CasIntegrityFailed,
                format!("result record {digest} fails verification"),
            );
            return Ok(report.finish());
        }
        Err(e) => return Err(e.into()),
    };
    let stored: ExecutionResult = match serde_json::from_slice(&record) {
        Ok(r) => r,
        Err(e) => {
            report.mismatch(ErrorCode::JsonParseError, format!("result record: {e}"));
            return Ok(report.finish());
        }
    };

    if !stored.digest_info.is_comparable_with(&DigestInfo::current()) {
        report.mismatch(
            ErrorCode::HashBackendMismatch,
            format!(
                "stored with {}/{} v{}",
                stored.digest_info.hash_primitive,
                stored.digest_info.hash_backend,
                stored.digest_info.hash_algorithm_version
            ),
        );
        return Ok(report.finish());
    }
    if stored.request_digest != request_digest.to_hex() {
        report.mismatch(
            ErrorCode::ReplayFailed,
            format!("stored record belongs to request {}", stored.request_digest),
        );
    }

    let observed = canonical::result_digest(&stored).to_hex();
    if observed != stored.result_digest {
        report.mismatch(
            ErrorCode::ReplayFailed,
            format!(
                "stored record claims {} but re-canonicalizes to {observed}",
                stored.result_digest
            ),
        );
    }

    for detail in unbound_content(&stored) {
        report.mismatch(ErrorCode::ReplayFailed, detail);
    }

    let mut blobs = vec![
        ("stdout".to_string(), stored.stdout_digest.clone()),
        ("stderr".to_string(), stored.stderr_digest.clone()),
    ];
    blobs.extend(
        stored
            .output_digests
            .iter()
            .map(|(path, d)| (format!("output {path}"), d.clone())),
    );
    for (what, hex) in blobs {
        let digest: Digest = match hex.parse() {
            Ok(d) => d,
            Err(_) => {
                report.mismatch(ErrorCode::InvalidDigest, format!("{what}: {hex:?}"));
                continue;
            }
        };
        match cas.get(&digest) {
            Ok(Some(_)) => {}
            Ok(None) => report.mismatch(
                ErrorCode::NotFound,
                format!("missing_cas_object: {what} {digest}"),
            ),
            Err(CasError::Integrity { .. }) => report.mismatch(
                ErrorCode::CasIntegrityFailed,
                format!("{what} {digest} fails verification"),
            ),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(logged) = logged_digest(engine, request_digest, &mut report) {
        if logged != stored.result_digest {
            report.mismatch(
                ErrorCode::ReplayFailed,
                format!("replay log records {logged}, stored record has {}", stored.result_digest),
            );
        }
    }

    if report.expected_digest.is_empty() {
        report.expected_digest = stored.result_digest.clone();
    }
    report.observed_digest = observed;
    Ok(report.finish())
}

async fn reexecute(
    engine: &Engine,
    request: &ExecutionRequest,
    request_digest: &Digest,
    expected: Option<&str>,
) -> Result<ReplayReport, EngineError> {
    let mut report = ReplayReport::new(request_digest, expected, "reexecution");
    if report.expected_digest.is_empty() {
        if let Some(logged) = logged_digest(engine, request_digest, &mut report) {
            report.expected_digest = logged;
        }
    }
    let outcome = engine
        .execute(request, ExecOptions { store: false })
        .await?;
    report.observed_digest = outcome.result.result_digest;
    Ok(report.finish())
}
