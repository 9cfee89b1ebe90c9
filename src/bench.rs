//! Repeated execution and latency summaries.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::sandbox::{Sandbox, SandboxError};
use crate::schema::{self, ExecutionRequest, RequestError};
use crate::version::{ENGINE_SEMVER, HASH_PRIMITIVE};

pub const DEFAULT_RUNS: u32 = 5;
const DEFAULT_CASE: &str = "default";

fn default_runs() -> u32 {
    DEFAULT_RUNS
}
fn default_name() -> String {
    "bench".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchCase {
    pub name: String,
    pub request: ExecutionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchSpec {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default)]
    pub warmup: u32,
    pub cases: Vec<BenchCase>,
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("json_parse_error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("schema_violation: bench spec: {0}")]
    Spec(String),

    #[error("schema_violation: case {case}: {source}")]
    Request {
        case: String,
        #[source]
        source: RequestError,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl BenchError {
    pub fn code(&self) -> crate::schema::ErrorCode {
        use crate::schema::ErrorCode;
        match self {
            BenchError::Parse(_) => ErrorCode::JsonParseError,
            BenchError::Spec(_) => ErrorCode::SchemaViolation,
            BenchError::Request { source, .. } => source.code(),
            BenchError::Sandbox(e) => e.code(),
        }
    }
}

impl BenchSpec {
    /// Accepts either `{"cases":[{name, request}, ...]}`, a single
    /// `{"request": {...}}`, or a request document at the top level.
    pub fn from_value(value: Value) -> Result<Self, BenchError> {
        let Value::Object(mut map) = value else {
            return Err(BenchError::Spec("expected a JSON object".to_string()));
        };
        let name = match map.remove("name") {
            Some(Value::String(s)) => s,
            Some(_) => return Err(BenchError::Spec("name must be a string".to_string())),
            None => default_name(),
        };
        let runs = take_count(&mut map, "runs")?.unwrap_or(DEFAULT_RUNS);
        let warmup = take_count(&mut map, "warmup")?.unwrap_or(0);
        if runs == 0 {
            return Err(BenchError::Spec("runs must be at least 1".to_string()));
        }

        let raw_cases: Vec<(String, Value)> = if let Some(cases) = map.remove("cases") {
            let Value::Array(items) = cases else {
                return Err(BenchError::Spec("cases must be an array".to_string()));
            };
            items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| {
                    let Value::Object(mut case) = item else {
                        return Err(BenchError::Spec(format!("case {idx} must be an object")));
                    };
                    let name = match case.remove("name") {
                        Some(Value::String(s)) => s,
                        _ => format!("case-{idx}"),
                    };
                    let request = case
                        .remove("request")
                        .ok_or_else(|| BenchError::Spec(format!("case {name} has no request")))?;
                    Ok((name, request))
                })
                .collect::<Result<_, _>>()?
        } else if let Some(request) = map.remove("request") {
            vec![(DEFAULT_CASE.to_string(), request)]
        } else if map.contains_key("command") {
            vec![(DEFAULT_CASE.to_string(), Value::Object(map))]
        } else {
            return Err(BenchError::Spec("no cases, request or command".to_string()));
        };
        if raw_cases.is_empty() {
            return Err(BenchError::Spec("cases must not be empty".to_string()));
        }

        let mut seen = BTreeSet::new();
        let mut cases = Vec::with_capacity(raw_cases.len());
        for (case, value) in raw_cases {
            if !seen.insert(case.clone()) {
                return Err(BenchError::Spec(format!("duplicate case name {case}")));
            }
            let request = schema::request_from_value(value).map_err(|source| BenchError::Request {
                case: case.clone(),
                source,
            })?;
            cases.push(BenchCase {
                name: case,
                request,
            });
        }
        Ok(Self {
            name,
            runs,
            warmup,
            cases,
        })
    }

    pub fn parse(text: &str) -> Result<Self, BenchError> {
        Self::from_value(serde_json::from_str(text)?)
    }
}

fn take_count(map: &mut serde_json::Map<String, Value>, key: &str) -> Result<Option<u32>, BenchError> {
    match map.remove(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| BenchError::Spec(format!("{key} must be a non-negative integer"))),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Nearest-rank on the sorted samples: `sorted[min(floor((n-1)p), n-1)]`.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let idx = (((n - 1) as f64) * p).floor() as usize;
    sorted[idx.min(n - 1)]
}

impl LatencyStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let stddev = if sorted.len() > 1 {
            (sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev,
            p50: quantile(&sorted, 0.50),
            p90: quantile(&sorted, 0.90),
            p95: quantile(&sorted, 0.95),
            p99: quantile(&sorted, 0.99),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaseResult {
    pub name: String,
    pub runs: u32,
    pub request_digest: String,
    /// One per measured run, in submission order.
    pub result_digests: Vec<String>,
    pub samples_ms: Vec<f64>,
    pub latency_ms: LatencyStats,
    pub throughput_ops_sec: f64,
    /// Whether the case ran under a deterministic policy. Only then are its
    /// result digests expected to agree.
    #[serde(default = "deterministic_default")]
    pub deterministic: bool,
    /// Distinct result digests beyond the first; 0 for nondeterministic
    /// cases, whose trace timings differ on every run.
    pub drift_count: usize,
    pub failures: u32,
}

fn deterministic_default() -> bool {
    true
}

impl CaseResult {
    pub fn summarize(
        name: &str,
        deterministic: bool,
        request_digest: String,
        samples_ms: Vec<f64>,
        result_digests: Vec<String>,
        failures: u32,
    ) -> Self {
        let latency_ms = LatencyStats::from_samples(&samples_ms);
        let total_ms: f64 = samples_ms.iter().sum();
        let throughput_ops_sec = if total_ms > 0.0 {
            samples_ms.len() as f64 * 1000.0 / total_ms
        } else {
            0.0
        };
        let distinct: BTreeSet<&String> = result_digests.iter().collect();
        let drift_count = if deterministic {
            distinct.len().saturating_sub(1)
        } else {
            0
        };
        Self {
            name: name.to_string(),
            runs: samples_ms.len() as u32,
            request_digest,
            deterministic,
            drift_count,
            result_digests,
            samples_ms,
            latency_ms,
            throughput_ops_sec,
            failures,
        }
    }

    pub fn distinct_digests(&self) -> BTreeSet<&str> {
        self.result_digests.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BenchResult {
    pub name: String,
    pub runs: u32,
    pub warmup: u32,
    pub engine_version: String,
    pub hash_primitive: String,
    pub cases: Vec<CaseResult>,
}

impl BenchResult {
    pub fn case(&self, name: &str) -> Option<&CaseResult> {
        self.cases.iter().find(|c| c.name == name)
    }
}

/// Runs every case `warmup + runs` times through the sandbox. Nothing is
/// stored in the CAS.
pub async fn run_bench(sandbox: &Sandbox, spec: &BenchSpec) -> Result<BenchResult, BenchError> {
    sandbox.ensure_enabled()?;
    let mut cases = Vec::with_capacity(spec.cases.len());
    for case in &spec.cases {
        for i in 0..spec.warmup {
            debug!(case = %case.name, warmup = i, "bench warmup");
            sandbox.execute(&case.request).await?;
        }
        let mut samples = Vec::with_capacity(spec.runs as usize);
        let mut digests = Vec::with_capacity(spec.runs as usize);
        let mut failures = 0;
        let mut request_digest = String::new();
        for _ in 0..spec.runs {
            let started = Instant::now();
            let run = sandbox.execute(&case.request).await?;
            samples.push(started.elapsed().as_secs_f64() * 1000.0);
            if !run.result.ok {
                failures += 1;
            }
            request_digest = run.result.request_digest;
            digests.push(run.result.result_digest);
        }
        let summary = CaseResult::summarize(
            &case.name,
            case.request.policy.deterministic,
            request_digest,
            samples,
            digests,
            failures,
        );
        info!(
            case = %summary.name,
            p50_ms = summary.latency_ms.p50,
            p99_ms = summary.latency_ms.p99,
            drift_count = summary.drift_count,
            "bench case finished"
        );
        cases.push(summary);
    }
    Ok(BenchResult {
        name: spec.name.clone(),
        runs: spec.runs,
        warmup: spec.warmup,
        engine_version: ENGINE_SEMVER.to_string(),
        hash_primitive: HASH_PRIMITIVE.to_string(),
        cases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quantile_rule() {
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(quantile(&sorted, 0.50), 5.0);
        assert_eq!(quantile(&sorted, 0.90), 9.0);
        assert_eq!(quantile(&sorted, 0.99), 9.0);
        assert_eq!(quantile(&sorted, 1.0), 10.0);
        assert_eq!(quantile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_latency_stats() {
        let stats = LatencyStats::from_samples(&[4.0, 2.0, 6.0]);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 6.0);
        assert_eq!(stats.mean, 4.0);
        assert_eq!(stats.stddev, 2.0);
        assert_eq!(stats.p50, 4.0);
    }

    #[test]
    fn test_single_sample_has_zero_stddev() {
        let stats = LatencyStats::from_samples(&[7.5]);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.p99, 7.5);
    }

    #[test]
    fn test_drift_count_from_digests() {
        let r = CaseResult::summarize(
            "c",
            true,
            String::new(),
            vec![1.0, 1.0, 2.0],
            vec!["a".into(), "a".into(), "b".into()],
            0,
        );
        assert_eq!(r.drift_count, 1);
        assert_eq!(r.runs, 3);
        assert!(r.throughput_ops_sec > 0.0);
    }

    #[test]
    fn test_nondeterministic_case_has_no_drift_count() {
        let r = CaseResult::summarize(
            "c",
            false,
            String::new(),
            vec![1.0, 1.0, 2.0],
            vec!["a".into(), "b".into(), "c".into()],
            0,
        );
        assert!(!r.deterministic);
        assert_eq!(r.drift_count, 0);
        assert_eq!(r.distinct_digests().len(), 3);
    }

    #[test]
    fn test_case_result_without_flag_reads_as_deterministic() {
        let doc = json!({
            "name": "c",
            "runs": 1,
            "request_digest": "",
            "result_digests": ["a"],
            "samples_ms": [1.0],
            "latency_ms": LatencyStats::default(),
            "throughput_ops_sec": 1000.0,
            "drift_count": 0,
            "failures": 0
        });
        let r: CaseResult = serde_json::from_value(doc).unwrap();
        assert!(r.deterministic);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_bench_nondeterministic_echo_has_no_drift() {
        use std::sync::Arc;

        use crate::adapters::StdTimeAdapter;
        use crate::sandbox::{NativeExecutor, SandboxConfig};

        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(
            SandboxConfig {
                workspace_root: dir.path().to_path_buf(),
                ..SandboxConfig::default()
            },
            Arc::new(NativeExecutor),
            Arc::new(StdTimeAdapter),
        );
        let spec = BenchSpec::from_value(json!({
            "runs": 3,
            "command": "/bin/echo",
            "argv": ["hi"],
            "policy": {"deterministic": false}
        }))
        .unwrap();
        let result = run_bench(&sandbox, &spec).await.unwrap();
        let case = &result.cases[0];
        assert!(!case.deterministic);
        assert_eq!(case.drift_count, 0);
        let report = crate::drift::analyze(&result, None, &crate::drift::DriftPolicy::default());
        assert!(!report.drift_detected, "{report:?}");
        assert!(report.ok);
    }

    #[test]
    fn test_spec_forms() {
        let spec = BenchSpec::from_value(json!({"command": "/bin/true", "runs": 3})).unwrap();
        assert_eq!(spec.runs, 3);
        assert_eq!(spec.cases.len(), 1);
        assert_eq!(spec.cases[0].name, "default");
        assert_eq!(spec.cases[0].request.command, "/bin/true");

        let spec = BenchSpec::from_value(json!({"request": {"command": "/bin/echo"}})).unwrap();
        assert_eq!(spec.runs, DEFAULT_RUNS);
        assert_eq!(spec.cases[0].name, "default");

        let spec = BenchSpec::from_value(json!({
            "name": "suite",
            "warmup": 1,
            "cases": [
                {"name": "a", "request": {"command": "/bin/true"}},
                {"name": "b", "request": {"command": "/bin/false"}}
            ]
        }))
        .unwrap();
        assert_eq!(spec.name, "suite");
        assert_eq!(spec.warmup, 1);
        assert_eq!(spec.cases.len(), 2);
    }

    #[test]
    fn test_spec_rejections() {
        assert!(BenchSpec::from_value(json!({"runs": 0, "command": "/bin/true"})).is_err());
        assert!(BenchSpec::from_value(json!({"cases": []})).is_err());
        assert!(BenchSpec::from_value(json!({"runs": 2})).is_err());
        let dup = json!({"cases": [
            {"name": "a", "request": {"command": "/bin/true"}},
            {"name": "a", "request": {"command": "/bin/true"}}
        ]});
        assert!(BenchSpec::from_value(dup).is_err());
        let bad = BenchSpec::from_value(json!({"cases": [{"name": "a", "request": {"argv": []}}]}))
            .unwrap_err();
        assert_eq!(bad.code(), crate::schema::ErrorCode::SchemaViolation);
    }
}
