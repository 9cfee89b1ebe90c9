//! Drift classification of bench results against a baseline.
//!
//! Bands, per metric (p50, p95, p99, mean), in this order:
//!
//! 1. `|current - baseline| <= noise_floor_ms`: within tolerance.
//! 2. `delta_pct > tolerance_pct`: degraded.
//! 3. `delta_pct < -tolerance_pct`: improved.
//! 4. otherwise: within tolerance.
//!
//! `delta_pct = (current - baseline) / baseline * 100`. A zero baseline with a
//! change above the noise floor counts as degraded (or improved if negative,
//! which cannot happen for latencies) with no percentage.
//!
//! Digest drift is separate and always fails the report: a deterministic case
//! that produced more than one distinct result digest, or a digest different
//! from the baseline's. Nondeterministic cases carry wall-clock trace timings,
//! so their digests are reported but never compared.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::bench::{BenchResult, CaseResult};

fn default_tolerance_pct() -> f64 {
    10.0
}
fn default_noise_floor_ms() -> f64 {
    1.0
}
fn deterministic_default() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriftPolicy {
    #[serde(default = "default_tolerance_pct")]
    pub tolerance_pct: f64,
    #[serde(default = "default_noise_floor_ms")]
    pub noise_floor_ms: f64,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            tolerance_pct: default_tolerance_pct(),
            noise_floor_ms: default_noise_floor_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Improved,
    WithinTolerance,
    Degraded,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Improved => "improved",
            Band::WithinTolerance => "within_tolerance",
            Band::Degraded => "degraded",
        }
    }
}

/// Classifies one metric. Returns the band and the percentage change when
/// it is defined.
pub fn classify(current: f64, baseline: f64, policy: &DriftPolicy) -> (Band, Option<f64>) {
    let delta = current - baseline;
    let pct = if baseline != 0.0 {
        Some(delta / baseline * 100.0)
    } else {
        None
    };
    if delta.abs() <= policy.noise_floor_ms {
        return (Band::WithinTolerance, pct);
    }
    let band = match pct {
        Some(p) if p > policy.tolerance_pct => Band::Degraded,
        Some(p) if p < -policy.tolerance_pct => Band::Improved,
        Some(_) => Band::WithinTolerance,
        None if delta > 0.0 => Band::Degraded,
        None => Band::Improved,
    };
    (band, pct)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDrift {
    pub metric: String,
    pub baseline_ms: f64,
    pub current_ms: f64,
    pub delta_ms: f64,
    pub delta_pct: Option<f64>,
    pub band: Band,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseDrift {
    pub name: String,
    #[serde(default = "deterministic_default")]
    pub deterministic: bool,
    pub distinct_digests: usize,
    /// Deterministic cases only: more than one digest across runs, or
    /// different from the baseline.
    pub digest_drift: bool,
    pub baseline_digest: Option<String>,
    pub metrics: Vec<MetricDrift>,
    /// Worst metric band; `within_tolerance` without a baseline.
    pub band: Band,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftReport {
    pub ok: bool,
    pub bench: String,
    pub has_baseline: bool,
    pub drift_detected: bool,
    pub degraded: bool,
    pub policy: DriftPolicy,
    pub cases: Vec<CaseDrift>,
    /// Baseline cases the current run did not produce.
    pub missing_cases: Vec<String>,
}

fn metrics_of(case: &CaseResult) -> [(&'static str, f64); 4] {
    let l = &case.latency_ms;
    [("p50", l.p50), ("p95", l.p95), ("p99", l.p99), ("mean", l.mean)]
}

pub fn analyze(current: &BenchResult, baseline: Option<&BenchResult>, policy: &DriftPolicy) -> DriftReport {
    let mut cases = Vec::with_capacity(current.cases.len());
    for case in &current.cases {
        let distinct = case.distinct_digests();
        let base_case = baseline.and_then(|b| b.case(&case.name));
        let baseline_digest = base_case.and_then(|b| b.result_digests.first().cloned());
        let differs_from_baseline = match (&baseline_digest, case.result_digests.first()) {
            (Some(base), Some(cur)) => base != cur,
            _ => false,
        };
        let mut metrics = Vec::new();
        if let Some(base) = base_case {
            for ((name, cur), (_, base_ms)) in metrics_of(case).into_iter().zip(metrics_of(base)) {
                let (band, delta_pct) = classify(cur, base_ms, policy);
                metrics.push(MetricDrift {
                    metric: name.to_string(),
                    baseline_ms: base_ms,
                    current_ms: cur,
                    delta_ms: cur - base_ms,
                    delta_pct,
                    band,
                });
            }
        }
        let band = if metrics.iter().any(|m| m.band == Band::Degraded) {
            Band::Degraded
        } else if !metrics.is_empty() && metrics.iter().all(|m| m.band == Band::Improved) {
            Band::Improved
        } else {
            Band::WithinTolerance
        };
        cases.push(CaseDrift {
            name: case.name.clone(),
            deterministic: case.deterministic,
            distinct_digests: distinct.len(),
            digest_drift: case.deterministic && (distinct.len() > 1 || differs_from_baseline),
            baseline_digest,
            metrics,
            band,
        });
    }

    let missing_cases = baseline
        .map(|b| {
            b.cases
                .iter()
                .filter(|c| current.case(&c.name).is_none())
                .map(|c| c.name.clone())
                .collect()
        })
        .unwrap_or_default();

    let drift_detected = cases.iter().any(|c| c.digest_drift);
    let degraded = cases.iter().any(|c| c.band == Band::Degraded);
    DriftReport {
        ok: !drift_detected && !degraded,
        bench: current.name.clone(),
        has_baseline: baseline.is_some(),
        drift_detected,
        degraded,
        policy: *policy,
        cases,
        missing_cases,
    }
}

fn fmt_pct(pct: Option<f64>) -> String {
    match pct {
        Some(p) => format!("{p:+.1}%"),
        None => "n/a".to_string(),
    }
}

/// Human-readable table.
pub fn render_pretty(report: &DriftReport) -> String {
    let mut out = String::new();
    let status = if report.ok { "OK" } else { "DRIFT" };
    let _ = writeln!(
        out,
        "drift report: {} [{}] (tolerance ±{}%, noise floor {} ms)",
        report.bench, status, report.policy.tolerance_pct, report.policy.noise_floor_ms
    );
    for case in &report.cases {
        let digest_note = if case.digest_drift {
            format!("DIGEST DRIFT ({} distinct)", case.distinct_digests)
        } else if !case.deterministic {
            format!("digests not compared (nondeterministic, {} distinct)", case.distinct_digests)
        } else {
            "digests stable".to_string()
        };
        let _ = writeln!(out, "\ncase {}: {}, {}", case.name, case.band.as_str(), digest_note);
        if case.metrics.is_empty() {
            let _ = writeln!(out, "  (no baseline)");
            continue;
        }
        let _ = writeln!(
            out,
            "  {:<6} {:>12} {:>12} {:>10} {:>10}  {}",
            "metric", "baseline_ms", "current_ms", "delta_ms", "delta", "band"
        );
        for m in &case.metrics {
            let _ = writeln!(
                out,
                "  {:<6} {:>12.3} {:>12.3} {:>+10.3} {:>10}  {}",
                m.metric,
                m.baseline_ms,
                m.current_ms,
                m.delta_ms,
                fmt_pct(m.delta_pct),
                m.band.as_str()
            );
        }
    }
    if !report.missing_cases.is_empty() {
        let _ = writeln!(out, "\nmissing from current run: {}", report.missing_cases.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str, samples: Vec<f64>, digests: &[&str]) -> CaseResult {
        CaseResult::summarize(
            name,
            true,
            "req".into(),
            samples,
            digests.iter().map(|d| d.to_string()).collect(),
            0,
        )
    }

    fn bench(cases: Vec<CaseResult>) -> BenchResult {
        BenchResult {
            name: "b".into(),
            runs: 3,
            cases,
            ..BenchResult::default()
        }
    }

    #[test]
    fn test_bands() {
        let p = DriftPolicy::default();
        assert_eq!(classify(100.0, 100.0, &p).0, Band::WithinTolerance);
        assert_eq!(classify(111.0, 100.0, &p).0, Band::Degraded);
        assert_eq!(classify(110.0, 100.0, &p).0, Band::WithinTolerance);
        assert_eq!(classify(89.0, 100.0, &p).0, Band::Improved);
        assert_eq!(classify(0.0, 0.0, &p), (Band::WithinTolerance, None));
    }

    #[test]
    fn test_noise_floor_absorbs_small_baselines() {
        let p = DriftPolicy::default();
        // +100% but only 0.5 ms.
        assert_eq!(classify(1.0, 0.5, &p).0, Band::WithinTolerance);
        assert_eq!(classify(5.0, 0.0, &p), (Band::Degraded, None));
    }

    #[test]
    fn test_digest_drift_within_run() {
        let current = bench(vec![case("a", vec![1.0, 1.0], &["x", "y"])]);
        let report = analyze(&current, None, &DriftPolicy::default());
        assert!(report.drift_detected);
        assert!(!report.ok);
        assert_eq!(report.cases[0].distinct_digests, 2);
    }

    #[test]
    fn test_nondeterministic_digests_are_not_drift() {
        let mut loose = case("a", vec![1.0; 3], &["x", "y", "z"]);
        loose.deterministic = false;
        let baseline = bench(vec![case("a", vec![1.0; 3], &["w"; 3])]);
        let report = analyze(&bench(vec![loose]), Some(&baseline), &DriftPolicy::default());
        assert!(!report.drift_detected);
        assert!(report.ok);
        assert!(!report.cases[0].deterministic);
        assert_eq!(report.cases[0].distinct_digests, 3);
        assert!(render_pretty(&report).contains("not compared"));
    }

    #[test]
    fn test_digest_drift_against_baseline() {
        let baseline = bench(vec![case("a", vec![10.0; 3], &["x", "x", "x"])]);
        let current = bench(vec![case("a", vec![10.0; 3], &["z", "z", "z"])]);
        let report = analyze(&current, Some(&baseline), &DriftPolicy::default());
        assert!(report.cases[0].digest_drift);
        assert!(!report.degraded);
        assert!(!report.ok);
    }

    #[test]
    fn test_latency_degradation() {
        let baseline = bench(vec![case("a", vec![100.0; 5], &["x"; 5])]);
        let current = bench(vec![case("a", vec![150.0; 5], &["x"; 5])]);
        let report = analyze(&current, Some(&baseline), &DriftPolicy::default());
        assert!(report.degraded);
        assert!(!report.drift_detected);
        assert_eq!(report.cases[0].band, Band::Degraded);
        assert_eq!(report.cases[0].metrics.len(), 4);
        let p50 = &report.cases[0].metrics[0];
        assert_eq!(p50.metric, "p50");
        assert_eq!(p50.delta_pct, Some(50.0));
    }

    #[test]
    fn test_stable_run_is_ok_and_renders() {
        let baseline = bench(vec![case("a", vec![100.0; 5], &["x"; 5])]);
        let current = bench(vec![case("a", vec![101.0; 5], &["x"; 5])]);
        let report = analyze(&current, Some(&baseline), &DriftPolicy::default());
        assert!(report.ok);
        let text = render_pretty(&report);
        assert!(text.contains("[OK]"));
        assert!(text.contains("within_tolerance"));
        assert!(text.contains("p99"));
    }

    #[test]
    fn test_missing_cases_reported() {
        let baseline = bench(vec![case("a", vec![1.0], &["x"]), case("gone", vec![1.0], &["y"])]);
        let current = bench(vec![case("a", vec![1.0], &["x"])]);
        let report = analyze(&current, Some(&baseline), &DriftPolicy::default());
        assert_eq!(report.missing_cases, vec!["gone".to_string()]);
    }
}
