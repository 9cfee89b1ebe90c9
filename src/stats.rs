//! Process-local counters behind `metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::schema::{ErrorCode, ExecutionResult, TerminationReason};

/// Upper bounds (ms) of the latency histogram buckets; the last bucket is
/// open-ended.
const BUCKET_BOUNDS_MS: [u64; 16] = [
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 30_000, 60_000, 300_000,
];

#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl LatencyHistogram {
    fn record(&self, ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Upper bound of the bucket holding the `p` quantile.
    fn quantile(&self, p: f64) -> u64 {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = ((total as f64) * p).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return BUCKET_BOUNDS_MS
                    .get(idx)
                    .copied()
                    .unwrap_or(BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1]);
            }
        }
        BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1]
    }
}

#[derive(Debug, Default)]
pub struct EngineStats {
    executions: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    refused: AtomicU64,
    timeouts: AtomicU64,
    truncated: AtomicU64,
    high_confidence: AtomicU64,
    replays: AtomicU64,
    replay_mismatches: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    failures: std::sync::Mutex<BTreeMap<ErrorCode, u64>>,
    latency: LatencyHistogram,
}

/// Guard that keeps the in-flight gauge accurate across early returns.
pub struct InFlight<'a>(&'a EngineStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
        InFlight(self)
    }

    pub fn record_result(&self, result: &ExecutionResult) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if result.ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        match result.termination_reason {
            TerminationReason::Refused => {
                self.refused.fetch_add(1, Ordering::Relaxed);
            }
            TerminationReason::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if result.stdout_truncated || result.stderr_truncated {
            self.truncated.fetch_add(1, Ordering::Relaxed);
        }
        if result.determinism_confidence.level == "high" {
            self.high_confidence.fetch_add(1, Ordering::Relaxed);
        }
        if result.error_code != ErrorCode::None {
            self.record_failure(result.error_code);
        }
        self.latency.record(result.duration_ms);
    }

    pub fn record_failure(&self, code: ErrorCode) {
        let mut g = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        *g.entry(code).or_insert(0) += 1;
    }

    pub fn record_replay(&self, matched: bool) {
        self.replays.fetch_add(1, Ordering::Relaxed);
        if !matched {
            self.replay_mismatches.fetch_add(1, Ordering::Relaxed);
            self.record_failure(ErrorCode::ReplayFailed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(code, n)| (code.as_str().to_string(), *n))
            .collect();
        StatsSnapshot {
            executions: load(&self.executions),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            refused: load(&self.refused),
            timeouts: load(&self.timeouts),
            truncated: load(&self.truncated),
            high_confidence: load(&self.high_confidence),
            replays: load(&self.replays),
            replay_mismatches: load(&self.replay_mismatches),
            in_flight: load(&self.in_flight),
            peak_in_flight: load(&self.peak_in_flight),
            failure_categories: failures,
            p50_ms: self.latency.quantile(0.50),
            p95_ms: self.latency.quantile(0.95),
            p99_ms: self.latency.quantile(0.99),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub refused: u64,
    pub timeouts: u64,
    pub truncated: u64,
    pub high_confidence: u64,
    pub replays: u64,
    pub replay_mismatches: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub failure_categories: BTreeMap<String, u64>,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ok: bool, ms: u64) -> ExecutionResult {
        ExecutionResult {
            ok,
            error_code: if ok { ErrorCode::None } else { ErrorCode::Timeout },
            termination_reason: if ok {
                TerminationReason::Exited
            } else {
                TerminationReason::Timeout
            },
            duration_ms: ms,
            ..ExecutionResult::default()
        }
    }

    #[test]
    fn test_counts_and_failure_categories() {
        let stats = EngineStats::new();
        stats.record_result(&result(true, 3));
        stats.record_result(&result(false, 40));
        let snap = stats.snapshot();
        assert_eq!(snap.executions, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.failure_categories.get("timeout"), Some(&1));
    }

    #[test]
    fn test_histogram_quantiles() {
        let stats = EngineStats::new();
        for _ in 0..99 {
            stats.record_result(&result(true, 4));
        }
        stats.record_result(&result(true, 900));
        let snap = stats.snapshot();
        assert_eq!(snap.p50_ms, 5);
        assert_eq!(snap.p95_ms, 5);
        assert_eq!(snap.p99_ms, 5);
        assert_eq!(EngineStats::new().snapshot().p99_ms, 0);
    }

    #[test]
    fn test_in_flight_gauge() {
        let stats = EngineStats::new();
        {
            let _a = stats.enter();
            let _b = stats.enter();
            assert_eq!(stats.snapshot().in_flight, 2);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.peak_in_flight, 2);
    }
}
