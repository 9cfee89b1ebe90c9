use criterion::{black_box, criterion_group, criterion_main, Criterion};
use detexec::bench::{BenchResult, CaseResult};
use detexec::drift::{analyze, render_pretty, DriftPolicy};

fn result(cases: usize, shift: f64) -> BenchResult {
    BenchResult {
        name: "synthetic".to_string(),
        runs: 200,
        cases: (0..cases)
            .map(|i| {
                let samples: Vec<f64> = (0..200).map(|j| shift + (j % 17) as f64 + i as f64).collect();
                let digests = vec!["ab".repeat(32); samples.len()];
                CaseResult::summarize(&format!("case-{i}"), true, "cd".repeat(32), samples, digests, 0)
            })
            .collect(),
        ..BenchResult::default()
    }
}

fn bench_drift(c: &mut Criterion) {
    let baseline = result(50, 10.0);
    let current = result(50, 12.0);
    let policy = DriftPolicy::default();
    c.bench_function("drift_analyze_50_cases", |b| {
        b.iter(|| black_box(analyze(&current, Some(&baseline), &policy)));
    });
    let report = analyze(&current, Some(&baseline), &policy);
    c.bench_function("drift_render_pretty", |b| {
        b.iter(|| black_box(render_pretty(&report)));
    });
    c.bench_function("case_summarize_200", |b| {
        let samples: Vec<f64> = (0..200).map(|j| (j * 7 % 31) as f64).collect();
        b.iter(|| {
            black_box(CaseResult::summarize(
                "c",
                true,
                String::new(),
                samples.clone(),
                Vec::new(),
                0,
            ))
        });
    });
}

criterion_group!(benches, bench_drift);
criterion_main!(benches);
