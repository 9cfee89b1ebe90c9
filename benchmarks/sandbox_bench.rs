use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use detexec::adapters::StdTimeAdapter;
use detexec::sandbox::{capabilities, NativeExecutor, Sandbox, SandboxConfig};
use detexec::ExecutionRequest;
use tokio::runtime::Runtime;

fn sandbox(root: &std::path::Path) -> Sandbox {
    let config = SandboxConfig {
        workspace_root: root.to_path_buf(),
        ..SandboxConfig::default()
    };
    Sandbox::new(config, Arc::new(NativeExecutor), Arc::new(StdTimeAdapter))
}

fn bench_capabilities(c: &mut Criterion) {
    c.bench_function("sandbox_capabilities", |b| {
        b.iter(|| black_box(capabilities()));
    });
}

fn bench_exec_native(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    let echo = ExecutionRequest::new("/bin/echo", vec!["hello".into()]);
    c.bench_function("exec_native_echo", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(sandbox.execute(&echo).await.unwrap()) });
    });

    let mut flood = ExecutionRequest::new("/bin/sh", vec!["-c".into(), "yes | head -c 1000000".into()]);
    flood.max_output_bytes = 4096;
    c.bench_function("exec_native_truncated_1mb", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(sandbox.execute(&flood).await.unwrap()) });
    });

    let mut escape = ExecutionRequest::new("/bin/true", vec![]);
    escape.cwd = "../".into();
    c.bench_function("exec_refused_path_escape", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(sandbox.execute(&escape).await.unwrap()) });
    });
}

criterion_group!(benches, bench_capabilities, bench_exec_native);
criterion_main!(benches);
