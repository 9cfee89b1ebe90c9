//! Concurrency tests: many writers, readers and collectors on one store, and
//! many executions through one engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use detexec::cas::{CasStore, GcOptions, PinRecord};
use detexec::Digest;

fn blob(thread: usize, i: usize) -> Vec<u8> {
    format!("thread-{thread}-object-{i}-{}", "x".repeat(i % 64)).into_bytes()
}

#[test]
fn load_test_gc_concurrent_with_puts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CasStore::open(dir.path()).unwrap());

    let pinned: Vec<Digest> = (0..16)
        .map(|i| store.put(format!("pinned-{i}").as_bytes()).unwrap())
        .collect();
    store
        .pin("test", "roots", &PinRecord::new("test", pinned.clone()))
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reclaimed = Arc::new(AtomicU64::new(0));
    let collector = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        let reclaimed = Arc::clone(&reclaimed);
        thread::spawn(move || {
            let options = GcOptions {
                grace: Duration::ZERO,
                dry_run: false,
            };
            while !stop.load(Ordering::Relaxed) {
                let summary = store.gc(&options).expect("gc failed under load");
                reclaimed.fetch_add(summary.reclaimed as u64, Ordering::Relaxed);
            }
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100 {
                    let bytes = blob(t, i);
                    let digest = store.put(&bytes).expect("put failed under gc");
                    assert_eq!(digest, Digest::of(&bytes));
                    // Anything a reader gets back must hash to its digest.
                    if let Some(read) = store.get(&digest).expect("get failed under gc") {
                        assert_eq!(read, bytes);
                    }
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    collector.join().unwrap();

    for digest in &pinned {
        assert!(store.contains(digest), "pinned object {digest} was reclaimed");
    }
    let verify = store.verify_all().unwrap();
    assert!(verify.corrupt.is_empty(), "{:?}", verify.corrupt);
    println!("reclaimed {} objects under load", reclaimed.load(Ordering::Relaxed));
}

#[test]
fn load_test_identical_concurrent_puts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CasStore::open(dir.path()).unwrap());
    let payload = Arc::new(vec![42u8; 256 * 1024]);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let payload = Arc::clone(&payload);
            thread::spawn(move || store.put(&payload).unwrap())
        })
        .collect();
    let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.scan_objects().unwrap().len(), 1);
    assert_eq!(store.get(&digests[0]).unwrap().as_deref(), Some(&payload[..]));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_test_concurrent_executions() {
    use detexec::adapters::MapEnvAdapter;
    use detexec::ledger::Ledger as _;
    use detexec::{Engine, EngineConfig, ExecOptions, ExecutionRequest};

    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        cas_root: dir.path().join("store"),
        workspace_root: Some(dir.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(config, &MapEnvAdapter::default()));
    let req = ExecutionRequest::new("/bin/sh", vec!["-c".into(), "echo concurrent".into()]);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let req = req.clone();
            tokio::spawn(async move { engine.execute(&req, ExecOptions::default()).await })
        })
        .collect();
    let mut digests = Vec::new();
    for t in tasks {
        let out = t.await.unwrap().unwrap();
        assert!(out.result.ok);
        digests.push(out.result.result_digest);
    }
    digests.dedup();
    assert_eq!(digests.len(), 1);

    let snap = engine.stats().snapshot();
    assert_eq!(snap.in_flight, 0);
    assert!(snap.executions >= 16);
    assert_eq!(engine.ledger().unwrap().len().unwrap(), 16);
}
