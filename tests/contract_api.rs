//! Contract tests for the library surface: wire error codes, result document
//! shape, the operation registry and the C header.

use serde_json::{json, Value};

use detexec::adapters::MapEnvAdapter;
use detexec::schema::ErrorCode;
use detexec::version::{self, ENGINE_ABI_VERSION};
use detexec::{Engine, EngineConfig, OperationRegistry};

fn engine(dir: &std::path::Path) -> Engine {
    let config = EngineConfig {
        cas_root: dir.join("store"),
        workspace_root: Some(dir.to_path_buf()),
        ..EngineConfig::default()
    };
    Engine::new(config, &MapEnvAdapter::default())
}

#[test]
fn test_error_codes_wire_format() {
    for code in ErrorCode::ALL {
        let wire = serde_json::to_value(code).unwrap();
        assert_eq!(wire, Value::String(code.as_str().to_string()));
        assert_eq!(code.to_string(), code.as_str());
        let back: ErrorCode = serde_json::from_value(wire).unwrap();
        assert_eq!(&back, code);
    }
    assert_eq!(ErrorCode::PathEscape.as_str(), "path_escape");
    assert_eq!(ErrorCode::ExecutionInhibited.as_str(), "execution_inhibited");
}

#[test]
fn test_header_matches_abi_constant() {
    let header = include_str!("../include/detexec.h");
    let line = header
        .lines()
        .find(|l| l.starts_with("#define DETEXEC_ABI_VERSION"))
        .expect("header defines DETEXEC_ABI_VERSION");
    let value: u32 = line
        .split_whitespace()
        .nth(2)
        .unwrap()
        .trim_end_matches('u')
        .parse()
        .unwrap();
    assert_eq!(value, ENGINE_ABI_VERSION);
    for symbol in [
        "detexec_abi_version",
        "detexec_init",
        "detexec_execute",
        "detexec_replay",
        "detexec_call",
        "detexec_free_string",
        "detexec_shutdown",
    ] {
        assert!(header.contains(symbol), "header lacks {symbol}");
    }
    assert_eq!(detexec::ffi::detexec_abi_version(), ENGINE_ABI_VERSION);
}

#[test]
fn test_manifest_is_single_source() {
    let m = version::manifest();
    assert_eq!(m.engine_abi_version, ENGINE_ABI_VERSION);
    assert_eq!(detexec::diagnostics::version(), m);
    assert_eq!(detexec::diagnostics::health().cas_version, version::CAS_LAYOUT_DIR);
}

#[test]
fn test_newer_cas_layout_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("store/cas/v3")).unwrap();
    let err = detexec::cas::CasStore::open(dir.path().join("store")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::VersionMismatch);
}

#[cfg(unix)]
#[tokio::test]
async fn test_registry_execute_verify_replay() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let registry = OperationRegistry::new().unwrap();
    let request = json!({
        "request_id": "api",
        "command": "/bin/sh",
        "argv": ["-c", "echo api"],
        "policy": {"deterministic": true}
    });

    let result = registry
        .call(&engine, "execute", json!({"request": request}))
        .await
        .unwrap();
    for field in [
        "ok",
        "exit_code",
        "error_code",
        "termination_reason",
        "stdout",
        "stderr",
        "stdout_truncated",
        "request_digest",
        "result_digest",
        "digest_info",
        "trace_events",
        "record_digest",
    ] {
        assert!(result.get(field).is_some(), "result lacks {field}");
    }
    assert_eq!(result["error_code"], "none");
    assert_eq!(result["digest_info"]["hash_backend"], "vendored");

    let check = registry
        .call(&engine, "digest_verify", json!({"result": result.clone()}))
        .await
        .unwrap();
    assert_eq!(check["ok"], true);

    let report = registry
        .call(
            &engine,
            "replay",
            json!({"request": request, "expected_digest": result["result_digest"], "mode": "stored"}),
        )
        .await
        .unwrap();
    assert_eq!(report["ok"], true);
    assert_eq!(report["source"], "cas");

    let gc = registry
        .call(&engine, "cas_gc", json!({"grace_secs": 0}))
        .await
        .unwrap();
    assert_eq!(gc["reclaimed"], 0);
    assert_eq!(gc["replay_log_compacted"], 0);

    let audit = registry.call(&engine, "audit_verify", Value::Null).await.unwrap();
    assert_eq!(audit["ok"], true);
    assert_eq!(audit["entries"], 1);

    let metrics = registry.call(&engine, "metrics", Value::Null).await.unwrap();
    assert_eq!(metrics["determinism"]["executions"], 1);
}

#[tokio::test]
async fn test_replay_without_record_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let registry = OperationRegistry::new().unwrap();
    let report = registry
        .call(
            &engine,
            "replay",
            json!({"request": {"command": "/bin/true"}, "mode": "stored"}),
        )
        .await
        .unwrap();
    assert_eq!(report["ok"], false);
    assert_eq!(report["error_code"], "not_found");
}

#[tokio::test]
async fn test_registry_errors_are_structured() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let registry = OperationRegistry::new().unwrap();

    let err = registry.call(&engine, "rm_rf", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationNotFound);

    let err = registry
        .call(&engine, "cas_gc", json!({"grace_secs": -1}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchemaViolation);

    let err = registry
        .call(&engine, "execute", json!({"request": {"command": ""}}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchemaViolation);
}
