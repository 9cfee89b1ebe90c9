//! Canonical byte forms for hashing.
//!
//! Canonical JSON here means: object keys sorted by byte order, no
//! whitespace, integers only. The same logical document always yields the
//! same bytes regardless of how `serde_json` was configured elsewhere in the
//! dependency graph.

use serde_json::{json, Value};

use crate::digest::Digest;
use crate::schema::{ExecutionRequest, ExecutionResult};

const MAX_REQUEST_ID_LEN: usize = 128;

/// Writes `value` as canonical JSON.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_value(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json escaping is stable for strings.
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// Canonical bytes of a request. Caller identity (`request_id`, `tenant_id`)
/// is never included, so equal execution semantics hash equally for every
/// tenant.
pub fn canonicalize_request(request: &ExecutionRequest) -> Vec<u8> {
    let policy = serde_json::to_value(&request.policy).unwrap_or(Value::Null);
    let doc = json!({
        "argv": request.argv,
        "command": request.command,
        "cwd": request.cwd,
        "env": request.env,
        "inputs": request.inputs,
        "max_output_bytes": request.max_output_bytes,
        "nonce": request.nonce,
        "outputs": request.outputs,
        "policy": policy,
        "timeout_ms": request.timeout_ms,
        "workspace_root": request.workspace_root,
    });
    to_canonical_string(&doc).into_bytes()
}

pub fn request_digest(request: &ExecutionRequest) -> Digest {
    Digest::of_request(&canonicalize_request(request))
}

/// Canonical bytes of a result: only the fields that describe what the
/// command did. Timestamps, durations, text payloads and ids are excluded.
pub fn canonicalize_result(result: &ExecutionResult) -> Vec<u8> {
    let doc = json!({
        "error_code": result.error_code.as_str(),
        "exit_code": result.exit_code,
        "ok": result.ok,
        "output_digests": result.output_digests,
        "request_digest": result.request_digest,
        "stderr_digest": result.stderr_digest,
        "stderr_truncated": result.stderr_truncated,
        "stdout_digest": result.stdout_digest,
        "stdout_truncated": result.stdout_truncated,
        "termination_reason": result.termination_reason.as_str(),
        "trace_digest": result.trace_digest,
    });
    to_canonical_string(&doc).into_bytes()
}

pub fn result_digest(result: &ExecutionResult) -> Digest {
    Digest::of_result(&canonicalize_result(result))
}

/// Strips anything that could steer a path: separators, `..`, leading dots,
/// control characters. The output is safe to embed in file names and echo.
pub fn sanitize_request_id(id: &str) -> String {
    let mut out: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    while out.contains("..") {
        out = out.replace("..", "_");
    }
    let trimmed = out.trim_start_matches('.');
    trimmed.chars().take(MAX_REQUEST_ID_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ErrorCode, TerminationReason};

    #[test]
    fn test_canonical_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": [ {"y": true, "x": null} ]}, "a": "s"});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":"s","b":{"a":[{"x":null,"y":true}],"z":1}}"#
        );
    }

    #[test]
    fn test_canonical_escapes_strings() {
        let v = json!({"k": "quote\" newline\n"});
        assert_eq!(to_canonical_string(&v), r#"{"k":"quote\" newline\n"}"#);
    }

    #[test]
    fn test_request_id_and_tenant_excluded() {
        let mut a = ExecutionRequest::new("/bin/echo", vec!["hi".into()]);
        a.request_id = "one".into();
        a.tenant_id = "tenant-a".into();
        let mut b = a.clone();
        b.request_id = "two".into();
        b.tenant_id = "tenant-b".into();
        assert_eq!(canonicalize_request(&a), canonicalize_request(&b));
        let text = String::from_utf8(canonicalize_request(&a)).unwrap();
        assert!(!text.contains("tenant"));
        assert!(!text.contains("request_id"));
    }

    #[test]
    fn test_semantic_changes_change_digest() {
        let a = ExecutionRequest::new("/bin/echo", vec!["hi".into()]);
        let mut b = a.clone();
        b.argv.push("there".into());
        assert_ne!(request_digest(&a), request_digest(&b));
        let mut c = a.clone();
        c.nonce = 7;
        assert_ne!(request_digest(&a), request_digest(&c));
    }

    #[test]
    fn test_result_digest_ignores_lifecycle_metadata() {
        let mut r = ExecutionResult {
            ok: true,
            exit_code: 0,
            error_code: ErrorCode::None,
            termination_reason: TerminationReason::Exited,
            request_digest: "r".into(),
            ..Default::default()
        };
        let d1 = result_digest(&r);
        r.start_timestamp = "2024-01-01T00:00:00Z".into();
        r.duration_ms = 99;
        r.request_id = "other".into();
        r.stdout = "text is covered by stdout_digest".into();
        assert_eq!(d1, result_digest(&r));
        r.exit_code = 1;
        assert_ne!(d1, result_digest(&r));
    }

    #[test]
    fn test_sanitize_request_id() {
        assert_eq!(sanitize_request_id("cas-test"), "cas-test");
        let s = sanitize_request_id("../../../etc/passwd");
        assert!(!s.contains("../"));
        assert!(!s.contains('/'));
        assert!(!s.contains(".."));
        assert!(!s.starts_with('.'));
        assert_eq!(sanitize_request_id("..\\..\\win"), "____win");
        assert_eq!(sanitize_request_id(&"a".repeat(300)).len(), 128);
    }
}
