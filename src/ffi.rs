//! C ABI (v1). See `include/detexec.h`.
//!
//! Every function exchanges NUL-terminated UTF-8 JSON. Strings returned by
//! the library are owned by it and must be released with
//! [`detexec_free_string`]. A context is created by [`detexec_init`] and
//! destroyed by [`detexec_shutdown`].

use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{json, Value};
use tracing::warn;

use crate::adapters::StdEnvAdapter;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::registry::{OperationRegistry, RegistryError};
use crate::schema::ErrorCode;
use crate::version::{check_compatibility, ENGINE_ABI_VERSION};

/// Opaque handle owned by the caller between `detexec_init` and
/// `detexec_shutdown`.
pub struct DetexecContext {
    runtime: tokio::runtime::Runtime,
    engine: Engine,
    registry: OperationRegistry,
}

impl DetexecContext {
    fn new(config_json: &str) -> Result<Self, String> {
        let mut config = EngineConfig::from_json(config_json).map_err(|e| e.to_string())?;
        let env = StdEnvAdapter;
        config.apply_env(&env).map_err(|e| e.to_string())?;
        config.validate().map_err(|e| e.to_string())?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| e.to_string())?;
        let registry = OperationRegistry::new()?;
        Ok(Self {
            runtime,
            engine: Engine::new(config, &env),
            registry,
        })
    }

    fn call(&self, op: &str, payload: Value) -> Value {
        match self
            .runtime
            .block_on(self.registry.call(&self.engine, op, payload))
        {
            Ok(doc) => doc,
            Err(e) => error_doc(e.code(), &e.to_string()),
        }
    }
}

fn error_doc(code: ErrorCode, message: &str) -> Value {
    json!({"ok": false, "error_code": code, "message": message})
}

fn into_c_string(value: &Value) -> *mut c_char {
    // serde_json never emits interior NULs; `\u0000` stays escaped.
    match CString::new(value.to_string()) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Reads a borrowed C string. NULL reads as `None`.
unsafe fn read_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, Value> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(Some)
        .map_err(|_| error_doc(ErrorCode::JsonParseError, "argument is not valid UTF-8"))
}

unsafe fn read_json(ptr: *const c_char) -> Result<Value, Value> {
    match read_str(ptr)? {
        None => Ok(Value::Null),
        Some(text) if text.trim().is_empty() => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| error_doc(ErrorCode::JsonParseError, &e.to_string())),
    }
}

fn guarded(f: impl FnOnce() -> Value) -> *mut c_char {
    let doc = catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| error_doc(ErrorCode::Internal, "engine panicked"));
    into_c_string(&doc)
}

/// ABI version implemented by this library.
#[no_mangle]
pub extern "C" fn detexec_abi_version() -> u32 {
    ENGINE_ABI_VERSION
}

/// Creates an engine context. Returns NULL when `abi_version` differs from
/// the library's or the configuration is invalid.
///
/// # Safety
/// `config_json` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn detexec_init(config_json: *const c_char, abi_version: u32) -> *mut DetexecContext {
    if let Err(e) = check_compatibility(abi_version) {
        warn!(error = %e, "detexec_init refused");
        return std::ptr::null_mut();
    }
    let config = match read_str(config_json) {
        Ok(c) => c.unwrap_or(""),
        Err(_) => return std::ptr::null_mut(),
    };
    match catch_unwind(AssertUnwindSafe(|| DetexecContext::new(config))) {
        Ok(Ok(ctx)) => Box::into_raw(Box::new(ctx)),
        Ok(Err(e)) => {
            warn!(error = %e, "detexec_init failed");
            std::ptr::null_mut()
        }
        Err(_) => std::ptr::null_mut(),
    }
}

/// Runs one request document and stores the result.
///
/// # Safety
/// `ctx` must come from `detexec_init`; `request_json` must be a valid
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn detexec_execute(ctx: *const DetexecContext, request_json: *const c_char) -> *mut c_char {
    let Some(ctx) = ctx.as_ref() else {
        return into_c_string(&error_doc(ErrorCode::Internal, "null context"));
    };
    let request = match read_json(request_json) {
        Ok(v) => v,
        Err(doc) => return into_c_string(&doc),
    };
    guarded(|| ctx.call("execute", json!({"request": request})))
}

/// Replays a request against an expected result digest (hex, may be NULL).
///
/// # Safety
/// `ctx` must come from `detexec_init`; string arguments must be NULL or
/// valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn detexec_replay(
    ctx: *const DetexecContext,
    request_json: *const c_char,
    expected_digest: *const c_char,
) -> *mut c_char {
    let Some(ctx) = ctx.as_ref() else {
        return into_c_string(&error_doc(ErrorCode::Internal, "null context"));
    };
    let request = match read_json(request_json) {
        Ok(v) => v,
        Err(doc) => return into_c_string(&doc),
    };
    let expected = match read_str(expected_digest) {
        Ok(e) => e.map(str::to_string),
        Err(doc) => return into_c_string(&doc),
    };
    let mut payload = json!({"request": request});
    if let (Some(expected), Value::Object(map)) = (expected, &mut payload) {
        map.insert("expected_digest".to_string(), Value::String(expected));
    }
    guarded(|| ctx.call("replay", payload))
}

/// Generic entry point: `op` names a registered operation, `payload_json`
/// is validated against its schema.
///
/// # Safety
/// `ctx` must come from `detexec_init`; string arguments must be NULL or
/// valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn detexec_call(
    ctx: *const DetexecContext,
    op: *const c_char,
    payload_json: *const c_char,
) -> *mut c_char {
    let Some(ctx) = ctx.as_ref() else {
        return into_c_string(&error_doc(ErrorCode::Internal, "null context"));
    };
    let op = match read_str(op) {
        Ok(Some(op)) => op.to_string(),
        Ok(None) => {
            let e = RegistryError::UnknownOperation(String::new());
            return into_c_string(&error_doc(e.code(), &e.to_string()));
        }
        Err(doc) => return into_c_string(&doc),
    };
    let payload = match read_json(payload_json) {
        Ok(v) => v,
        Err(doc) => return into_c_string(&doc),
    };
    guarded(|| ctx.call(&op, payload))
}

/// Releases a string returned by this library. NULL is ignored.
///
/// # Safety
/// `s` must be NULL or a pointer returned by a `detexec_*` function that has
/// not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn detexec_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Destroys a context. NULL is ignored.
///
/// # Safety
/// `ctx` must be NULL or a pointer returned by `detexec_init` that has not
/// been shut down yet.
#[no_mangle]
pub unsafe extern "C" fn detexec_shutdown(ctx: *mut DetexecContext) {
    if !ctx.is_null() {
        drop(Box::from_raw(ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn take(s: *mut c_char) -> Value {
        assert!(!s.is_null());
        let v = serde_json::from_str(CStr::from_ptr(s).to_str().unwrap()).unwrap();
        detexec_free_string(s);
        v
    }

    fn config_for(dir: &std::path::Path) -> CString {
        let cfg = json!({
            "cas_root": dir.join("store"),
            "workspace_root": dir,
        });
        CString::new(cfg.to_string()).unwrap()
    }

    #[test]
    fn test_abi_mismatch_returns_null() {
        let ctx = unsafe { detexec_init(std::ptr::null(), ENGINE_ABI_VERSION + 1) };
        assert!(ctx.is_null());
    }

    #[test]
    fn test_bad_config_returns_null() {
        let cfg = CString::new("{\"cas_root\": 5}").unwrap();
        let ctx = unsafe { detexec_init(cfg.as_ptr(), ENGINE_ABI_VERSION) };
        assert!(ctx.is_null());
    }

    #[test]
    fn test_call_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_for(dir.path());
        unsafe {
            let ctx = detexec_init(cfg.as_ptr(), detexec_abi_version());
            assert!(!ctx.is_null());

            let op = CString::new("version").unwrap();
            let doc = take(detexec_call(ctx, op.as_ptr(), std::ptr::null()));
            assert_eq!(doc["cas_format_version"], 2);

            let op = CString::new("no_such_op").unwrap();
            let doc = take(detexec_call(ctx, op.as_ptr(), std::ptr::null()));
            assert_eq!(doc["error_code"], "operation_not_found");

            let bad = CString::new("{\"argv\":[]}").unwrap();
            let doc = take(detexec_execute(ctx, bad.as_ptr()));
            assert_eq!(doc["error_code"], "schema_violation");

            let garbage = CString::new("{nope").unwrap();
            let doc = take(detexec_execute(ctx, garbage.as_ptr()));
            assert_eq!(doc["error_code"], "json_parse_error");

            detexec_shutdown(ctx);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_for(dir.path());
        unsafe {
            let ctx = detexec_init(cfg.as_ptr(), ENGINE_ABI_VERSION);
            assert!(!ctx.is_null());
            let req = CString::new(
                r#"{"command":"/bin/sh","argv":["-c","echo ffi"],"policy":{"deterministic":true}}"#,
            )
            .unwrap();
            let result = take(detexec_execute(ctx, req.as_ptr()));
            assert_eq!(result["ok"], true);
            let digest = result["result_digest"].as_str().unwrap().to_string();
            assert!(result["record_digest"].is_string());

            let expected = CString::new(digest.clone()).unwrap();
            let report = take(detexec_replay(ctx, req.as_ptr(), expected.as_ptr()));
            assert_eq!(report["ok"], true, "{report}");
            assert_eq!(report["observed_digest"], digest.as_str());
            assert_eq!(report["source"], "cas");
            detexec_shutdown(ctx);
        }
    }
}
