//! Operation registry: `{name -> (payload schema, decoder)}`.
//!
//! Every named operation decodes into one [`Operation`] variant after its
//! payload passed schema validation, and [`OperationRegistry::dispatch`]
//! matches on the variant. The registry is an ordinary value built at start
//! up and owned by whoever embeds the engine.

use std::collections::BTreeMap;
use std::time::Duration;

use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::diagnostics;
use crate::engine::{Engine, EngineError, ExecOptions};
use crate::replay::{self, ReplayMode};
use crate::schema::{
    compile_schema, request_schema_json, validate_against, ErrorCode, ExecutionRequest,
    ExecutionResult, RequestError,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Execute {
        request: ExecutionRequest,
        store: bool,
    },
    Replay {
        request: ExecutionRequest,
        expected_digest: Option<String>,
        mode: ReplayMode,
    },
    DigestVerify {
        result: Box<ExecutionResult>,
    },
    CasGc {
        grace_secs: Option<u64>,
        dry_run: bool,
    },
    AuditVerify,
    Health,
    Doctor,
    ValidateReplacement,
    Version,
    Metrics,
    Status,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("operation_not_found: {0}")]
    UnknownOperation(String),

    #[error(transparent)]
    Payload(#[from] RequestError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::UnknownOperation(_) => ErrorCode::OperationNotFound,
            RegistryError::Payload(e) => e.code(),
            RegistryError::Engine(e) => e.code(),
        }
    }
}

/// Diagnostics are read-only but still refuse to run under the inhibitor.
fn report(
    engine: &Engine,
    render: impl FnOnce(&Engine) -> Result<Value, serde_json::Error>,
) -> Result<Value, RegistryError> {
    engine.ensure_enabled()?;
    render(engine).map_err(|e| RegistryError::Engine(EngineError::Internal(e.to_string())))
}

type Decoder = fn(Value) -> Result<Operation, serde_json::Error>;

struct OperationSpec {
    schema: JSONSchema,
    schema_json: Value,
    decode: Decoder,
}

#[derive(Deserialize)]
struct ExecutePayload {
    request: ExecutionRequest,
    #[serde(default = "default_store")]
    store: bool,
}

fn default_store() -> bool {
    true
}

#[derive(Deserialize)]
struct ReplayPayload {
    request: ExecutionRequest,
    #[serde(default)]
    expected_digest: Option<String>,
    #[serde(default)]
    mode: ReplayMode,
}

#[derive(Deserialize)]
struct DigestVerifyPayload {
    result: ExecutionResult,
}

#[derive(Deserialize, Default)]
struct GcPayload {
    #[serde(default)]
    grace_secs: Option<u64>,
    #[serde(default)]
    dry_run: bool,
}

fn empty_schema() -> Value {
    json!({"type": ["object", "null"], "additionalProperties": false})
}

pub struct OperationRegistry {
    ops: BTreeMap<&'static str, OperationSpec>,
}

impl OperationRegistry {
    /// Registry with every built-in operation.
    pub fn new() -> Result<Self, String> {
        let mut registry = Self { ops: BTreeMap::new() };
        let request = request_schema_json();
        registry.register(
            "execute",
            json!({
                "type": "object",
                "required": ["request"],
                "properties": {"request": request, "store": {"type": "boolean"}},
                "additionalProperties": false
            }),
            |v| {
                let p: ExecutePayload = serde_json::from_value(v)?;
                Ok(Operation::Execute {
                    request: p.request,
                    store: p.store,
                })
            },
        )?;
        registry.register(
            "replay",
            json!({
                "type": "object",
                "required": ["request"],
                "properties": {
                    "request": request,
                    "expected_digest": {"type": "string", "pattern": "^[0-9a-f]{64}$"},
                    "mode": {"enum": ["auto", "stored", "reexecute"]}
                },
                "additionalProperties": false
            }),
            |v| {
                let p: ReplayPayload = serde_json::from_value(v)?;
                Ok(Operation::Replay {
                    request: p.request,
                    expected_digest: p.expected_digest,
                    mode: p.mode,
                })
            },
        )?;
        registry.register(
            "digest_verify",
            json!({
                "type": "object",
                "required": ["result"],
                "properties": {"result": {"type": "object", "required": ["result_digest"]}}
            }),
            |v| {
                let p: DigestVerifyPayload = serde_json::from_value(v)?;
                Ok(Operation::DigestVerify {
                    result: Box::new(p.result),
                })
            },
        )?;
        registry.register(
            "cas_gc",
            json!({
                "type": ["object", "null"],
                "properties": {
                    "grace_secs": {"type": "integer", "minimum": 0},
                    "dry_run": {"type": "boolean"}
                },
                "additionalProperties": false
            }),
            |v| {
                let p: GcPayload = if v.is_null() {
                    GcPayload::default()
                } else {
                    serde_json::from_value(v)?
                };
                Ok(Operation::CasGc {
                    grace_secs: p.grace_secs,
                    dry_run: p.dry_run,
                })
            },
        )?;
        registry.register("audit_verify", empty_schema(), |_| Ok(Operation::AuditVerify))?;
        registry.register("health", empty_schema(), |_| Ok(Operation::Health))?;
        registry.register("doctor", empty_schema(), |_| Ok(Operation::Doctor))?;
        registry.register("validate_replacement", empty_schema(), |_| {
            Ok(Operation::ValidateReplacement)
        })?;
        registry.register("version", empty_schema(), |_| Ok(Operation::Version))?;
        registry.register("metrics", empty_schema(), |_| Ok(Operation::Metrics))?;
        registry.register("status", empty_schema(), |_| Ok(Operation::Status))?;
        Ok(registry)
    }

    fn register(&mut self, name: &'static str, schema_json: Value, decode: Decoder) -> Result<(), String> {
        let schema = compile_schema(&schema_json).map_err(|e| format!("{name}: {e}"))?;
        self.ops.insert(
            name,
            OperationSpec {
                schema,
                schema_json,
                decode,
            },
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ops.keys().copied().collect()
    }

    pub fn schema(&self, name: &str) -> Option<&Value> {
        self.ops.get(name).map(|s| &s.schema_json)
    }

    /// Validates `payload` against the schema registered for `name` and
    /// decodes it.
    pub fn resolve(&self, name: &str, payload: Value) -> Result<Operation, RegistryError> {
        let spec = self
            .ops
            .get(name)
            .ok_or_else(|| RegistryError::UnknownOperation(name.to_string()))?;
        validate_against(&spec.schema, &payload)?;
        (spec.decode)(payload).map_err(|e| RegistryError::Payload(RequestError::Parse(e)))
    }

    pub async fn dispatch(&self, engine: &Engine, op: Operation) -> Result<Value, RegistryError> {
        let to_value = |v: Result<Value, serde_json::Error>| {
            v.map_err(|e| RegistryError::Engine(EngineError::Internal(e.to_string())))
        };
        match op {
            Operation::Execute { request, store } => {
                let out = engine.execute(&request, ExecOptions { store }).await?;
                let mut doc = to_value(serde_json::to_value(&out.result))?;
                if let (Some(record), Value::Object(map)) = (out.record_digest, &mut doc) {
                    map.insert("record_digest".to_string(), Value::String(record.to_hex()));
                }
                Ok(doc)
            }
            Operation::Replay {
                request,
                expected_digest,
                mode,
            } => {
                let report = engine.replay(&request, expected_digest.as_deref(), mode).await?;
                to_value(serde_json::to_value(report))
            }
            Operation::DigestVerify { result } => {
                engine.ensure_enabled()?;
                to_value(serde_json::to_value(replay::verify_result(&result)))
            }
            Operation::CasGc {
                grace_secs,
                dry_run,
            } => {
                let mut options = engine.default_gc_options();
                if let Some(secs) = grace_secs {
                    options.grace = Duration::from_secs(secs);
                }
                options.dry_run = dry_run;
                let summary = engine.gc(&options)?;
                to_value(serde_json::to_value(summary))
            }
            Operation::AuditVerify => to_value(serde_json::to_value(engine.audit_verify()?)),
            Operation::Health => report(engine, |_| serde_json::to_value(diagnostics::health())),
            Operation::Doctor => report(engine, |e| serde_json::to_value(diagnostics::doctor(e))),
            Operation::ValidateReplacement => report(engine, |_| {
                serde_json::to_value(diagnostics::validate_replacement())
            }),
            Operation::Version => report(engine, |_| serde_json::to_value(diagnostics::version())),
            Operation::Metrics => report(engine, |e| serde_json::to_value(diagnostics::metrics(e))),
            Operation::Status => report(engine, |e| serde_json::to_value(diagnostics::status(e))),
        }
    }

    pub async fn call(&self, engine: &Engine, name: &str, payload: Value) -> Result<Value, RegistryError> {
        let op = self.resolve(name, payload)?;
        self.dispatch(engine, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MapEnvAdapter;
    use crate::config::EngineConfig;

    fn engine(dir: &std::path::Path, inhibited: bool) -> Engine {
        let config = EngineConfig {
            cas_root: dir.join("store"),
            workspace_root: Some(dir.to_path_buf()),
            inhibited,
            ..EngineConfig::default()
        };
        Engine::new(config, &MapEnvAdapter::default())
    }

    #[test]
    fn test_all_operations_registered() {
        let reg = OperationRegistry::new().unwrap();
        let names = reg.names();
        for op in [
            "execute",
            "replay",
            "digest_verify",
            "cas_gc",
            "audit_verify",
            "health",
            "doctor",
            "validate_replacement",
            "version",
            "metrics",
            "status",
        ] {
            assert!(names.contains(&op), "missing {op}");
            assert!(reg.schema(op).is_some());
        }
    }

    #[test]
    fn test_unknown_operation() {
        let reg = OperationRegistry::new().unwrap();
        let err = reg.resolve("launch_missiles", Value::Null).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OperationNotFound);
    }

    #[test]
    fn test_payload_validated_before_decode() {
        let reg = OperationRegistry::new().unwrap();
        let err = reg
            .resolve("execute", json!({"request": {"argv": ["x"]}}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
        let err = reg.resolve("health", json!({"extra": 1})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
        let err = reg
            .resolve("replay", json!({"request": {"command": "/bin/true"}, "expected_digest": "XYZ"}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
    }

    #[test]
    fn test_decode_defaults() {
        let reg = OperationRegistry::new().unwrap();
        match reg
            .resolve("execute", json!({"request": {"command": "/bin/true"}}))
            .unwrap()
        {
            Operation::Execute { request, store } => {
                assert!(store);
                assert_eq!(request.timeout_ms, 5000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            reg.resolve("cas_gc", Value::Null).unwrap(),
            Operation::CasGc {
                grace_secs: None,
                dry_run: false
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_health_and_inhibitor() {
        let dir = tempfile::tempdir().unwrap();
        let reg = OperationRegistry::new().unwrap();
        let doc = reg
            .call(&engine(dir.path(), false), "health", Value::Null)
            .await
            .unwrap();
        assert_eq!(doc["hash_primitive"], "blake3");

        let err = reg
            .call(&engine(dir.path(), true), "health", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutionInhibited);
    }
}
