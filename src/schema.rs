use std::collections::BTreeMap;
use std::sync::OnceLock;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};

use crate::digest::DigestInfo;

/// Enumerated failure categories carried by every result and error document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    None,
    JsonParseError,
    SchemaViolation,
    PathEscape,
    MissingInput,
    SpawnFailed,
    Timeout,
    InvalidDigest,
    NotFound,
    OperationNotFound,
    CasIntegrityFailed,
    VersionMismatch,
    AbiVersionMismatch,
    HashBackendMismatch,
    ReplayFailed,
    DriftDetected,
    HashUnavailableBlake3,
    ExecutionInhibited,
    ConfigInvalid,
    IoError,
    Internal,
}

impl ErrorCode {
    pub const ALL: &'static [ErrorCode] = &[
        ErrorCode::None,
        ErrorCode::JsonParseError,
        ErrorCode::SchemaViolation,
        ErrorCode::PathEscape,
        ErrorCode::MissingInput,
        ErrorCode::SpawnFailed,
        ErrorCode::Timeout,
        ErrorCode::InvalidDigest,
        ErrorCode::NotFound,
        ErrorCode::OperationNotFound,
        ErrorCode::CasIntegrityFailed,
        ErrorCode::VersionMismatch,
        ErrorCode::AbiVersionMismatch,
        ErrorCode::HashBackendMismatch,
        ErrorCode::ReplayFailed,
        ErrorCode::DriftDetected,
        ErrorCode::HashUnavailableBlake3,
        ErrorCode::ExecutionInhibited,
        ErrorCode::ConfigInvalid,
        ErrorCode::IoError,
        ErrorCode::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::None => "none",
            ErrorCode::JsonParseError => "json_parse_error",
            ErrorCode::SchemaViolation => "schema_violation",
            ErrorCode::PathEscape => "path_escape",
            ErrorCode::MissingInput => "missing_input",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidDigest => "invalid_digest",
            ErrorCode::NotFound => "not_found",
            ErrorCode::OperationNotFound => "operation_not_found",
            ErrorCode::CasIntegrityFailed => "cas_integrity_failed",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::AbiVersionMismatch => "abi_version_mismatch",
            ErrorCode::HashBackendMismatch => "hash_backend_mismatch",
            ErrorCode::ReplayFailed => "replay_failed",
            ErrorCode::DriftDetected => "drift_detected",
            ErrorCode::HashUnavailableBlake3 => "hash_unavailable_blake3",
            ErrorCode::ExecutionInhibited => "execution_inhibited",
            ErrorCode::ConfigInvalid => "config_invalid",
            ErrorCode::IoError => "io_error",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    #[default]
    Exited,
    Signal,
    Timeout,
    SpawnFailed,
    /// Rejected before spawn (containment or validation).
    Refused,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Exited => "exited",
            TerminationReason::Signal => "signal",
            TerminationReason::Timeout => "timeout",
            TerminationReason::SpawnFailed => "spawn_failed",
            TerminationReason::Refused => "refused",
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_mode() -> String {
    "strict".to_string()
}
fn default_time_mode() -> String {
    "fixed_zero".to_string()
}
fn default_scheduler_mode() -> String {
    "turbo".to_string()
}
fn default_env_denylist() -> Vec<String> {
    ["RANDOM", "TZ", "HOSTNAME", "PWD", "OLDPWD", "SHLVL"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_required_env() -> BTreeMap<String, String> {
    BTreeMap::from([("PYTHONHASHSEED".to_string(), "0".to_string())])
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_max_output_bytes() -> u64 {
    4096
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ExecPolicy {
    #[serde(default = "default_true")]
    pub deterministic: bool,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_time_mode")]
    pub time_mode: String,
    #[serde(default = "default_scheduler_mode")]
    pub scheduler_mode: String,
    #[serde(default)]
    pub inherit_env: bool,
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default = "default_env_denylist")]
    pub env_denylist: Vec<String>,
    #[serde(default = "default_required_env")]
    pub required_env: BTreeMap<String, String>,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_memory_bytes: u64,
    #[serde(default)]
    pub max_file_descriptors: u64,
    #[serde(default)]
    pub max_cpu_seconds: u64,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            deterministic: true,
            mode: default_mode(),
            time_mode: default_time_mode(),
            scheduler_mode: default_scheduler_mode(),
            inherit_env: false,
            env_allowlist: Vec::new(),
            env_denylist: default_env_denylist(),
            required_env: default_required_env(),
            max_memory_bytes: 0,
            max_file_descriptors: 0,
            max_cpu_seconds: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub request_id: String,
    /// Empty means "use the engine's configured workspace root".
    #[serde(default)]
    pub workspace_root: String,
    pub command: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default)]
    pub policy: ExecPolicy,
    /// Caller identity. Never part of the canonical form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            request_id: String::new(),
            workspace_root: String::new(),
            command: command.into(),
            argv,
            env: BTreeMap::new(),
            cwd: String::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            nonce: 0,
            timeout_ms: default_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            policy: ExecPolicy::default(),
            tenant_id: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub seq: u64,
    /// Always 0 under a deterministic policy.
    pub t_ns: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct PolicyApplied {
    pub mode: String,
    pub time_mode: String,
    pub allowed_keys: Vec<String>,
    pub denied_keys: Vec<String>,
    pub injected_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct SandboxApplied {
    pub enforced: Vec<String>,
    pub unsupported: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct DeterminismConfidence {
    pub level: String,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub ok: bool,
    pub exit_code: i32,
    pub error_code: ErrorCode,
    pub termination_reason: TerminationReason,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub request_digest: String,
    #[serde(default)]
    pub stdout_digest: String,
    #[serde(default)]
    pub stderr_digest: String,
    #[serde(default)]
    pub trace_digest: String,
    pub result_digest: String,
    #[serde(default)]
    pub trace_events: Vec<TraceEvent>,
    #[serde(default)]
    pub output_digests: BTreeMap<String, String>,
    #[serde(default)]
    pub policy_applied: PolicyApplied,
    #[serde(default)]
    pub sandbox_applied: SandboxApplied,
    #[serde(default)]
    pub determinism_confidence: DeterminismConfidence,
    #[serde(default)]
    pub digest_info: DigestInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    // Lifecycle metadata below is never hashed.
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub start_timestamp: String,
    #[serde(default)]
    pub end_timestamp: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("json_parse_error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("schema_violation: {}", .0.join("; "))]
    Schema(Vec<String>),
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::Parse(_) => ErrorCode::JsonParseError,
            RequestError::Schema(_) => ErrorCode::SchemaViolation,
        }
    }
}

pub fn request_schema_json() -> serde_json::Value {
    let string_map = serde_json::json!({"type": "object", "additionalProperties": {"type": "string"}});
    let string_list = serde_json::json!({"type": "array", "items": {"type": "string"}, "maxItems": 10000});
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "ExecutionRequest",
        "type": "object",
        "required": ["command"],
        "properties": {
            "request_id": {"type": "string", "maxLength": 256},
            "workspace_root": {"type": "string"},
            "command": {"type": "string", "minLength": 1},
            "argv": string_list,
            "env": string_map,
            "cwd": {"type": "string"},
            "inputs": string_map,
            "outputs": string_list,
            "nonce": {"type": "integer", "minimum": 0},
            "timeout_ms": {"type": "integer", "minimum": 1},
            "max_output_bytes": {"type": "integer", "minimum": 0},
            "tenant_id": {"type": "string"},
            "policy": {
                "type": "object",
                "properties": {
                    "deterministic": {"type": "boolean"},
                    "mode": {"type": "string"},
                    "time_mode": {"type": "string"},
                    "scheduler_mode": {"type": "string"},
                    "inherit_env": {"type": "boolean"},
                    "env_allowlist": {"type": "array", "items": {"type": "string"}},
                    "env_denylist": {"type": "array", "items": {"type": "string"}},
                    "required_env": {"type": "object", "additionalProperties": {"type": "string"}},
                    "max_memory_bytes": {"type": "integer", "minimum": 0},
                    "max_file_descriptors": {"type": "integer", "minimum": 0},
                    "max_cpu_seconds": {"type": "integer", "minimum": 0}
                }
            }
        }
    })
}

/// Compiles a JSON schema into validation messages for `instance`.
pub fn validate_against(schema: &JSONSchema, instance: &serde_json::Value) -> Result<(), RequestError> {
    if let Err(errors) = schema.validate(instance) {
        let messages: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        return Err(RequestError::Schema(messages));
    }
    Ok(())
}

pub fn compile_schema(schema: &serde_json::Value) -> Result<JSONSchema, String> {
    JSONSchema::compile(schema).map_err(|e| e.to_string())
}

fn request_schema() -> Result<&'static JSONSchema, RequestError> {
    static SCHEMA: OnceLock<Result<JSONSchema, String>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| compile_schema(&request_schema_json()))
        .as_ref()
        .map_err(|e| RequestError::Schema(vec![format!("request schema failed to compile: {e}")]))
}

/// Validates an already-parsed JSON value and converts it into a request.
pub fn request_from_value(value: serde_json::Value) -> Result<ExecutionRequest, RequestError> {
    validate_against(request_schema()?, &value)?;
    Ok(serde_json::from_value(value)?)
}

/// Parses and validates a request document. Nothing is executed or written
/// when this fails.
pub fn parse_request(data: &str) -> Result<ExecutionRequest, RequestError> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    request_from_value(value)
}

pub fn parse_result(data: &str) -> Result<ExecutionResult, RequestError> {
    Ok(serde_json::from_str(data)?)
}
