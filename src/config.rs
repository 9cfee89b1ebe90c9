//! Engine configuration.
//!
//! Layering, lowest to highest: built-in defaults, a YAML file
//! (`--config` or `DETEXEC_CONFIG`), then individual environment variables.
//! The environment is read through [`EnvironmentPort`] only.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cas::DEFAULT_CAS_BASE;
use crate::drift::DriftPolicy;
use crate::ports::EnvironmentPort;
use crate::sandbox::SandboxConfig;
use crate::schema::ErrorCode;

pub const ENV_CONFIG: &str = "DETEXEC_CONFIG";
pub const ENV_CAS_ROOT: &str = "DETEXEC_CAS_ROOT";
pub const ENV_WORKSPACE_ROOT: &str = "DETEXEC_WORKSPACE_ROOT";
pub const ENV_WORKER_ID: &str = "DETEXEC_WORKER_ID";
pub const ENV_NODE_ID: &str = "DETEXEC_NODE_ID";
pub const ENV_CLUSTER_MODE: &str = "DETEXEC_CLUSTER_MODE";
pub const ENV_DRIFT_TOLERANCE_PCT: &str = "DETEXEC_DRIFT_TOLERANCE_PCT";
pub const ENV_DRIFT_NOISE_FLOOR_MS: &str = "DETEXEC_DRIFT_NOISE_FLOOR_MS";
pub const ENV_GC_GRACE_SECS: &str = "DETEXEC_GC_GRACE_SECS";
/// Execution kill-switch.
pub const ENV_INHIBITOR: &str = "FORCE_RUST";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config_invalid: cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config_invalid: {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config_invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config_invalid: {key}={value:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ConfigInvalid
    }
}

fn default_cas_root() -> PathBuf {
    PathBuf::from(DEFAULT_CAS_BASE)
}
fn default_cluster_mode() -> String {
    "standalone".to_string()
}
fn default_gc_grace_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Base directory; the store lives in `<cas_root>/cas/v2`.
    #[serde(default = "default_cas_root")]
    pub cas_root: PathBuf,
    /// Containment boundary for requests that do not name one. Empty means
    /// the current directory.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_cluster_mode")]
    pub cluster_mode: String,
    #[serde(default)]
    pub drift: DriftPolicy,
    #[serde(default = "default_gc_grace_secs")]
    pub gc_grace_secs: u64,
    /// Mirrors `FORCE_RUST=1`.
    #[serde(default)]
    pub inhibited: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cas_root: default_cas_root(),
            workspace_root: None,
            worker_id: None,
            node_id: None,
            cluster_mode: default_cluster_mode(),
            drift: DriftPolicy::default(),
            gc_grace_secs: default_gc_grace_secs(),
            inhibited: false,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// JSON form used by the C ABI. An empty or `null` document means defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Defaults, then the file named by `explicit` or `DETEXEC_CONFIG`, then
    /// environment overrides.
    pub fn load(explicit: Option<&Path>, env: &dyn EnvironmentPort) -> Result<Self, ConfigError> {
        let file = explicit
            .map(Path::to_path_buf)
            .or_else(|| env.non_empty(ENV_CONFIG).map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &dyn EnvironmentPort) -> Result<(), ConfigError> {
        if let Some(v) = env.non_empty(ENV_CAS_ROOT) {
            self.cas_root = PathBuf::from(v);
        }
        if let Some(v) = env.non_empty(ENV_WORKSPACE_ROOT) {
            self.workspace_root = Some(PathBuf::from(v));
        }
        if let Some(v) = env.non_empty(ENV_WORKER_ID) {
            self.worker_id = Some(v);
        }
        if let Some(v) = env.non_empty(ENV_NODE_ID) {
            self.node_id = Some(v);
        }
        if let Some(v) = env.non_empty(ENV_CLUSTER_MODE) {
            self.cluster_mode = v;
        }
        if let Some(v) = env.non_empty(ENV_DRIFT_TOLERANCE_PCT) {
            self.drift.tolerance_pct = parse_number(ENV_DRIFT_TOLERANCE_PCT, &v)?;
        }
        if let Some(v) = env.non_empty(ENV_DRIFT_NOISE_FLOOR_MS) {
            self.drift.noise_floor_ms = parse_number(ENV_DRIFT_NOISE_FLOOR_MS, &v)?;
        }
        if let Some(v) = env.non_empty(ENV_GC_GRACE_SECS) {
            self.gc_grace_secs = v.parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    key: ENV_GC_GRACE_SECS.to_string(),
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if env.is_exactly(ENV_INHIBITOR, "1") {
            self.inhibited = true;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if !self.drift.tolerance_pct.is_finite() || self.drift.tolerance_pct < 0.0 {
            return Err(invalid(
                "drift.tolerance_pct",
                self.drift.tolerance_pct.to_string(),
                "must be a non-negative number",
            ));
        }
        if !self.drift.noise_floor_ms.is_finite() || self.drift.noise_floor_ms < 0.0 {
            return Err(invalid(
                "drift.noise_floor_ms",
                self.drift.noise_floor_ms.to_string(),
                "must be a non-negative number",
            ));
        }
        if self.cas_root.as_os_str().is_empty() {
            return Err(invalid("cas_root", String::new(), "must not be empty"));
        }
        Ok(())
    }

    pub fn sandbox_config(&self, env: &dyn EnvironmentPort) -> SandboxConfig {
        let workspace_root = self
            .workspace_root
            .clone()
            .or_else(|| env.current_dir())
            .unwrap_or_else(|| PathBuf::from("."));
        SandboxConfig {
            inhibited: self.inhibited,
            inhibitor_source: ENV_INHIBITOR.to_string(),
            workspace_root,
            host_env: env.vars(),
        }
    }

    pub fn worker_id(&self, env: &dyn EnvironmentPort) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("w-{}", env.process_id()))
    }

    pub fn node_id(&self, env: &dyn EnvironmentPort) -> String {
        self.node_id
            .clone()
            .or_else(|| env.hostname())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a non-negative number".to_string(),
        })
}
