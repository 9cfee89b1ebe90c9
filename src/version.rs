//! Version manifest.
//!
//! Every reporting surface (health, doctor, version, the C ABI, CAS layout
//! markers, replay log entries) reads its numbers from here.

use serde::Serialize;

/// Stability contract of the C-callable boundary. Mirrors `DETEXEC_ABI_VERSION`
/// in `include/detexec.h`.
pub const ENGINE_ABI_VERSION: u32 = 1;
/// 1 = BLAKE3, 32-byte output, lowercase hex encoding.
pub const HASH_ALGORITHM_VERSION: u32 = 1;
pub const CAS_FORMAT_VERSION: u32 = 2;
pub const PROTOCOL_FRAMING_VERSION: u32 = 1;
pub const REPLAY_LOG_VERSION: u32 = 1;
pub const AUDIT_LOG_VERSION: u32 = 1;
pub const HASH_PRIMITIVE: &str = "blake3";
pub const ENGINE_SEMVER: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIMESTAMP: &str = env!("DETEXEC_BUILD_TIMESTAMP");

/// Directory name of the CAS layout this build reads and writes.
pub const CAS_LAYOUT_DIR: &str = "v2";
pub const PROTOCOL_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VersionManifest {
    pub engine_abi_version: u32,
    pub hash_algorithm_version: u32,
    pub cas_format_version: u32,
    pub protocol_framing_version: u32,
    pub replay_log_version: u32,
    pub audit_log_version: u32,
    pub engine_semver: &'static str,
    pub hash_primitive: &'static str,
    pub build_timestamp: &'static str,
}

pub const fn manifest() -> VersionManifest {
    VersionManifest {
        engine_abi_version: ENGINE_ABI_VERSION,
        hash_algorithm_version: HASH_ALGORITHM_VERSION,
        cas_format_version: CAS_FORMAT_VERSION,
        protocol_framing_version: PROTOCOL_FRAMING_VERSION,
        replay_log_version: REPLAY_LOG_VERSION,
        audit_log_version: AUDIT_LOG_VERSION,
        engine_semver: ENGINE_SEMVER,
        hash_primitive: HASH_PRIMITIVE,
        build_timestamp: BUILD_TIMESTAMP,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("abi_version_mismatch: caller built against ABI v{caller}, engine provides v{engine}")]
pub struct AbiMismatch {
    pub caller: u32,
    pub engine: u32,
}

/// Checks a caller's compiled ABI version against this engine.
pub fn check_compatibility(caller_abi: u32) -> Result<(), AbiMismatch> {
    if caller_abi == ENGINE_ABI_VERSION {
        Ok(())
    } else {
        Err(AbiMismatch {
            caller: caller_abi,
            engine: ENGINE_ABI_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_fixed_versions() {
        let m = manifest();
        assert_eq!(m.hash_algorithm_version, 1);
        assert_eq!(m.cas_format_version, 2);
        assert_eq!(m.hash_primitive, "blake3");
        assert!(m.engine_abi_version >= 1);
        assert!(!m.build_timestamp.is_empty());
    }

    #[test]
    fn test_layout_dir_matches_format_version() {
        assert_eq!(CAS_LAYOUT_DIR, format!("v{CAS_FORMAT_VERSION}"));
    }

    #[test]
    fn test_check_compatibility() {
        assert!(check_compatibility(ENGINE_ABI_VERSION).is_ok());
        let err = check_compatibility(ENGINE_ABI_VERSION + 1).unwrap_err();
        assert_eq!(err.engine, ENGINE_ABI_VERSION);
        assert!(err.to_string().starts_with("abi_version_mismatch"));
    }
}
