//! Per-child resource limits.
//!
//! Applied between fork and exec, so everything called from
//! [`apply_in_child`] must be async-signal-safe: plain syscalls, no
//! allocation, no locks.

use crate::schema::ExecPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// 0 means unlimited for every field.
    pub address_space_bytes: u64,
    pub open_files: u64,
    pub cpu_seconds: u64,
}

impl ResourceLimits {
    pub fn from_policy(policy: &ExecPolicy) -> Self {
        Self {
            address_space_bytes: policy.max_memory_bytes,
            open_files: policy.max_file_descriptors,
            cpu_seconds: policy.max_cpu_seconds,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address_space_bytes == 0 && self.open_files == 0 && self.cpu_seconds == 0
    }

    /// Capability names for the limits this platform can enforce, split into
    /// (enforced, unsupported).
    pub fn capability_names(&self) -> (Vec<String>, Vec<String>) {
        let mut enforced = Vec::new();
        let mut unsupported = Vec::new();
        let mut push = |requested: bool, supported: bool, name: &str| {
            if !requested {
                return;
            }
            if supported {
                enforced.push(name.to_string());
            } else {
                unsupported.push(name.to_string());
            }
        };
        push(
            self.address_space_bytes > 0,
            cfg!(target_os = "linux"),
            "rlimit_as",
        );
        push(self.open_files > 0, cfg!(unix), "rlimit_nofile");
        push(self.cpu_seconds > 0, cfg!(unix), "rlimit_cpu");
        (enforced, unsupported)
    }
}

/// Whether this build can set rlimits at all.
pub const fn supported() -> bool {
    cfg!(unix)
}

#[cfg(unix)]
pub fn apply_in_child(limits: ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    let to_io = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);

    #[cfg(target_os = "linux")]
    if limits.address_space_bytes > 0 {
        setrlimit(
            Resource::RLIMIT_AS,
            limits.address_space_bytes,
            limits.address_space_bytes,
        )
        .map_err(to_io)?;
    }
    if limits.open_files > 0 {
        setrlimit(Resource::RLIMIT_NOFILE, limits.open_files, limits.open_files).map_err(to_io)?;
    }
    if limits.cpu_seconds > 0 {
        setrlimit(Resource::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds).map_err(to_io)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_in_child(_limits: ResourceLimits) -> std::io::Result<()> {
    Ok(())
}
