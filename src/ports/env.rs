use std::collections::BTreeMap;
use std::path::PathBuf;

/// Read-only view of the process environment. Configuration is loaded
/// through this port so tests never mutate the real environment.
pub trait EnvironmentPort: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
    /// Snapshot of every variable, for children that inherit the host env.
    fn vars(&self) -> BTreeMap<String, String>;
    fn current_dir(&self) -> Option<PathBuf>;
    fn hostname(&self) -> Option<String>;
    fn process_id(&self) -> u32;

    /// Set and non-empty.
    fn non_empty(&self, key: &str) -> Option<String> {
        self.var(key).filter(|v| !v.is_empty())
    }

    /// Exact match, no truthiness rules: `FORCE_RUST=true` is not `1`.
    fn is_exactly(&self, key: &str, expected: &str) -> bool {
        self.var(key).as_deref() == Some(expected)
    }
}
