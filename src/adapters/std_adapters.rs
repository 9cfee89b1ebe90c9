use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ports::{EnvironmentPort, TimePort};

/// Wall clock.
pub struct StdTimeAdapter;

impl TimePort for StdTimeAdapter {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTimeAdapter(pub u64);

impl TimePort for FixedTimeAdapter {
    fn now_millis(&self) -> u64 {
        self.0
    }
}

/// The real process environment.
pub struct StdEnvAdapter;

impl EnvironmentPort for StdEnvAdapter {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn vars(&self) -> BTreeMap<String, String> {
        std::env::vars().collect()
    }

    fn current_dir(&self) -> Option<PathBuf> {
        std::env::current_dir().ok()
    }

    fn hostname(&self) -> Option<String> {
        #[cfg(unix)]
        let name = nix::unistd::gethostname().ok().and_then(|h| h.into_string().ok());
        #[cfg(not(unix))]
        let name = std::env::var("COMPUTERNAME").ok();
        name.filter(|h| !h.is_empty())
    }

    fn process_id(&self) -> u32 {
        std::process::id()
    }
}

/// Environment backed by a map, for tests and embedders that pass
/// configuration explicitly.
#[derive(Debug, Clone, Default)]
pub struct MapEnvAdapter {
    pub vars: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub hostname: Option<String>,
    pub pid: u32,
}

impl MapEnvAdapter {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            pid: 1,
            ..Self::default()
        }
    }
}

impl EnvironmentPort for MapEnvAdapter {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn vars(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }

    fn current_dir(&self) -> Option<PathBuf> {
        self.cwd.clone()
    }

    fn hostname(&self) -> Option<String> {
        self.hostname.clone()
    }

    fn process_id(&self) -> u32 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_formats_rfc3339() {
        let clock = FixedTimeAdapter(0);
        assert_eq!(clock.now_rfc3339(), "1970-01-01T00:00:00.000Z");
        assert_eq!(FixedTimeAdapter(2_500).now_secs(), 2);
    }

    #[test]
    fn test_map_env_lookups() {
        let env = MapEnvAdapter::new([("A", "1"), ("B", "true"), ("C", "")]);
        assert!(env.is_exactly("A", "1"));
        assert!(!env.is_exactly("B", "1"));
        assert!(!env.is_exactly("missing", "1"));
        assert_eq!(env.non_empty("C"), None);
        assert_eq!(env.var("C").as_deref(), Some(""));
        assert_eq!(env.current_dir(), None);
    }

    #[test]
    fn test_std_clock_is_after_2020() {
        assert!(StdTimeAdapter.now_secs() > 1_577_836_800);
    }
}
