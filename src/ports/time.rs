use chrono::{DateTime, SecondsFormat};

pub trait TimePort: Send + Sync {
    fn now_millis(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }

    /// RFC 3339 UTC timestamp with millisecond precision.
    fn now_rfc3339(&self) -> String {
        let millis = i64::try_from(self.now_millis()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(millis)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default()
    }
}
