use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(secs)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Time since this timestamp, saturating at zero for future values
    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Self::now())
    }

    pub fn elapsed_at(&self, now: Timestamp) -> Duration {
        Duration::from_secs(now.0.saturating_sub(self.0))
    }

    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs()))
    }

    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_secs()))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_elapsed() {
        let ts1 = Timestamp::now();
        let ts2 = Timestamp::from_secs(ts1.as_secs() - 10);
        assert!(ts2.elapsed().as_secs() >= 10);
    }

    #[test]
    fn test_future_timestamp_saturates() {
        let now = Timestamp::from_secs(1_000);
        let later = now.saturating_add(Duration::from_secs(60));
        assert_eq!(later.elapsed_at(now), Duration::ZERO);
        assert_eq!(now.elapsed_at(later), Duration::from_secs(60));
    }
}
