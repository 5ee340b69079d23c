use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff shared by the upload and download managers.
///
/// Attempt `k` (1-based) waits `base_delay * 2^(k-1)` before it runs, except
/// the first attempt which runs immediately. With the defaults that is
/// 0 s, 2 s, 4 s for three attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Backoff cap.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before `attempt` (1-based). `None` for the first attempt.
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return None;
        }
        let exp = (attempt - 1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        Some(delay.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn first_attempt_runs_immediately() {
        assert_eq!(RetryPolicy::default().delay_before_attempt(1), None);
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before_attempt(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_before_attempt(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_before_attempt(4), Some(Duration::from_secs(8)));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_before_attempt(10), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_before_attempt(u32::MAX), Some(Duration::from_secs(5)));
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(!policy.allows_retry_after(1));
    }

    #[test]
    fn serializes_delays_as_millis() {
        let json = r#"{"max_attempts":5,"base_delay":250,"max_delay":10000}"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(serde_json::to_string(&policy).unwrap(), json);
    }
}
