//! Backoff schedule for conflicting writes.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total tries, including the first.
  pub max_attempts: u32,
  pub base_delay:   Duration,
  pub max_delay:    Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay:   Duration::from_millis(50),
      max_delay:    Duration::from_secs(2),
    }
  }
}

impl RetryPolicy {
  /// Delay before try number `attempt + 1`, given that `attempt` (1-based)
  /// just failed: `base * 2^(attempt - 1)`, capped.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  pub fn max_attempts(&self) -> u32 { self.max_attempts.max(1) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn delays_double_then_cap() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_after(1), Duration::from_millis(50));
    assert_eq!(policy.delay_after(2), Duration::from_millis(100));
    assert_eq!(policy.delay_after(3), Duration::from_millis(200));
    assert_eq!(policy.delay_after(10), Duration::from_secs(2));
    assert_eq!(policy.delay_after(64), Duration::from_secs(2));
  }

  #[test]
  fn at_least_one_attempt() {
    let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
    assert_eq!(policy.max_attempts(), 1);
  }
}
