//! Brute-force protection for logins.
//!
//! Failed attempts are counted per identity. Once an identity has more than
//! four failures, further attempts are rejected until the current lockout
//! window has passed. The window grows with the failure count:
//!
//! | failures | window |
//! |----------|--------|
//! | 5–6      | 1 min  |
//! | 7–9      | 3 min  |
//! | 10–14    | 10 min |
//! | 15+      | 1 h    |
//!
//! The counter itself never expires. Only a successful login removes it.

use crate::clock::{Clock, SystemClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Failures tolerated before lockout windows apply.
pub const FREE_ATTEMPTS: u32 = 4;

const MINUTE_MS: u128 = 60_000;

/// Failure history of one identity since its last successful login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutRecord {
    pub error_count: u32,
    pub last_failure: Instant,
}

/// Result of a lockout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lockout {
    pub locked: bool,
    /// Minutes until the next attempt is accepted (0 when unlocked).
    pub retry_after_minutes: u32,
}

impl Lockout {
    const UNLOCKED: Lockout = Lockout {
        locked: false,
        retry_after_minutes: 0,
    };
}

/// Returns the lockout window for a failure count, or `None` below the threshold.
pub fn lockout_window(error_count: u32) -> Option<Duration> {
    let ms = match error_count {
        0..=FREE_ATTEMPTS => return None,
        5..=6 => 60_000,
        7..=9 => 180_000,
        10..=14 => 600_000,
        _ => 3_600_000,
    };
    Some(Duration::from_millis(ms))
}

/// Tracks failed logins per identity and computes lockouts.
pub struct BruteForceGuard {
    records: Mutex<HashMap<String, LockoutRecord>>,
    clock: Arc<dyn Clock>,
}

impl BruteForceGuard {
    /// Creates a guard using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a guard using the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Checks whether an identity is currently locked out.
    pub fn check_lockout(&self, identity: &str) -> Lockout {
        let record = match self.records.lock().get(identity) {
            Some(record) => *record,
            None => return Lockout::UNLOCKED,
        };

        let Some(window) = lockout_window(record.error_count) else {
            return Lockout::UNLOCKED;
        };

        let elapsed = self
            .clock
            .now()
            .saturating_duration_since(record.last_failure);
        if elapsed >= window {
            return Lockout::UNLOCKED;
        }

        // The first tier always reports a flat minute.
        let retry_after_minutes = if record.error_count < 7 {
            1
        } else {
            let remaining = (window - elapsed).as_millis();
            remaining.div_ceil(MINUTE_MS) as u32
        };

        Lockout {
            locked: true,
            retry_after_minutes,
        }
    }

    /// Records the outcome of a credential check.
    ///
    /// A failure bumps the counter and restarts the window; a success forgets
    /// the identity entirely.
    pub fn record_result(&self, identity: &str, success: bool) {
        let mut records = self.records.lock();
        if success {
            records.remove(identity);
            return;
        }

        let now = self.clock.now();
        let record = records
            .entry(identity.to_string())
            .or_insert(LockoutRecord {
                error_count: 0,
                last_failure: now,
            });
        record.error_count = record.error_count.saturating_add(1);
        record.last_failure = now;

        if record.error_count > FREE_ATTEMPTS {
            tracing::warn!(
                "Identity {} has {} failed login attempts",
                identity,
                record.error_count
            );
        }
    }

    /// Returns the current record for an identity.
    pub fn record(&self, identity: &str) -> Option<LockoutRecord> {
        self.records.lock().get(identity).copied()
    }

    /// Returns the number of identities with recorded failures.
    pub fn tracked_identities(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for BruteForceGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (Arc<ManualClock>, BruteForceGuard) {
        let clock = Arc::new(ManualClock::new());
        let guard = BruteForceGuard::with_clock(clock.clone());
        (clock, guard)
    }

    fn fail(guard: &BruteForceGuard, identity: &str, times: u32) {
        for _ in 0..times {
            guard.record_result(identity, false);
        }
    }

    #[test]
    fn test_four_failures_do_not_lock() {
        let (_clock, guard) = guard();
        fail(&guard, "bob", 4);

        assert_eq!(guard.check_lockout("bob"), Lockout::UNLOCKED);
        assert_eq!(guard.record("bob").unwrap().error_count, 4);
    }

    #[test]
    fn test_five_failures_lock_for_one_minute() {
        let (clock, guard) = guard();
        fail(&guard, "bob", 5);

        let lockout = guard.check_lockout("bob");
        assert!(lockout.locked);
        assert_eq!(lockout.retry_after_minutes, 1);

        clock.advance(Duration::from_secs(59));
        let lockout = guard.check_lockout("bob");
        assert!(lockout.locked);
        assert!(lockout.retry_after_minutes <= 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(guard.check_lockout("bob"), Lockout::UNLOCKED);
    }

    #[test]
    fn test_sixth_failure_window() {
        let (clock, guard) = guard();
        fail(&guard, "bob", 6);

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            guard.check_lockout("bob"),
            Lockout {
                locked: true,
                retry_after_minutes: 1
            }
        );

        clock.advance(Duration::from_secs(31));
        assert!(!guard.check_lockout("bob").locked);
    }

    #[test]
    fn test_second_tier_rounds_up() {
        let (clock, guard) = guard();
        fail(&guard, "carol", 7);

        assert_eq!(guard.check_lockout("carol").retry_after_minutes, 3);

        clock.advance(Duration::from_secs(61));
        // 119s remaining
        assert_eq!(guard.check_lockout("carol").retry_after_minutes, 2);

        clock.advance(Duration::from_secs(118));
        assert_eq!(guard.check_lockout("carol").retry_after_minutes, 1);

        clock.advance(Duration::from_secs(1));
        assert!(!guard.check_lockout("carol").locked);
    }

    #[test]
    fn test_third_and_fourth_tiers() {
        let (clock, guard) = guard();
        fail(&guard, "dave", 10);
        assert_eq!(guard.check_lockout("dave").retry_after_minutes, 10);

        fail(&guard, "dave", 5);
        assert_eq!(guard.record("dave").unwrap().error_count, 15);
        assert_eq!(guard.check_lockout("dave").retry_after_minutes, 60);

        clock.advance(Duration::from_secs(3599));
        assert_eq!(guard.check_lockout("dave").retry_after_minutes, 1);

        clock.advance(Duration::from_secs(1));
        assert!(!guard.check_lockout("dave").locked);
    }

    #[test]
    fn test_counter_survives_expired_window() {
        let (clock, guard) = guard();
        fail(&guard, "erin", 20);
        clock.advance(Duration::from_secs(7200));
        assert!(!guard.check_lockout("erin").locked);

        // One more failure restarts the full one-hour window.
        guard.record_result("erin", false);
        assert_eq!(guard.record("erin").unwrap().error_count, 21);
        assert_eq!(guard.check_lockout("erin").retry_after_minutes, 60);
    }

    #[test]
    fn test_success_clears_record() {
        let (_clock, guard) = guard();
        fail(&guard, "frank", 17);
        assert!(guard.check_lockout("frank").locked);

        guard.record_result("frank", true);
        assert!(guard.record("frank").is_none());
        assert_eq!(guard.tracked_identities(), 0);
        assert_eq!(guard.check_lockout("frank"), Lockout::UNLOCKED);
    }

    #[test]
    fn test_success_without_record_is_noop() {
        let (_clock, guard) = guard();
        guard.record_result("nobody", true);
        assert_eq!(guard.tracked_identities(), 0);
    }

    #[test]
    fn test_identities_are_independent() {
        let (_clock, guard) = guard();
        fail(&guard, "a", 5);
        fail(&guard, "b", 1);

        assert!(guard.check_lockout("a").locked);
        assert!(!guard.check_lockout("b").locked);
        assert_eq!(guard.tracked_identities(), 2);
    }

    #[test]
    fn test_windows_monotonic() {
        let windows: Vec<Duration> = [5, 6, 7, 9, 10, 14, 15, 20, 1000]
            .iter()
            .map(|&n| lockout_window(n).unwrap())
            .collect();
        assert!(windows.windows(2).all(|pair| pair[0] <= pair[1]));

        assert!(lockout_window(6).unwrap() <= lockout_window(9).unwrap());
        assert!(lockout_window(9).unwrap() <= lockout_window(14).unwrap());
        assert!(lockout_window(14).unwrap() <= lockout_window(20).unwrap());
        assert_eq!(lockout_window(4), None);
        assert_eq!(lockout_window(0), None);
    }
}
