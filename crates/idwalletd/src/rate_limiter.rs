use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits applied per user.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Failures within `window` that trigger a lockout.
    pub max_failures: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(300),
        }
    }
}

struct UserRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl UserRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Per-user limiter for verification sessions.
///
/// Only a completed comparison that did not match counts as a failure.
/// Timeouts, provider errors and cancelled sessions do not. Once a user is
/// locked out, new sessions are refused until the lockout expires.
pub struct RateLimiter {
    limits: RateLimits,
    records: HashMap<String, UserRecord>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            records: HashMap::new(),
        }
    }

    /// Return `Ok(())` if the user may start a verification.
    /// Return `Err(message)` if the user is currently locked out.
    pub fn check(&mut self, user: &str, now: Instant) -> Result<(), String> {
        let window = self.limits.window;
        let record = self
            .records
            .entry(user.to_string())
            .or_insert_with(|| UserRecord::fresh(now));

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                let remaining = locked_until.duration_since(now).as_secs();
                return Err(format!(
                    "too many failed verifications; try again in {remaining}s"
                ));
            }
            *record = UserRecord::fresh(now);
        } else if now.duration_since(record.window_start) >= window {
            record.failures = 0;
            record.window_start = now;
        }

        Ok(())
    }

    /// Record a verification that ended without a match. May trigger a lockout.
    pub fn record_failure(&mut self, user: &str, now: Instant) {
        let limits = self.limits;
        let record = self
            .records
            .entry(user.to_string())
            .or_insert_with(|| UserRecord::fresh(now));

        if now.duration_since(record.window_start) >= limits.window {
            record.failures = 0;
            record.window_start = now;
        }

        record.failures += 1;
        if record.failures >= limits.max_failures {
            record.locked_until = Some(now + limits.lockout);
            tracing::warn!(
                user,
                failures = record.failures,
                lockout_secs = limits.lockout.as_secs(),
                "rate limit triggered, locking user"
            );
        } else {
            tracing::debug!(
                user,
                failures = record.failures,
                max = limits.max_failures,
                "no match, incrementing failure counter"
            );
        }
    }

    /// Record a matching verification and clear the failure counter.
    pub fn record_success(&mut self, user: &str) {
        self.records.remove(user);
    }

    /// Number of users currently locked out.
    pub fn locked_count(&self, now: Instant) -> usize {
        self.records
            .values()
            .filter(|r| r.locked_until.is_some_and(|t| now < t))
            .count()
    }
}
