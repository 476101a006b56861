use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Failures within [`WINDOW`] that trigger a lockout.
const MAX_FAILURES: u32 = 5;
/// Sliding window over which failures are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration after reaching MAX_FAILURES.
const LOCKOUT: Duration = Duration::from_secs(300);
/// Upper bound on tracked usernames. Usernames come straight from the
/// request, so unknown names are tracked too.
const MAX_TRACKED: usize = 10_000;

struct Record {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl Record {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }

    /// When this record stops affecting `check`.
    fn expires_at(&self) -> Instant {
        self.locked_until.unwrap_or(self.window_start + WINDOW)
    }
}

/// Per-username limiter for password logins.
///
/// Only credential mismatches count. Attempts rejected because no face was
/// detected never reach the password check and are not counted.
pub struct RateLimiter {
    records: HashMap<String, Record>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// `Err(remaining)` while `username` is locked out.
    pub fn check(&mut self, username: &str) -> Result<(), Duration> {
        self.check_at(username, Instant::now())
    }

    fn check_at(&mut self, username: &str, now: Instant) -> Result<(), Duration> {
        let Some(record) = self.records.get_mut(username) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(locked_until - now);
            }
            *record = Record::fresh(now);
        } else if now.duration_since(record.window_start) >= WINDOW {
            *record = Record::fresh(now);
        }
        Ok(())
    }

    /// Count a failed login. May start a lockout.
    pub fn record_failure(&mut self, username: &str) {
        self.record_failure_at(username, Instant::now());
    }

    fn record_failure_at(&mut self, username: &str, now: Instant) {
        if !self.records.contains_key(username) && self.records.len() >= MAX_TRACKED {
            self.make_room(now);
        }
        let record = self
            .records
            .entry(username.to_string())
            .or_insert_with(|| Record::fresh(now));

        if now.duration_since(record.window_start) >= WINDOW {
            *record = Record::fresh(now);
        }

        record.failures += 1;
        if record.failures >= MAX_FAILURES {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                username,
                failures = record.failures,
                lockout_secs = LOCKOUT.as_secs(),
                "login rate limit triggered"
            );
        } else {
            tracing::debug!(
                username,
                failures = record.failures,
                max = MAX_FAILURES,
                "login failed"
            );
        }
    }

    /// A successful login clears the counter.
    pub fn record_success(&mut self, username: &str) {
        self.records.remove(username);
    }

    /// Drop expired records; if the table is still full, evict the record
    /// closest to expiry.
    fn make_room(&mut self, now: Instant) {
        self.records.retain(|_, r| r.expires_at() > now);
        if self.records.len() < MAX_TRACKED {
            return;
        }
        let oldest = self
            .records
            .iter()
            .min_by_key(|(_, r)| r.expires_at())
            .map(|(name, _)| name.clone());
        if let Some(name) = oldest {
            tracing::debug!(username = %name, "evicting login failure record");
            self.records.remove(&name);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_under_limit() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_FAILURES - 1 {
            assert!(rl.check("alice").is_ok());
            rl.record_failure("alice");
        }
        assert!(rl.check("alice").is_ok());
    }

    #[test]
    fn test_locks_after_max_failures() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_FAILURES {
            rl.record_failure("alice");
        }
        let remaining = rl.check("alice").unwrap_err();
        assert!(remaining > Duration::from_secs(290));
        assert!(remaining <= LOCKOUT);
    }

    #[test]
    fn test_success_clears_counter() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_FAILURES - 1 {
            rl.record_failure("alice");
        }
        rl.record_success("alice");
        rl.record_failure("alice");
        assert!(rl.check("alice").is_ok());
    }

    #[test]
    fn test_independent_per_user() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_FAILURES {
            rl.record_failure("alice");
        }
        assert!(rl.check("bob").is_ok());
        assert!(rl.check("alice").is_err());
    }

    #[test]
    fn test_unknown_usernames_do_not_grow_unbounded() {
        let mut rl = RateLimiter::new();
        let start = Instant::now();
        for i in 0..MAX_TRACKED + 500 {
            rl.record_failure_at(&format!("ghost{i}"), start);
        }
        assert_eq!(rl.records.len(), MAX_TRACKED);

        // Once the window has passed, stale records are swept on the next insert.
        rl.record_failure_at("late", start + WINDOW);
        assert_eq!(rl.records.len(), 1);
    }

    #[test]
    fn test_eviction_keeps_active_lockouts() {
        let mut rl = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..MAX_FAILURES {
            rl.record_failure_at("alice", start);
        }
        for i in 0..MAX_TRACKED {
            rl.record_failure_at(&format!("ghost{i}"), start + Duration::from_secs(1));
        }
        assert_eq!(rl.records.len(), MAX_TRACKED);
        assert!(rl.check_at("alice", start + WINDOW).is_err());
    }
}
