//! Per-email failed-login tracking with temporary lockout.
//!
//! State is in memory only and is lost on restart.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

pub const MAX_FAILED_ATTEMPTS: usize = 5;
pub const LOCKOUT_WINDOW_MINUTES: i64 = 15;
const MAX_TRACKED: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutStatus {
    Unlocked,
    Locked { until: DateTime<Utc> },
}

impl LockoutStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockoutStatus::Locked { .. })
    }

    /// Time left on the lockout, zero when unlocked.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self {
            LockoutStatus::Locked { until } if *until > now => *until - now,
            _ => Duration::zero(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct LockoutState {
    failures: Vec<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

pub struct AccountGuard {
    max_attempts: usize,
    window: Duration,
    entries: Mutex<HashMap<String, LockoutState>>,
}

impl Default for AccountGuard {
    fn default() -> Self {
        Self::new(MAX_FAILED_ATTEMPTS, Duration::minutes(LOCKOUT_WINDOW_MINUTES))
    }
}

impl AccountGuard {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_lockout(&self, email: &str) -> LockoutStatus {
        self.check_lockout_at(email, Utc::now())
    }

    pub fn check_lockout_at(&self, email: &str, now: DateTime<Utc>) -> LockoutStatus {
        let key = normalize(email);
        let mut entries = self.entries.lock();
        let Some(state) = entries.get_mut(&key) else {
            return LockoutStatus::Unlocked;
        };

        let horizon = now - self.window;
        state.failures.retain(|t| *t > horizon);
        if let Some(until) = state.locked_until {
            if until > now {
                return LockoutStatus::Locked { until };
            }
            state.locked_until = None;
        }

        if state.failures.len() >= self.max_attempts {
            let until = now + self.window;
            state.locked_until = Some(until);
            warn!(email = %key, attempts = state.failures.len(), %until, "account locked");
            return LockoutStatus::Locked { until };
        }

        if state.failures.is_empty() {
            entries.remove(&key);
        }
        LockoutStatus::Unlocked
    }

    pub fn record_failure(&self, email: &str) {
        self.record_failure_at(email, Utc::now())
    }

    pub fn record_failure_at(&self, email: &str, now: DateTime<Utc>) {
        let key = normalize(email);
        let mut entries = self.entries.lock();
        let state = entries.entry(key.clone()).or_default();
        state.failures.push(now);
        state.last_seen = Some(now);
        info!(email = %key, attempts = state.failures.len(), "failed login recorded");
        evict_if_full(&mut entries, now, self.window, self.max_attempts);
    }

    pub fn record_success(&self, email: &str) {
        let key = normalize(email);
        if self.entries.lock().remove(&key).is_some() {
            info!(email = %key, "failed login history cleared");
        }
    }

    pub fn failure_count(&self, email: &str) -> usize {
        self.entries
            .lock()
            .get(&normalize(email))
            .map(|state| state.failures.len())
            .unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

pub(crate) fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Drop stale entries, then the least recently seen ones. Locked accounts,
/// and accounts with enough recent failures to lock, are never evicted, so
/// the map may stay above the bound while they last.
fn evict_if_full(
    entries: &mut HashMap<String, LockoutState>,
    now: DateTime<Utc>,
    window: Duration,
    max_attempts: usize,
) {
    if entries.len() <= MAX_TRACKED {
        return;
    }
    let horizon = now - window;
    let recent = |state: &LockoutState| state.failures.iter().filter(|t| **t > horizon).count();
    let locked = |state: &LockoutState| {
        state.locked_until.map_or(false, |until| until > now) || recent(state) >= max_attempts
    };
    entries.retain(|_, state| locked(&*state) || recent(&*state) > 0);
    if entries.len() <= MAX_TRACKED {
        return;
    }
    let mut by_age: Vec<(String, Option<DateTime<Utc>>)> = entries
        .iter()
        .filter(|(_, state)| !locked(*state))
        .map(|(key, state)| (key.clone(), state.last_seen))
        .collect();
    by_age.sort_by_key(|(_, last_seen)| *last_seen);
    let excess = entries.len() - MAX_TRACKED;
    for (key, _) in by_age.into_iter().take(excess) {
        entries.remove(&key);
    }
}
