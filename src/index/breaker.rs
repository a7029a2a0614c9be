//! Connection breaker for the search index client.
//!
//! ```text
//!   Enabled+Unverified ──(probe ok)──────────────> Enabled+Verified
//!   Enabled+Verified ──(connectivity error)──────> Disabled(cooldown)
//!   Disabled(cooldown) ──(cooldown elapsed, auto
//!       reconnect, initially enabled)────────────> Enabled+Unverified
//! ```
//!
//! The cooldown is evaluated lazily against the `now` passed in, so there is
//! no timer task to own or cancel. A breaker built disabled never re-enables.
//! In forced mode a connectivity error only clears the verified flag.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Admission decision for one index call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Connection already verified
    Verified,
    /// Disabled or cooling down; short-circuit to the empty result
    Rejected,
    /// Enabled but not verified; a health probe must run first
    NeedsProbe,
}

/// Snapshot of the breaker for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub enabled: bool,
    pub connection_checked: bool,
    pub forced: bool,
    pub retry_delay_ms: u64,
    /// Milliseconds until the next reconnect attempt, when one is scheduled
    pub reconnect_in_ms: Option<u64>,
    pub trips: u64,
}

#[derive(Debug)]
struct State {
    enabled: bool,
    connection_checked: bool,
    reconnect_at: Option<Instant>,
    trips: u64,
}

#[derive(Debug)]
pub struct Breaker {
    initially_enabled: bool,
    forced: bool,
    auto_reconnect: bool,
    retry_delay: Duration,
    state: Mutex<State>,
}

impl Breaker {
    pub fn new(enabled: bool, forced: bool, auto_reconnect: bool, retry_delay: Duration) -> Self {
        let enabled = enabled || forced;
        Self {
            initially_enabled: enabled,
            forced,
            auto_reconnect,
            retry_delay,
            state: Mutex::new(State {
                enabled,
                connection_checked: false,
                reconnect_at: None,
                trips: 0,
            }),
        }
    }

    pub fn initially_enabled(&self) -> bool {
        self.initially_enabled
    }

    fn settle(&self, state: &mut State, now: Instant) {
        if let Some(at) = state.reconnect_at {
            if now >= at {
                state.reconnect_at = None;
                state.enabled = true;
                state.connection_checked = false;
                info!("Search index cooldown elapsed, re-enabling client");
            }
        }
    }

    pub fn admit(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();
        self.settle(&mut state, now);

        if !state.enabled {
            Admission::Rejected
        } else if state.connection_checked {
            Admission::Verified
        } else {
            Admission::NeedsProbe
        }
    }

    /// Whether calls are currently allowed at all (verified or not)
    pub fn is_enabled(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.settle(&mut state, now);
        state.enabled
    }

    /// Record the outcome of a health probe
    pub fn record_probe(&self, ok: bool, now: Instant) {
        if ok {
            let mut state = self.state.lock();
            if state.enabled {
                state.connection_checked = true;
            }
        } else {
            self.trip("health check failed", now);
        }
    }

    /// Record a connectivity failure
    pub fn trip(&self, reason: &str, now: Instant) {
        let mut state = self.state.lock();
        state.connection_checked = false;

        if self.forced {
            warn!(reason, "Search index unreachable (forced mode, will re-probe)");
            return;
        }

        if !state.enabled {
            return;
        }

        state.enabled = false;
        state.trips += 1;

        if self.initially_enabled && self.auto_reconnect {
            state.reconnect_at = Some(now + self.retry_delay);
            warn!(
                reason,
                retry_in_ms = self.retry_delay.as_millis() as u64,
                "Search index unreachable, disabling client"
            );
        } else {
            state.reconnect_at = None;
            warn!(reason, "Search index unreachable, client disabled until restart");
        }
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionState {
        let mut state = self.state.lock();
        self.settle(&mut state, now);
        ConnectionState {
            enabled: state.enabled,
            connection_checked: state.connection_checked,
            forced: self.forced,
            retry_delay_ms: self.retry_delay.as_millis() as u64,
            reconnect_in_ms: state
                .reconnect_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            trips: state.trips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(15);

    #[test]
    fn test_probe_then_verified() {
        let breaker = Breaker::new(true, false, true, DELAY);
        let now = Instant::now();
        assert_eq!(breaker.admit(now), Admission::NeedsProbe);
        breaker.record_probe(true, now);
        assert_eq!(breaker.admit(now), Admission::Verified);
    }

    #[test]
    fn test_cooldown_then_reprobe() {
        let breaker = Breaker::new(true, false, true, DELAY);
        let start = Instant::now();
        breaker.record_probe(true, start);
        breaker.trip("connection refused", start);

        assert_eq!(breaker.admit(start), Admission::Rejected);
        assert_eq!(breaker.admit(start + DELAY - Duration::from_millis(1)), Admission::Rejected);

        let after = start + DELAY;
        assert_eq!(breaker.admit(after), Admission::NeedsProbe);
        breaker.record_probe(true, after);
        assert_eq!(breaker.admit(after), Admission::Verified);
        assert_eq!(breaker.snapshot(after).trips, 1);
    }

    #[test]
    fn test_failed_reprobe_restarts_cooldown() {
        let breaker = Breaker::new(true, false, true, DELAY);
        let start = Instant::now();
        breaker.trip("timeout", start);

        let after = start + DELAY;
        assert_eq!(breaker.admit(after), Admission::NeedsProbe);
        breaker.record_probe(false, after);
        assert_eq!(breaker.admit(after + DELAY / 2), Admission::Rejected);
        assert_eq!(breaker.admit(after + DELAY), Admission::NeedsProbe);
    }

    #[test]
    fn test_never_enabled_stays_disabled() {
        let breaker = Breaker::new(false, false, true, DELAY);
        let start = Instant::now();
        assert_eq!(breaker.admit(start), Admission::Rejected);
        breaker.trip("refused", start);
        assert_eq!(breaker.admit(start + DELAY * 10), Admission::Rejected);
        assert!(breaker.snapshot(start).reconnect_in_ms.is_none());
    }

    #[test]
    fn test_reconnect_opt_out() {
        let breaker = Breaker::new(true, false, false, DELAY);
        let start = Instant::now();
        breaker.trip("refused", start);
        assert_eq!(breaker.admit(start + DELAY * 10), Admission::Rejected);
    }

    #[test]
    fn test_forced_mode_never_disables() {
        let breaker = Breaker::new(false, true, false, DELAY);
        let start = Instant::now();
        breaker.record_probe(true, start);
        breaker.trip("refused", start);
        assert_eq!(breaker.admit(start), Admission::NeedsProbe);
        assert!(breaker.is_enabled(start));
    }
}
