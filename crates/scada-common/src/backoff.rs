//! ---
//! scada_section: "01-core-functionality"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Shared primitives for the SCADA master and RTU runtimes."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with full jitter.
///
/// Used by the node dialler and the historian writer: the nominal delay
/// doubles per failed attempt up to `cap`, and every pick is drawn uniformly
/// from `[0, nominal]` so a fleet of reconnecting supervisors does not
/// synchronise.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `cap`.
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            attempt: 0,
        }
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return the jittered delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let nominal = self
            .initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap);
        let nominal_ms = nominal.as_millis() as u64;
        if nominal_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=nominal_ms))
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
