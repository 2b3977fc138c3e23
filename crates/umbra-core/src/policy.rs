//! Pure state machines for keepalive and reconnection.
//!
//! No timers and no clocks in here: callers own the schedule (a timer thread
//! ticks the keepalive, the lifecycle thread sleeps the backoff) and these
//! types own only the arithmetic, which keeps the bounds testable without
//! any waiting.

use std::time::Duration;

use crate::config::{KeepaliveConfig, ReconnectConfig};

/// What the lifecycle manager must do on a keepalive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Send a PING and count it as unanswered.
    SendPing,
    /// Too many unanswered pings; tear down and reconnect.
    Reconnect,
}

/// Missed-pong counter.
#[derive(Debug)]
pub struct KeepalivePolicy {
    missed: u32,
    max_missed: u32,
}

impl KeepalivePolicy {
    /// Policy with the configured missed-pong tolerance.
    #[must_use]
    pub fn new(config: &KeepaliveConfig) -> Self {
        Self {
            missed: 0,
            max_missed: config.max_missed,
        }
    }

    /// The timer fired: decide between probing and reconnecting.
    pub fn on_tick(&mut self) -> KeepaliveAction {
        if self.missed >= self.max_missed {
            KeepaliveAction::Reconnect
        } else {
            self.missed += 1;
            KeepaliveAction::SendPing
        }
    }

    /// A PONG arrived; the link is alive.
    pub fn on_pong(&mut self) {
        self.missed = 0;
    }

    /// Unanswered pings so far.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }
}

/// Bounded linear-backoff reconnect counter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    backoff_base: Duration,
}

impl ReconnectPolicy {
    /// Policy with the configured attempt budget and backoff base.
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base,
        }
    }

    /// Claim the next attempt.
    ///
    /// Returns the wait before that attempt (`(n) * base` for the n-th,
    /// 1-based), or `None` when the budget is spent and the client must stop
    /// permanently.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.backoff_base * self.attempt)
    }

    /// A connection succeeded; the budget refills.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts claimed since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
