//! Reconnect pacing for consumers that drive [`crate::GameClient::reconnect`].
//!
//! The session only reports that the link went offline and counts lost
//! cycles; when and how often to dial again is up to the consumer.
//! [`ReconnectState`] hands out exponentially increasing delays with jitter,
//! starting at the two second cadence the game server expects.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::session::SessionConfig;

/// Configuration for client-side reconnection pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first redial. Default: 2 s.
    pub initial_delay: Duration,
    /// Growth factor per lost cycle. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Longest wait between redials. Default: 30 s.
    pub max_delay: Duration,
    /// Redials handed out before giving up. Default: `None`; see
    /// [`bounded_by`](Self::bounded_by).
    pub max_attempts: Option<u32>,
    /// Spread applied as ±jitter to each delay (0.0 to 1.0). Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    /// Cap redials one past the session's own budget, so the session's
    /// `Fatal` event always arrives before the consumer runs dry.
    pub fn bounded_by(self, session: &SessionConfig) -> Self {
        Self {
            max_attempts: Some(session.max_reconnect_attempts.saturating_add(1)),
            ..self
        }
    }

    /// Un-jittered delay before redial number `attempt` (zero based).
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.max(0.0).min(self.max_delay.as_secs_f64()))
    }
}

/// Counts redials since the link was last healthy and paces the next one.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next redial, counting it as handed out.
    /// `None` once `max_attempts` redials have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        let base = self.config.base_delay(self.attempts);
        self.attempts += 1;

        if self.config.jitter <= 0.0 {
            return Some(base);
        }
        let spread = self.config.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        Some(base.mul_f64(factor).min(self.config.max_delay))
    }

    /// [`next_delay`](Self::next_delay) as a deadline from `now`.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        self.next_delay().map(|delay| now + delay)
    }

    /// Traffic arrived again; the next loss starts from the initial delay.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Redials handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
