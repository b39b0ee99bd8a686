//! Reconnection controller for the spectator subscription.
//!
//! ```text
//!          failure                 failure (attempts ≤ max)
//!  Idle ─────────────► Reconnecting ◄────────┐
//!   ▲                    │   │               │
//!   │    snapshot        │   └───────────────┘
//!   └────────────────────┘
//!                        │ failure (attempts > max)
//!                        ▼
//!                      Failed   (terminal, nothing scheduled)
//! ```
//!
//! The controller only decides; the subscription task owns the timer, so
//! cancelling the task cancels any pending retry.

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Reconnecting,
    Failed,
}

/// What the caller should do after reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Report `attempt` and resubscribe after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted. Report the error once and stop.
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    config: ReconnectConfig,
    state: ReconnectState,
    attempts: u32,
    delay: Duration,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            state: ReconnectState::Idle,
            attempts: 0,
            delay,
        }
    }

    /// Record a transport failure and decide the next step.
    ///
    /// `delay = min(initial × multiplier^attempts, max_delay)`, computed from
    /// the base delay each time so growth is exponential in the attempt count
    /// and never decreases within one reconnect cycle.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.state == ReconnectState::Failed {
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        if self.attempts >= self.config.max_attempts {
            self.state = ReconnectState::Failed;
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        self.state = ReconnectState::Reconnecting;
        self.attempts += 1;

        let factor = self.config.multiplier.powi(self.attempts as i32);
        let scaled = self.config.initial_delay.as_secs_f64() * factor;
        self.delay = Duration::from_secs_f64(scaled.min(self.config.max_delay.as_secs_f64()));

        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.delay,
        }
    }

    /// A snapshot arrived: back to a clean slate.
    pub fn on_success(&mut self) {
        if self.state != ReconnectState::Failed {
            self.state = ReconnectState::Idle;
        }
        self.attempts = 0;
        self.delay = self.config.initial_delay;
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay chosen by the most recent failure (or the base delay).
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn is_failed(&self) -> bool {
        self.state == ReconnectState::Failed
    }
}
