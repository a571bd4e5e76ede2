//! Per-slot restart policy.

use std::time::Duration;

/// Restart throttling settings
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// First delay after a crash
    pub base: Duration,

    /// Delay ceiling
    pub max: Duration,

    /// Crashes tolerated before the slot is abandoned
    pub max_restarts: u32,

    /// A run at least this long counts as stable and resets the counters
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_restarts: 10,
            stable_after: Duration::from_secs(2),
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Clean exit after reaching its request limit
    Retired,
    /// Any other exit
    Crashed,
}

/// What the supervisor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RespawnNow,
    RespawnAfter(Duration),
    GiveUp,
}

/// Backoff state of one slot.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RestartPolicy,
    restart_count: u32,
    backoff: Duration,
}

impl Backoff {
    pub fn new(policy: RestartPolicy) -> Self {
        let backoff = policy.base;
        Self {
            policy,
            restart_count: 0,
            backoff,
        }
    }

    /// Crash restarts since the last stable run.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Delay that the next crash will wait.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Record an exit after `ran_for` and decide the next step.
    pub fn on_exit(&mut self, kind: ExitKind, ran_for: Duration) -> RestartDecision {
        if ran_for >= self.policy.stable_after {
            self.reset();
        }

        match kind {
            ExitKind::Retired => RestartDecision::RespawnNow,
            ExitKind::Crashed => {
                self.restart_count += 1;
                if self.restart_count > self.policy.max_restarts {
                    return RestartDecision::GiveUp;
                }
                let delay = self.backoff;
                self.backoff = (self.backoff * 2).min(self.policy.max);
                RestartDecision::RespawnAfter(delay)
            }
        }
    }

    fn reset(&mut self) {
        self.restart_count = 0;
        self.backoff = self.policy.base;
    }
}
