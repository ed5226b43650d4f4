use std::time::Duration;

/// Restart delay policy for crashed workers: exponential between `initial`
/// and `max`, back to `initial` once a worker stayed up for `reset_after`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestartBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub reset_after: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            reset_after: Duration::from_secs(60),
        }
    }
}

impl RestartBackoff {
    pub fn slot(&self) -> SlotBackoff {
        SlotBackoff {
            policy: *self,
            next: self.initial,
        }
    }
}

/// Backoff state of one cluster slot.
#[derive(Clone, Debug)]
pub struct SlotBackoff {
    policy: RestartBackoff,
    next: Duration,
}

impl SlotBackoff {
    /// Delay before restarting a worker that ran for `uptime`.
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.policy.reset_after {
            self.next = self.policy.initial;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(self.policy.max);
        delay
    }
}
