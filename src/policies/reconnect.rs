//! Reconnection backoff policies.
//!
//! When a host goes down the session schedules reconnection attempts on
//! a per-host schedule produced by one of these policies. Ordinary downs
//! and critical failures are configured with independent policies so the
//! accelerated schedule for critical failures is preserved rather than
//! collapsed into one knob.

use std::fmt;
use std::time::Duration;

/// A live backoff schedule for a single down host.
pub trait ReconnectSchedule: Send {
    /// Delay to wait before the next reconnection attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Produces a fresh [`ReconnectSchedule`] each time a host goes down.
pub trait ReconnectPolicy: Send + Sync + fmt::Debug {
    /// Starts a fresh backoff schedule for one host.
    fn new_schedule(&self) -> Box<dyn ReconnectSchedule>;
}

/// Waits a constant delay between reconnection attempts.
#[derive(Debug, Clone)]
pub struct FixedReconnectPolicy {
    delay: Duration,
}

impl FixedReconnectPolicy {
    /// Creates a policy with the given constant delay.
    pub fn new(delay: Duration) -> Self {
        FixedReconnectPolicy { delay }
    }
}

impl Default for FixedReconnectPolicy {
    fn default() -> Self {
        // Matches the classic driver default reconnect wait time.
        Self::new(Duration::from_millis(2000))
    }
}

impl ReconnectPolicy for FixedReconnectPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectSchedule> {
        Box::new(FixedSchedule { delay: self.delay })
    }
}

struct FixedSchedule {
    delay: Duration,
}

impl ReconnectSchedule for FixedSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay after every failed attempt, saturating at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectPolicy {
    base: Duration,
    max: Duration,
}

impl ExponentialReconnectPolicy {
    /// Creates a policy starting at `base` and never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        ExponentialReconnectPolicy { base, max }
    }
}

impl Default for ExponentialReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl ReconnectPolicy for ExponentialReconnectPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectSchedule> {
        Box::new(ExponentialSchedule {
            next: self.base,
            max: self.max,
        })
    }
}

struct ExponentialSchedule {
    next: Duration,
    max: Duration,
}

impl ReconnectSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(self.max, self.next * 2);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_schedule_is_constant() {
        let policy = FixedReconnectPolicy::new(Duration::from_millis(250));
        let mut schedule = policy.new_schedule();
        for _ in 0..5 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn exponential_schedule_doubles_and_saturates() {
        let policy =
            ExponentialReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        let mut schedule = policy.new_schedule();
        assert_eq!(schedule.next_delay(), Duration::from_millis(100));
        assert_eq!(schedule.next_delay(), Duration::from_millis(200));
        assert_eq!(schedule.next_delay(), Duration::from_millis(400));
        assert_eq!(schedule.next_delay(), Duration::from_millis(500));
        assert_eq!(schedule.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn schedules_are_independent_per_host() {
        let policy = ExponentialReconnectPolicy::default();
        let mut first = policy.new_schedule();
        let mut second = policy.new_schedule();
        first.next_delay();
        first.next_delay();
        assert_eq!(second.next_delay(), first.next_delay() / 4);
    }
}
