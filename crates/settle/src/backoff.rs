//! Poll pacing and time budgets.

use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Pacing for retry and wait loops.
///
/// The default schedule runs the first attempt immediately, then waits
/// 500ms before the second and doubles from there, capped at 10s:
/// 500ms, 1s, 2s, 4s, 8s, 10s, 10s, ... Setting a poll interval replaces
/// the curve with a fixed wait, and a delay postpones the first attempt.
///
/// When the floor is raised above the cap, the floor wins.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    delay: Duration,
    min_interval: Duration,
    max_interval: Duration,
    poll_interval: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            delay: Duration::ZERO,
            min_interval: DEFAULT_MIN_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            poll_interval: None,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Postpones the first attempt.
    ///
    /// Useful when the platform is known to never finish an operation
    /// faster than some floor, e.g. a database restore that always takes
    /// at least a minute.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the smallest wait between attempts, which is also where the
    /// growth curve starts.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Sets the largest wait the growth curve may reach.
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Replaces the growth curve with a fixed wait between attempts.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// The wait before attempt `tick`, counted from zero.
    pub(crate) fn wait_before(&self, tick: u32) -> Duration {
        if tick == 0 {
            return self.delay;
        }
        if let Some(interval) = self.poll_interval {
            return interval;
        }
        let doublings = (tick - 1).min(16);
        let grown = self.min_interval.saturating_mul(1u32 << doublings);
        grown.min(self.max_interval).max(self.min_interval)
    }

    /// The wait while re-checking an observation that must hold for several
    /// consecutive ticks.
    pub(crate) fn confirm_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(self.min_interval)
    }
}

/// One time budget shared by several waits.
///
/// An operation that performs dependent waits in sequence, e.g. modify a
/// database then wait out both the parameter apply and the final reboot,
/// hands each successive wait whatever is left of the overall budget.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Deadline {
            end: Instant::now() + budget,
        }
    }

    /// Time left in the budget, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_schedule_doubles_to_the_cap() {
        let pace = Backoff::default();
        let waits: Vec<Duration> = (0..8).map(|tick| pace.wait_before(tick)).collect();
        assert_eq!(
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ],
            waits,
            "second attempt starts at the floor, growth caps at 10s"
        );
    }

    #[test]
    fn poll_interval_replaces_the_curve() {
        let pace = Backoff::default()
            .with_delay(Duration::from_secs(60))
            .with_poll_interval(Duration::from_secs(3));
        assert_eq!(Duration::from_secs(60), pace.wait_before(0));
        for tick in 1..10 {
            assert_eq!(Duration::from_secs(3), pace.wait_before(tick));
        }
        assert_eq!(Duration::from_secs(3), pace.confirm_interval());
    }

    #[test]
    fn floor_above_cap_wins() {
        let pace = Backoff::default().with_min_interval(Duration::from_secs(20));
        assert_eq!(Duration::from_secs(20), pace.wait_before(1));
        assert_eq!(Duration::from_secs(20), pace.wait_before(5));
    }

    #[test]
    fn huge_tick_does_not_overflow() {
        let pace = Backoff::default();
        assert_eq!(Duration::from_secs(10), pace.wait_before(u32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_remaining_counts_down() {
        let deadline = Deadline::new(Duration::from_secs(10));
        assert_eq!(Duration::from_secs(10), deadline.remaining());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(Duration::from_secs(7), deadline.remaining());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(Duration::ZERO, deadline.remaining(), "saturates at zero");
    }
}
