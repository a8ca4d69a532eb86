//! Fixed-interval polling with an overall deadline.
//!
//! ```text
//!            ┌── Continue (sleep interval, deadline not passed) ──┐
//!            ▼                                                    │
//!        Running ──── check() ───────────────────────────────────┘
//!            │
//!            ├── Success ─────────────────────────► Succeeded
//!            ├── Failure(reason) ─────────────────► Failed(reason)
//!            └── TimedOut / deadline passed ──────► TimedOut
//! ```
//!
//! Ticks are strictly sequential. An `Err` from the check aborts polling and
//! is returned as-is.

use std::thread;
use std::time::{Duration, Instant};

use crate::config::RunOptions;
use crate::error::{FeedSyncError, Result};

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Success,
    Failure(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Running,
    Succeeded,
    Failed(String),
    TimedOut,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Running)
    }

    /// Convert a terminal state into the stage result.
    pub fn into_result(self, stage: &str, deadline: Duration) -> Result<()> {
        match self {
            PollState::Succeeded => Ok(()),
            PollState::Failed(reason) => Err(FeedSyncError::StageFailed {
                stage: stage.to_string(),
                reason,
            }),
            PollState::TimedOut | PollState::Running => Err(FeedSyncError::TimedOut {
                stage: stage.to_string(),
                after: deadline,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    interval: Duration,
    deadline: Duration,
}

impl Poller {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    pub fn from_options(options: &RunOptions) -> Self {
        Self::new(options.interval, options.timeout)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Tick `check` until it reports a terminal outcome or the deadline
    /// passes. The deadline is only evaluated after sleeping, so `check`
    /// always runs at least once.
    pub fn run<F>(&self, mut check: F) -> Result<PollState>
    where
        F: FnMut() -> Result<PollOutcome>,
    {
        let start = Instant::now();
        let mut state = PollState::Running;
        let mut tick: u32 = 0;

        while !state.is_terminal() {
            tick += 1;
            state = match check()? {
                PollOutcome::Success => PollState::Succeeded,
                PollOutcome::Failure(reason) => PollState::Failed(reason),
                PollOutcome::TimedOut => PollState::TimedOut,
                PollOutcome::Continue => {
                    thread::sleep(self.interval);
                    if start.elapsed() > self.deadline {
                        PollState::TimedOut
                    } else {
                        PollState::Running
                    }
                }
            };
            tracing::debug!(tick, state = ?state, "poll tick");
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(30);

    #[test]
    fn always_continue_times_out_after_three_ticks() {
        let poller = Poller::new(INTERVAL, INTERVAL * 3);
        let mut ticks = 0;
        let state = poller
            .run(|| {
                ticks += 1;
                Ok(PollOutcome::Continue)
            })
            .unwrap();
        assert_eq!(state, PollState::TimedOut);
        assert!((3..=4).contains(&ticks), "ticks = {ticks}");
    }

    #[test]
    fn stops_on_first_success() {
        let poller = Poller::new(INTERVAL, Duration::from_secs(10));
        let mut ticks = 0;
        let state = poller
            .run(|| {
                ticks += 1;
                Ok(if ticks == 2 {
                    PollOutcome::Success
                } else {
                    PollOutcome::Continue
                })
            })
            .unwrap();
        assert_eq!(state, PollState::Succeeded);
        assert_eq!(ticks, 2);
    }

    #[test]
    fn stops_on_first_failure() {
        let poller = Poller::new(INTERVAL, Duration::from_secs(10));
        let mut ticks = 0;
        let state = poller
            .run(|| {
                ticks += 1;
                Ok(PollOutcome::Failure("trigger exited with code 1".into()))
            })
            .unwrap();
        assert_eq!(state, PollState::Failed("trigger exited with code 1".into()));
        assert_eq!(ticks, 1);
    }

    #[test]
    fn check_may_report_timeout_itself() {
        let poller = Poller::new(INTERVAL, Duration::from_secs(10));
        let state = poller.run(|| Ok(PollOutcome::TimedOut)).unwrap();
        assert_eq!(state, PollState::TimedOut);
    }

    #[test]
    fn check_error_is_propagated() {
        let poller = Poller::new(INTERVAL, Duration::from_secs(10));
        let mut ticks = 0;
        let err = poller
            .run(|| {
                ticks += 1;
                Err(FeedSyncError::MalformedTimestamp("not-a-date".into()))
            })
            .unwrap_err();
        assert!(matches!(err, FeedSyncError::MalformedTimestamp(_)));
        assert_eq!(ticks, 1);
    }

    #[test]
    fn success_on_first_tick_does_not_sleep() {
        let poller = Poller::new(Duration::from_secs(30), Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(
            poller.run(|| Ok(PollOutcome::Success)).unwrap(),
            PollState::Succeeded
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn into_result_maps_terminal_states() {
        let deadline = Duration::from_secs(90);
        assert!(PollState::Succeeded.into_result("sync", deadline).is_ok());

        let err = PollState::Failed("boom".into())
            .into_result("sync", deadline)
            .unwrap_err();
        assert_eq!(err.to_string(), "sync failed: boom");

        let err = PollState::TimedOut.into_result("sync", deadline).unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for sync after 90 seconds");
    }
}
