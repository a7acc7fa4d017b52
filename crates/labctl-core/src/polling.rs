//! Per-device adaptive polling cadence.
//!
//! Each device owns exactly one [`PollingState`]. Only the scheduler mutates
//! it, once per poll outcome:
//!
//! - success resets the interval to the floor immediately;
//! - failure doubles the interval, clamped to the ceiling;
//! - a failure is *declared* only when it has persisted, measured from the
//!   first failure since the last success, for longer than the interval that
//!   was in force for the failed poll. A single glitch is never declared.

use crate::error::ErrorClass;
use std::time::Duration;
use tokio::time::Instant;

/// Floor and ceiling of the adaptive interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffBounds {
    /// Interval used while the device is healthy.
    pub min_interval: Duration,
    /// Ceiling the interval never exceeds.
    pub max_interval: Duration,
}

impl Default for BackoffBounds {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(5000),
        }
    }
}

/// Result of recording a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Interval to wait before the next poll.
    pub next_interval: Duration,
    /// Whether the failure has persisted long enough to surface to consumers.
    pub declared: bool,
}

/// Adaptive polling state of one device.
#[derive(Debug, Clone)]
pub struct PollingState {
    current_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    consecutive_error_count: u32,
    last_error_time: Option<Instant>,
    last_error_class: Option<ErrorClass>,
    last_success_time: Instant,
    first_failure_time: Option<Instant>,
}

impl PollingState {
    /// Start at the floor, treating `now` as the last success.
    pub fn new(bounds: BackoffBounds, now: Instant) -> Self {
        let min_interval = bounds.min_interval.min(bounds.max_interval);
        Self {
            current_interval: min_interval,
            min_interval,
            max_interval: bounds.max_interval,
            consecutive_error_count: 0,
            last_error_time: None,
            last_error_class: None,
            last_success_time: now,
            first_failure_time: None,
        }
    }

    /// Interval to wait before the next poll.
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Floor of the adaptive interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Ceiling of the adaptive interval.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Failed polls since the last success.
    pub fn consecutive_error_count(&self) -> u32 {
        self.consecutive_error_count
    }

    /// When the most recent failure happened.
    pub fn last_error_time(&self) -> Option<Instant> {
        self.last_error_time
    }

    /// Class of the most recent failure.
    pub fn last_error_class(&self) -> Option<ErrorClass> {
        self.last_error_class
    }

    /// When the most recent success happened.
    pub fn last_success_time(&self) -> Instant {
        self.last_success_time
    }

    /// First failure since the last success, while failing.
    pub fn first_failure_time(&self) -> Option<Instant> {
        self.first_failure_time
    }

    /// Record a successful poll and reset to the floor.
    pub fn record_success(&mut self, now: Instant) -> Duration {
        self.current_interval = self.min_interval;
        self.consecutive_error_count = 0;
        self.last_error_class = None;
        self.last_success_time = now;
        self.first_failure_time = None;
        self.current_interval
    }

    /// Record a failed poll, grow the interval and report whether the failure
    /// is now declared.
    pub fn record_failure(&mut self, now: Instant, class: ErrorClass) -> FailureOutcome {
        let first_failure = *self.first_failure_time.get_or_insert(now);
        let declared = now.saturating_duration_since(first_failure) > self.current_interval;

        self.consecutive_error_count = self.consecutive_error_count.saturating_add(1);
        self.last_error_time = Some(now);
        self.last_error_class = Some(class);
        self.current_interval = self
            .current_interval
            .saturating_mul(2)
            .clamp(self.min_interval, self.max_interval);

        FailureOutcome {
            next_interval: self.current_interval,
            declared,
        }
    }
}
