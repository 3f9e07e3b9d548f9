//! Timestamps at which `onSchedule` should run.

use crate::error::{AppResult, StationError};
use chrono::{DateTime, Local};
use std::time::Duration;

/// Interval used when a range is requested with a zero step
pub const DEFAULT_RANGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Most times one range request may add
pub const MAX_RANGE_TIMES: usize = 10_000;

/// Sorted list of fire times
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleQueue {
    times: Vec<DateTime<Local>>,
}

impl ScheduleQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `at`, keeping the queue sorted. Duplicates are kept.
    pub fn enqueue(&mut self, at: DateTime<Local>) {
        let index = self.times.partition_point(|t| *t <= at);
        self.times.insert(index, at);
    }

    /// Queue `start + k * interval` for k = 1, 2, ... while the time is at or before `end`.
    ///
    /// A zero interval means once a day. Returns how many times were added. A range that
    /// would add more than [`MAX_RANGE_TIMES`] is rejected and leaves the queue untouched.
    pub fn enqueue_range(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        interval: Duration,
    ) -> AppResult<usize> {
        let interval = if interval.is_zero() {
            DEFAULT_RANGE_INTERVAL
        } else {
            interval
        };
        let step = chrono::Duration::from_std(interval)
            .map_err(|e| StationError::Automation(format!("interval out of range: {e}")))?;

        let mut range = Vec::new();
        let mut next = start.checked_add_signed(step);
        while let Some(at) = next.filter(|at| *at <= end) {
            if range.len() == MAX_RANGE_TIMES {
                return Err(StationError::Automation(format!(
                    "range adds more than {MAX_RANGE_TIMES} times; use a longer interval"
                )));
            }
            range.push(at);
            next = at.checked_add_signed(step);
        }

        let added = range.len();
        for at in range {
            self.enqueue(at);
        }
        Ok(added)
    }

    /// Remove every time
    pub fn clear(&mut self) {
        self.times.clear();
    }

    /// Remove every time strictly before `now`; returns how many were dropped.
    pub fn drop_past(&mut self, now: DateTime<Local>) -> usize {
        let before = self.times.len();
        self.times.retain(|t| *t >= now);
        before - self.times.len()
    }

    /// Number of queued times
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Queued times, ascending
    pub fn times(&self) -> &[DateTime<Local>] {
        &self.times
    }
}
