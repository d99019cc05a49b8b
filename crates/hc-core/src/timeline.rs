//! Engine offset bookkeeping.
//!
//! Engines count time as `f64` seconds from an internal origin and are not
//! required to start at zero. The timeline records the offset reported right
//! after initialize (the relative start) and re-zeroes every later offset
//! against it before converting to calendar time:
//!
//! `calendar(offset) = reference_date + (offset - relative_start_offset)`

use chrono::{NaiveDateTime, TimeDelta};

const MICROS_PER_SECOND: f64 = 1.0e6;

/// Calendar view over the engine's relative time axis.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionTimeline {
    reference_date: NaiveDateTime,
    start_offset: f64,
    end_offset: f64,
    step_offset: f64,
    current_offset: f64,
    relative_start_offset: f64,
    captured: bool,
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new(NaiveDateTime::default())
    }
}

impl ExecutionTimeline {
    /// Create an empty timeline anchored at `reference_date`.
    pub fn new(reference_date: NaiveDateTime) -> Self {
        Self {
            reference_date,
            start_offset: 0.0,
            end_offset: 0.0,
            step_offset: 0.0,
            current_offset: 0.0,
            relative_start_offset: 0.0,
            captured: false,
        }
    }

    pub fn set_reference_date(&mut self, date: NaiveDateTime) {
        self.reference_date = date;
    }

    /// Record the offsets reported by the engine right after initialize.
    ///
    /// `current` becomes the relative start; it is subtracted from every
    /// offset converted afterwards, including `start` and `end`.
    pub fn capture(&mut self, start: f64, end: f64, step: f64, current: f64) {
        self.start_offset = start;
        self.end_offset = end;
        self.step_offset = step;
        self.current_offset = current;
        self.relative_start_offset = current;
        self.captured = true;
    }

    /// Move the current offset forward.
    ///
    /// Returns `false` (and leaves the timeline untouched) when the new offset
    /// is not finite or would move time backwards.
    pub fn advance(&mut self, new_current: f64) -> bool {
        if !new_current.is_finite() || new_current < self.current_offset {
            return false;
        }
        self.current_offset = new_current;
        true
    }

    /// Convert an engine offset to calendar time.
    pub fn to_calendar(&self, offset: f64) -> NaiveDateTime {
        let seconds = offset - self.relative_start_offset;
        if !seconds.is_finite() {
            return self.reference_date;
        }
        let micros = (seconds * MICROS_PER_SECOND).round();
        let delta = TimeDelta::microseconds(micros as i64);
        match self.reference_date.checked_add_signed(delta) {
            Some(date) => date,
            None if micros > 0.0 => NaiveDateTime::MAX,
            None => NaiveDateTime::MIN,
        }
    }

    /// Convert calendar time back to an engine offset.
    pub fn to_offset(&self, date: NaiveDateTime) -> f64 {
        let delta = date.signed_duration_since(self.reference_date);
        let micros = delta.num_microseconds().unwrap_or(if delta > TimeDelta::zero() {
            i64::MAX
        } else {
            i64::MIN
        });
        micros as f64 / MICROS_PER_SECOND + self.relative_start_offset
    }

    pub fn start_time(&self) -> NaiveDateTime {
        self.to_calendar(self.start_offset)
    }

    pub fn stop_time(&self) -> NaiveDateTime {
        self.to_calendar(self.end_offset)
    }

    pub fn current_time(&self) -> NaiveDateTime {
        self.to_calendar(self.current_offset)
    }

    /// Engine step as a calendar duration.
    pub fn time_step(&self) -> TimeDelta {
        TimeDelta::microseconds((self.step_offset * MICROS_PER_SECOND).round() as i64)
    }

    /// Fraction of `[start, end]` covered by the current offset, clamped to `[0, 1]`.
    pub fn fraction_complete(&self) -> f64 {
        let span = self.end_offset - self.start_offset;
        if span <= 0.0 {
            return 1.0;
        }
        ((self.current_offset - self.start_offset) / span).clamp(0.0, 1.0)
    }

    pub fn reference_date(&self) -> NaiveDateTime {
        self.reference_date
    }

    pub fn start_offset(&self) -> f64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> f64 {
        self.end_offset
    }

    pub fn step_offset(&self) -> f64 {
        self.step_offset
    }

    pub fn current_offset(&self) -> f64 {
        self.current_offset
    }

    pub fn relative_start_offset(&self) -> f64 {
        self.relative_start_offset
    }

    /// Whether `capture` has been called.
    pub fn is_captured(&self) -> bool {
        self.captured
    }
}
