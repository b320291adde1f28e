//! Workout rows supplied by an external scheduler.
//!
//! The core does not time rows itself. Whoever drives the workout calls
//! [`WorkoutFeed::advance`] when a row's duration is up and hands the row to
//! the session, which turns its targets into control requests.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{control::ControlChannel, error::Result};

/// A target value with optional bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target<T> {
    /// Value to apply
    pub value: T,
    /// Lowest acceptable value
    #[serde(default)]
    pub lower: Option<T>,
    /// Highest acceptable value
    #[serde(default)]
    pub upper: Option<T>,
}

impl<T> Target<T> {
    /// Target without bounds
    pub const fn exact(value: T) -> Self {
        Self {
            value,
            lower: None,
            upper: None,
        }
    }
}

/// One step of a workout
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkoutRow {
    /// Row length in seconds
    pub duration_secs: u64,
    /// Resistance level
    pub resistance: Option<Target<i16>>,
    /// Cadence in rpm; shown to the user, never written to the device
    pub cadence: Option<Target<f64>>,
    /// Belt speed in km/h
    pub speed: Option<f64>,
    /// Inclination in percent
    pub inclination: Option<f64>,
    /// Metabolic equivalent
    pub met: Option<f64>,
}

impl WorkoutRow {
    /// Row length
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Fill the control channel's pending slots from this row's targets
    pub fn apply_to(&self, control: &mut ControlChannel) {
        if let Some(resistance) = self.resistance {
            control.set_resistance(resistance.value);
        }
        if let Some(speed) = self.speed {
            control.set_speed(speed);
        }
        if let Some(inclination) = self.inclination {
            control.set_inclination(inclination);
        }
    }
}

/// Ordered rows with a cursor
#[derive(Debug, Clone, Default)]
pub struct WorkoutFeed {
    rows: Vec<WorkoutRow>,
    position: usize,
    force_speed: bool,
}

impl WorkoutFeed {
    /// Create a feed positioned on the first row
    #[must_use]
    pub const fn new(rows: Vec<WorkoutRow>, force_speed: bool) -> Self {
        Self {
            rows,
            position: 0,
            force_speed,
        }
    }

    /// Parse rows from a JSON array
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeviceError::Config`] if the JSON does not describe a
    /// list of rows.
    pub fn from_json(json: &str, force_speed: bool) -> Result<Self> {
        let rows = serde_json::from_str(json)?;
        Ok(Self::new(rows, force_speed))
    }

    /// Row under the cursor, `None` once the feed is finished
    #[must_use]
    pub fn current(&self) -> Option<&WorkoutRow> {
        self.rows.get(self.position)
    }

    /// Move to the next row and return it
    pub fn advance(&mut self) -> Option<&WorkoutRow> {
        if self.position < self.rows.len() {
            self.position += 1;
        }
        self.current()
    }

    /// Go back to the first row
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Cursor index
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// All rows consumed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.position >= self.rows.len()
    }

    /// Sum of all row durations
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.rows.iter().map(WorkoutRow::duration).sum()
    }

    /// Speed targets override the treadmill's own speed program
    #[must_use]
    pub const fn force_speed(&self) -> bool {
        self.force_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::AckSlot;

    const ROWS: &str = r#"[
        { "duration_secs": 60, "resistance": { "value": 4 } },
        { "duration_secs": 120, "resistance": { "value": 8, "lower": 6, "upper": 10 },
          "cadence": { "value": 90.0 } },
        { "duration_secs": 30, "speed": 10.5, "inclination": 2.0, "met": 9.8 }
    ]"#;

    #[test]
    fn test_feed_cursor() {
        let mut feed = WorkoutFeed::from_json(ROWS, false).unwrap();

        assert_eq!(feed.total_duration(), Duration::from_secs(210));
        assert_eq!(feed.current().unwrap().resistance, Some(Target::exact(4)));

        let second = feed.advance().unwrap();
        assert_eq!(second.resistance.unwrap().upper, Some(10));
        assert!((second.cadence.unwrap().value - 90.0).abs() < f64::EPSILON);

        assert!(feed.advance().is_some());
        assert!(feed.advance().is_none());
        assert!(feed.is_finished());
        assert!(feed.advance().is_none());
        assert_eq!(feed.position(), 3);

        feed.reset();
        assert_eq!(feed.position(), 0);
        assert!(!feed.is_finished());
    }

    #[test]
    fn test_row_fills_control_slots() {
        let mut feed = WorkoutFeed::from_json(ROWS, true).unwrap();
        let mut control = ControlChannel::new(AckSlot::default(), Duration::from_millis(300));

        feed.current().unwrap().apply_to(&mut control);
        assert!(feed.force_speed());
        assert_eq!(control.pending_resistance(), Some(4));
        assert_eq!(control.pending_speed(), None);

        feed.advance();
        let third = feed.advance().unwrap();
        third.apply_to(&mut control);
        // an earlier unconsumed resistance request stays in place
        assert_eq!(control.pending_resistance(), Some(4));
        assert_eq!(control.pending_speed(), Some(10.5));
        assert_eq!(control.pending_inclination(), Some(2.0));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            WorkoutFeed::from_json("{ \"rows\": 3 }", false),
            Err(crate::DeviceError::Config(_))
        ));
    }

    #[test]
    fn test_empty_feed_is_finished() {
        let feed = WorkoutFeed::default();
        assert!(feed.is_finished());
        assert!(feed.current().is_none());
        assert_eq!(feed.total_duration(), Duration::ZERO);
    }
}
