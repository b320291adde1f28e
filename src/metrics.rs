//! Canonical telemetry model.
//!
//! A [`MetricsModel`] is owned by exactly one device session and is the only
//! place current telemetry lives. Codecs never write it directly: they return
//! [`MetricUpdate`]s which the session applies in frame-arrival order, then
//! runs the derived-metric step. Readers get [`MetricsSnapshot`] copies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical kind of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Speed in km/h
    Speed,
    /// Distance in km
    Distance,
    /// Cadence in rpm (stroke rate for rowers)
    Cadence,
    /// Power in watts
    Power,
    /// Heart rate in bpm
    HeartRate,
    /// Energy in kcal
    Calories,
    /// Device resistance level
    Resistance,
    /// Fan speed level
    FanSpeed,
    /// Elapsed time in seconds
    Elapsed,
    /// Inclination in percent
    Inclination,
    /// Rowing strokes
    StrokeCount,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Speed => "speed",
            Self::Distance => "distance",
            Self::Cadence => "cadence",
            Self::Power => "power",
            Self::HeartRate => "heart rate",
            Self::Calories => "calories",
            Self::Resistance => "resistance",
            Self::FanSpeed => "fan speed",
            Self::Elapsed => "elapsed",
            Self::Inclination => "inclination",
            Self::StrokeCount => "stroke count",
        };
        f.write_str(name)
    }
}

/// A named value with its kind tag
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    kind: MetricKind,
    value: f64,
}

impl Metric {
    /// Create a metric holding zero
    #[must_use]
    pub const fn new(kind: MetricKind) -> Self {
        Self { kind, value: 0.0 }
    }

    /// Kind tag
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Latest value
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    fn set(&mut self, value: f64) {
        self.value = value;
    }

    fn add(&mut self, delta: f64) {
        self.value += delta;
    }
}

/// One change produced by decoding a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricUpdate {
    /// Replace the value of a metric
    Set(MetricKind, f64),
    /// Add to an accumulated metric (integrated distance, stroke count)
    Accumulate(MetricKind, f64),
}

impl MetricUpdate {
    /// Metric the update touches
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Set(kind, _) | Self::Accumulate(kind, _) => *kind,
        }
    }
}

/// Point-in-time copy of the model, handed to readers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Speed in km/h
    pub speed: f64,
    /// Distance in km
    pub distance: f64,
    /// Cadence in rpm
    pub cadence: f64,
    /// Power in watts, zero while cadence is zero
    pub power: f64,
    /// Heart rate in bpm
    pub heart_rate: f64,
    /// Energy in kcal
    pub calories: f64,
    /// Resistance level
    pub resistance: f64,
    /// Fan speed level
    pub fan_speed: f64,
    /// Elapsed seconds
    pub elapsed: f64,
    /// Inclination in percent
    pub inclination: f64,
    /// Rowing strokes
    pub stroke_count: f64,
    /// Reconstructed crank revolutions
    pub crank_revolutions: u64,
    /// Last crank event time in 1/1024 s, wrapping
    pub last_crank_event_time: u16,
}

/// Live telemetry for one device session
#[derive(Debug, Clone)]
pub struct MetricsModel {
    speed: Metric,
    distance: Metric,
    cadence: Metric,
    power: Metric,
    heart_rate: Metric,
    calories: Metric,
    resistance: Metric,
    fan_speed: Metric,
    elapsed: Metric,
    inclination: Metric,
    stroke_count: Metric,
    crank_revolutions: u64,
    last_crank_event_time: u16,
}

impl Default for MetricsModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsModel {
    /// Create a zeroed model
    #[must_use]
    pub const fn new() -> Self {
        Self {
            speed: Metric::new(MetricKind::Speed),
            distance: Metric::new(MetricKind::Distance),
            cadence: Metric::new(MetricKind::Cadence),
            power: Metric::new(MetricKind::Power),
            heart_rate: Metric::new(MetricKind::HeartRate),
            calories: Metric::new(MetricKind::Calories),
            resistance: Metric::new(MetricKind::Resistance),
            fan_speed: Metric::new(MetricKind::FanSpeed),
            elapsed: Metric::new(MetricKind::Elapsed),
            inclination: Metric::new(MetricKind::Inclination),
            stroke_count: Metric::new(MetricKind::StrokeCount),
            crank_revolutions: 0,
            last_crank_event_time: 0,
        }
    }

    /// Borrow a metric by kind
    #[must_use]
    pub const fn metric(&self, kind: MetricKind) -> &Metric {
        match kind {
            MetricKind::Speed => &self.speed,
            MetricKind::Distance => &self.distance,
            MetricKind::Cadence => &self.cadence,
            MetricKind::Power => &self.power,
            MetricKind::HeartRate => &self.heart_rate,
            MetricKind::Calories => &self.calories,
            MetricKind::Resistance => &self.resistance,
            MetricKind::FanSpeed => &self.fan_speed,
            MetricKind::Elapsed => &self.elapsed,
            MetricKind::Inclination => &self.inclination,
            MetricKind::StrokeCount => &self.stroke_count,
        }
    }

    fn metric_mut(&mut self, kind: MetricKind) -> &mut Metric {
        match kind {
            MetricKind::Speed => &mut self.speed,
            MetricKind::Distance => &mut self.distance,
            MetricKind::Cadence => &mut self.cadence,
            MetricKind::Power => &mut self.power,
            MetricKind::HeartRate => &mut self.heart_rate,
            MetricKind::Calories => &mut self.calories,
            MetricKind::Resistance => &mut self.resistance,
            MetricKind::FanSpeed => &mut self.fan_speed,
            MetricKind::Elapsed => &mut self.elapsed,
            MetricKind::Inclination => &mut self.inclination,
            MetricKind::StrokeCount => &mut self.stroke_count,
        }
    }

    /// Latest value of a metric
    #[must_use]
    pub const fn value(&self, kind: MetricKind) -> f64 {
        self.metric(kind).value()
    }

    /// Apply one update
    pub fn apply(&mut self, update: MetricUpdate) {
        match update {
            MetricUpdate::Set(kind, value) => self.metric_mut(kind).set(value),
            MetricUpdate::Accumulate(kind, delta) => self.metric_mut(kind).add(delta),
        }
    }

    /// Reconstruct one crank event from the current cadence.
    ///
    /// Runs once per decoded frame. With cadence at zero both counters stay
    /// where they are.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn derive_crank_event(&mut self) {
        let cadence = self.cadence.value();
        if cadence <= 0.0 {
            return;
        }

        self.crank_revolutions += 1;
        let ticks = (1024.0 / (cadence / 60.0)).round() as u64;
        self.last_crank_event_time = self
            .last_crank_event_time
            .wrapping_add((ticks & 0xFFFF) as u16);
    }

    /// Reconstructed crank revolutions
    #[must_use]
    pub const fn crank_revolutions(&self) -> u64 {
        self.crank_revolutions
    }

    /// Last crank event time in 1/1024 s
    #[must_use]
    pub const fn last_crank_event_time(&self) -> u16 {
        self.last_crank_event_time
    }

    /// Power as reported outward: zero while not pedalling
    #[must_use]
    pub fn effective_power(&self) -> f64 {
        if self.cadence.value() == 0.0 {
            0.0
        } else {
            self.power.value()
        }
    }

    /// Copy the current state
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            speed: self.speed.value(),
            distance: self.distance.value(),
            cadence: self.cadence.value(),
            power: self.effective_power(),
            heart_rate: self.heart_rate.value(),
            calories: self.calories.value(),
            resistance: self.resistance.value(),
            fan_speed: self.fan_speed.value(),
            elapsed: self.elapsed.value(),
            inclination: self.inclination.value(),
            stroke_count: self.stroke_count.value(),
            crank_revolutions: self.crank_revolutions,
            last_crank_event_time: self.last_crank_event_time,
        }
    }
}

/// Rider plus bike mass in kg used by [`speed_from_power`]
const RIDER_MASS_KG: f64 = 84.0;
/// Rolling resistance coefficient
const ROLLING_RESISTANCE: f64 = 0.005;
/// Drag area times air density, halved
const HALF_RHO_CDA: f64 = 0.5 * 1.226 * 0.3;
const GRAVITY: f64 = 9.8067;

/// Flat-road speed in km/h sustained by `watts`.
///
/// Solves `P = (Crr * m * g + 0.5 * rho * CdA * v^2) * v` for `v` by bisection.
#[must_use]
pub fn speed_from_power(watts: f64) -> f64 {
    if watts <= 0.0 {
        return 0.0;
    }

    let required = |v: f64| (ROLLING_RESISTANCE * RIDER_MASS_KG * GRAVITY + HALF_RHO_CDA * v * v) * v;

    let (mut low, mut high) = (0.0_f64, 40.0_f64);
    for _ in 0..60 {
        let mid = (low + high) / 2.0;
        if required(mid) < watts {
            low = mid;
        } else {
            high = mid;
        }
    }

    low * 3.6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_set_and_accumulate() {
        let mut model = MetricsModel::new();
        model.apply(MetricUpdate::Set(MetricKind::Speed, 12.5));
        model.apply(MetricUpdate::Accumulate(MetricKind::Distance, 0.25));
        model.apply(MetricUpdate::Accumulate(MetricKind::Distance, 0.25));

        assert!((model.value(MetricKind::Speed) - 12.5).abs() < f64::EPSILON);
        assert!((model.value(MetricKind::Distance) - 0.5).abs() < f64::EPSILON);
        assert_eq!(model.metric(MetricKind::Speed).kind(), MetricKind::Speed);
    }

    #[test]
    fn test_crank_event_advances_with_cadence() {
        let mut model = MetricsModel::new();
        model.apply(MetricUpdate::Set(MetricKind::Cadence, 60.0));
        model.derive_crank_event();

        assert_eq!(model.crank_revolutions(), 1);
        assert_eq!(model.last_crank_event_time(), 1024);

        model.apply(MetricUpdate::Set(MetricKind::Cadence, 90.0));
        model.derive_crank_event();
        // 1024 / 1.5 = 682.67 rounds to 683
        assert_eq!(model.crank_revolutions(), 2);
        assert_eq!(model.last_crank_event_time(), 1024 + 683);
    }

    #[test]
    fn test_crank_event_frozen_at_zero_cadence() {
        let mut model = MetricsModel::new();
        model.apply(MetricUpdate::Set(MetricKind::Cadence, 80.0));
        model.derive_crank_event();
        let revolutions = model.crank_revolutions();
        let event_time = model.last_crank_event_time();

        model.apply(MetricUpdate::Set(MetricKind::Cadence, 0.0));
        for _ in 0..5 {
            model.derive_crank_event();
        }

        assert_eq!(model.crank_revolutions(), revolutions);
        assert_eq!(model.last_crank_event_time(), event_time);
    }

    #[test]
    fn test_crank_counter_non_decreasing_and_time_wraps() {
        let mut model = MetricsModel::new();
        let cadences = [30.0, 55.0, 0.0, 120.0, 1.0, 0.0, 75.0, 200.0];
        let mut previous = 0;

        for _ in 0..50 {
            for cadence in cadences {
                model.apply(MetricUpdate::Set(MetricKind::Cadence, cadence));
                let before_time = model.last_crank_event_time();
                model.derive_crank_event();

                assert!(model.crank_revolutions() >= previous);
                if cadence == 0.0 {
                    assert_eq!(model.crank_revolutions(), previous);
                    assert_eq!(model.last_crank_event_time(), before_time);
                } else {
                    assert_eq!(model.crank_revolutions(), previous + 1);
                }
                previous = model.crank_revolutions();
            }
        }
    }

    #[test]
    fn test_slow_cadence_wraps_modulo() {
        let mut model = MetricsModel::new();
        // 1024 / (0.5 / 60) = 122880, which is 122880 - 65536 = 57344 mod 2^16
        model.apply(MetricUpdate::Set(MetricKind::Cadence, 0.5));
        model.derive_crank_event();
        assert_eq!(model.last_crank_event_time(), 57344);
    }

    #[test]
    fn test_power_gated_by_cadence() {
        let mut model = MetricsModel::new();
        model.apply(MetricUpdate::Set(MetricKind::Power, 180.0));
        assert!(model.effective_power().abs() < f64::EPSILON);
        assert!(model.snapshot().power.abs() < f64::EPSILON);

        model.apply(MetricUpdate::Set(MetricKind::Cadence, 85.0));
        assert!((model.snapshot().power - 180.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_speed_from_power_is_monotonic() {
        assert!(speed_from_power(0.0).abs() < f64::EPSILON);
        let slow = speed_from_power(100.0);
        let fast = speed_from_power(250.0);
        assert!(slow > 15.0 && slow < 35.0, "100 W gave {slow} km/h");
        assert!(fast > slow);
    }
}
