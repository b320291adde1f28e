//! Session configuration.
//!
//! One [`Settings`] value is built at startup (usually from a JSON file) and
//! handed to every session by reference. Nothing in the crate reads settings
//! from a global store.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::{error::Result, metrics::MetricKind, types::TimeoutConfig};

/// Sensor name meaning "no external sensor, use the value decoded from the device"
pub const SENSOR_DISABLED: &str = "Disabled";

/// Recognized options for the adapter core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Create a virtual peripheral bridge once a device is ready
    pub virtual_device_enabled: bool,
    /// Heart rate comes from an ANT+ strap instead of the device
    pub ant_heart: bool,
    /// External heart rate belt, or `"Disabled"`
    pub heart_rate_belt_name: String,
    /// External cadence sensor, or `"Disabled"`
    pub cadence_sensor_name: String,
    /// External power meter, or `"Disabled"`
    pub power_sensor_name: String,
    /// Derive speed from power instead of the decoded speed field
    pub speed_power_based: bool,
    /// Passed through to the workout feed, not used by the core
    pub treadmill_force_speed: bool,
    /// Timing knobs
    pub timeouts: TimeoutConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            virtual_device_enabled: true,
            ant_heart: false,
            heart_rate_belt_name: SENSOR_DISABLED.to_string(),
            cadence_sensor_name: SENSOR_DISABLED.to_string(),
            power_sensor_name: SENSOR_DISABLED.to_string(),
            speed_power_based: false,
            treadmill_force_speed: false,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeviceError::Io`] if the file cannot be read and
    /// [`crate::DeviceError::Config`] if it is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Write settings as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeviceError::Io`] if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Heart rate decoded from the device is used
    #[must_use]
    pub fn accepts_local_heart(&self) -> bool {
        !self.ant_heart && is_disabled(&self.heart_rate_belt_name)
    }

    /// Cadence decoded from the device is used
    #[must_use]
    pub fn accepts_local_cadence(&self) -> bool {
        is_disabled(&self.cadence_sensor_name)
    }

    /// Power decoded from the device is used
    #[must_use]
    pub fn accepts_local_power(&self) -> bool {
        is_disabled(&self.power_sensor_name)
    }

    /// Whether a locally decoded value of `kind` may be written to the model
    #[must_use]
    pub fn accepts_local(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::HeartRate => self.accepts_local_heart(),
            MetricKind::Cadence => self.accepts_local_cadence(),
            MetricKind::Power => self.accepts_local_power(),
            _ => true,
        }
    }
}

fn is_disabled(sensor_name: &str) -> bool {
    sensor_name.starts_with(SENSOR_DISABLED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_accept_local_values() {
        let settings = Settings::default();
        assert!(settings.virtual_device_enabled);
        assert!(settings.accepts_local_heart());
        assert!(settings.accepts_local_cadence());
        assert!(settings.accepts_local_power());
        assert!(!settings.speed_power_based);
    }

    #[test]
    fn test_external_sensors_override() {
        let settings = Settings {
            heart_rate_belt_name: "Polar H10".to_string(),
            cadence_sensor_name: "Wahoo RPM".to_string(),
            ..Default::default()
        };
        assert!(!settings.accepts_local_heart());
        assert!(!settings.accepts_local_cadence());
        assert!(settings.accepts_local_power());

        assert!(!settings.accepts_local(MetricKind::HeartRate));
        assert!(!settings.accepts_local(MetricKind::Cadence));
        assert!(settings.accepts_local(MetricKind::Speed));

        let ant = Settings {
            ant_heart: true,
            ..Default::default()
        };
        assert!(!ant.accepts_local_heart());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "speed_power_based": true, "timeouts": { "ack_timeout_ms": 500 } }"#)
                .unwrap();
        assert!(settings.speed_power_based);
        assert!(settings.virtual_device_enabled);
        assert_eq!(settings.timeouts.ack_timeout_ms, 500);
        assert_eq!(settings.timeouts.tick_interval_ms, 200);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = Settings {
            virtual_device_enabled: false,
            power_sensor_name: "Assioma".to_string(),
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(crate::DeviceError::Io(_))));
    }
}
