use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Session created, no connection attempted yet
    #[default]
    Idle,
    /// Connect request issued, waiting for the transport
    Connecting,
    /// Link is up, services are being enumerated
    DiscoveringServices,
    /// Notification subscriptions requested, waiting for acknowledgements
    SubscribingNotifications,
    /// Telemetry decoding and control writes are active
    Ready,
    /// Link dropped
    Disconnected,
}

impl ConnectionState {
    /// States in which the transport is expected to report a live link
    #[must_use]
    pub const fn expects_link(self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::SubscribingNotifications | Self::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering Services"),
            Self::SubscribingNotifications => write!(f, "Subscribing Notifications"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Physical link used by a device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// GATT services and characteristics over Bluetooth LE
    Gatt,
    /// Byte stream over an RFCOMM serial port
    Serial,
}

/// Supported device families, one codec each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    /// Concept2 PM5 rowing/ski monitor (standard + vendor GATT)
    Concept2Rower,
    /// Sports Plus bike, vendor GATT with one multiplexed characteristic
    SportsPlusBike,
    /// Toorx treadmill with a serial-over-radio console
    ToorxTreadmill,
}

impl DeviceFamily {
    /// Guess the family from an advertised device name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        if upper.starts_with("PM5") {
            Some(Self::Concept2Rower)
        } else if upper.starts_with("TRX ROUTE KEY") {
            Some(Self::ToorxTreadmill)
        } else {
            None
        }
    }

    /// Link kind the family talks over
    #[must_use]
    pub const fn link(self) -> LinkKind {
        match self {
            Self::Concept2Rower | Self::SportsPlusBike => LinkKind::Gatt,
            Self::ToorxTreadmill => LinkKind::Serial,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concept2Rower => write!(f, "Concept2 PM5"),
            Self::SportsPlusBike => write!(f, "Sports Plus bike"),
            Self::ToorxTreadmill => write!(f, "Toorx treadmill"),
        }
    }
}

/// Identity of one physical unit, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Advertised name
    pub name: String,
    /// Bluetooth address for GATT devices, device node path for serial ones
    pub address: String,
    /// Codec family selected for the unit
    pub family: DeviceFamily,
}

impl DeviceIdentity {
    /// Create a new identity
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            family,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.name, self.address, self.family)
    }
}

/// Whether a control write waits for a device-originated signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// Return as soon as the transport accepted the bytes
    FireAndForget,
    /// Wait for the characteristic-written confirmation
    WaitForWrite,
    /// Wait for the next inbound frame from the device
    WaitForResponse,
}

/// How a control write finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No acknowledgement was requested
    Sent,
    /// The expected acknowledgement arrived before the deadline
    Acknowledged,
    /// The deadline elapsed first; the write is treated as best-effort
    TimedOut,
    /// The wait was abandoned because the session is shutting down
    Abandoned,
}

/// Signals emitted by a device session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// All subscriptions acknowledged, session is ready
    Ready,
    /// The link dropped
    Disconnected,
    /// A start request was consumed
    Started,
    /// A stop request was consumed
    Stopped,
    /// A resistance target was written to the device
    ResistanceApplied(i16),
    /// A speed target was written to the device
    SpeedApplied(f64),
    /// An inclination target was written to the device
    InclinationApplied(f64),
}

/// Timing configuration for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection manager tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Deadline for acknowledged control writes in milliseconds
    pub ack_timeout_ms: u64,
    /// Timeout for a single connect attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Scan duration when looking up a peripheral in milliseconds
    pub scan_timeout_ms: u64,
}

impl TimeoutConfig {
    /// Tick period as a duration
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Ack deadline as a duration
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 200,
            ack_timeout_ms: 300,
            connect_timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_name() {
        assert_eq!(
            DeviceFamily::from_name("PM5 430123456 Row"),
            Some(DeviceFamily::Concept2Rower)
        );
        assert_eq!(
            DeviceFamily::from_name("TRX ROUTE KEY 01"),
            Some(DeviceFamily::ToorxTreadmill)
        );
        assert_eq!(DeviceFamily::from_name("KICKR CORE 1A2B"), None);
    }

    #[test]
    fn test_family_links() {
        assert_eq!(DeviceFamily::Concept2Rower.link(), LinkKind::Gatt);
        assert_eq!(DeviceFamily::SportsPlusBike.link(), LinkKind::Gatt);
        assert_eq!(DeviceFamily::ToorxTreadmill.link(), LinkKind::Serial);
    }

    #[test]
    fn test_state_expects_link() {
        assert!(ConnectionState::Ready.expects_link());
        assert!(ConnectionState::SubscribingNotifications.expects_link());
        assert!(!ConnectionState::Connecting.expects_link());
        assert!(!ConnectionState::Disconnected.expects_link());
        assert!(!ConnectionState::Idle.expects_link());
    }

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();

        assert_eq!(config.tick_interval_ms, 200);
        assert_eq!(config.ack_timeout_ms, 300);
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.ack_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_identity_display() {
        let identity = DeviceIdentity::new("PM5", "AA:BB:CC:DD:EE:FF", DeviceFamily::Concept2Rower);
        assert_eq!(format!("{identity}"), "PM5 [AA:BB:CC:DD:EE:FF] (Concept2 PM5)");
    }
}
