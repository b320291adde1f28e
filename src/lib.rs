#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergolink
//!
//! Device adapter core for indoor fitness equipment: rowing ergometers, bikes
//! and treadmills that talk either GATT over Bluetooth Low Energy or a serial
//! byte stream over a Bluetooth RFCOMM link.
//!
//! Every vendor speaks its own wire protocol. This crate decodes each of them
//! into one canonical [`MetricsModel`] (speed, distance, cadence, power, heart
//! rate, calories, resistance, elapsed time, inclination) and encodes
//! canonical control requests (resistance, speed, inclination, start, stop)
//! back into the vendor's frames.
//!
//! ## Supported devices
//!
//! | Family | Link | Byte order | Control |
//! |--------|------|------------|---------|
//! | Concept2 PM5 | GATT, vendor + FTMS control point | little-endian | resistance |
//! | Sports Plus bike | GATT, one multiplexed characteristic | big-endian | resistance |
//! | Toorx treadmill | serial port profile | big-endian | start |
//!
//! ## Architecture
//!
//! - [`protocol`] holds one [`Codec`] per family; codecs are pure and never
//!   touch a transport
//! - [`transport`] defines the [`Transport`] capability, implemented by
//!   [`ble::BtleTransport`] and [`serial::SerialTransport`]
//! - [`DeviceSession`] owns one device: it drives the connect, discover,
//!   subscribe and init sequence, applies decoded frames, ticks the control
//!   channel and reconnects when the link drops
//! - [`bridge`] re-publishes telemetry to a virtual peripheral and feeds its
//!   requests back into the session
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergolink::{
//!     serial::SerialTransport, DeviceFamily, DeviceIdentity, DeviceSession, SessionSignal,
//!     Settings,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Arc::new(Settings::load("ergolink.json")?);
//!     let identity = DeviceIdentity::new("TRX ROUTE KEY", "/dev/rfcomm0", DeviceFamily::ToorxTreadmill);
//!     let transport = SerialTransport::rfcomm(settings.timeouts.clone());
//!
//!     let session = DeviceSession::new(identity, Box::new(transport), settings);
//!     let handle = session.handle();
//!     let mut signals = handle.subscribe_signals();
//!     tokio::spawn(session.run());
//!
//!     while let Ok(signal) = signals.recv().await {
//!         if signal == SessionSignal::Ready {
//!             handle.start()?;
//!             break;
//!         }
//!     }
//!
//!     println!("{:?}", handle.snapshot());
//!     handle.shutdown();
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Virtual peripheral bridge
pub mod bridge;
/// Settings and their JSON file form
pub mod config;
/// Resistance, speed, inclination and start/stop requests
pub mod control;
/// Device session and its handle
pub mod device;
/// Error types and handling
pub mod error;
/// Canonical telemetry
pub mod metrics;
/// Per-family wire codecs
pub mod protocol;
/// Serial port profile transport
pub mod serial;
/// Transport capability and events
pub mod transport;
/// Type definitions and data structures
pub mod types;
/// Workout rows and feeds
pub mod workout;

// Re-export the main types for convenient usage
pub use bridge::{BridgeFactory, ControlRequest, VirtualPeripheral, WatchBridge, WatchBridgeFactory};
pub use config::{Settings, SENSOR_DISABLED};
pub use control::ControlChannel;
pub use device::{DeviceSession, SessionHandle};
pub use error::{DeviceError, Result};
pub use metrics::{Metric, MetricKind, MetricUpdate, MetricsModel, MetricsSnapshot};
pub use protocol::{codec_for, Codec, Command, Frame};
pub use transport::{Channel, ChannelProperties, EventSink, ServiceInfo, Transport, TransportEvent};
pub use types::{
    AckMode, ConnectionState, DeviceFamily, DeviceIdentity, LinkKind, SessionSignal, TimeoutConfig,
    WriteOutcome,
};
pub use workout::{Target, WorkoutFeed, WorkoutRow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
