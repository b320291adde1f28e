//! Wire codecs, one per device family.
//!
//! Every family implements [`Codec`]: it turns inbound [`Frame`]s into
//! [`MetricUpdate`]s and outbound [`Command`]s into byte frames. The session
//! selects the codec at connection time with [`codec_for`].
//!
//! Frame layouts were taken from the vendor consoles:
//! - Concept2 PM5: three vendor characteristics, little-endian fields
//! - Sports Plus bike: one multiplexed characteristic, discriminator in byte 1,
//!   big-endian fields
//! - Toorx treadmill: 17-byte serial frames, big-endian fields

use bytes::Bytes;
use std::{fmt, ops::RangeInclusive, time::Instant};
use uuid::Uuid;

use crate::{
    config::Settings,
    error::{DeviceError, Result},
    metrics::{MetricUpdate, MetricsModel},
    types::{AckMode, DeviceFamily},
};

pub mod bike;
pub mod rower;
pub mod treadmill;

pub use bike::SportsPlusCodec;
pub use rower::Concept2Codec;
pub use treadmill::ToorxCodec;

/// One unit of inbound telemetry tagged with its originating channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    channel: Uuid,
    data: Bytes,
}

impl Frame {
    /// Create a frame
    #[must_use]
    pub const fn new(channel: Uuid, data: Bytes) -> Self {
        Self { channel, data }
    }

    /// Channel the frame arrived on
    #[must_use]
    pub const fn channel(&self) -> Uuid {
        self.channel
    }

    /// Raw bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Frame carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Control commands understood by the control channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Set the resistance level (already clamped)
    SetResistance(i16),
    /// Set belt speed in km/h
    SetSpeed(f64),
    /// Set inclination in percent
    SetInclination(f64),
    /// Start the workout
    Start,
    /// Stop the workout
    Stop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetResistance(level) => write!(f, "resistance {level}"),
            Self::SetSpeed(speed) => write!(f, "speed {speed:.1} km/h"),
            Self::SetInclination(incline) => write!(f, "inclination {incline:.1}%"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// State a codec may consult while decoding
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Arrival time of the frame
    pub now: Instant,
    /// Model as it was before this frame
    pub metrics: &'a MetricsModel,
    /// Session configuration
    pub settings: &'a Settings,
}

/// Per-family frame decoder and command encoder
pub trait Codec: Send + Sync + fmt::Debug {
    /// Family handled by this codec
    fn family(&self) -> DeviceFamily;

    /// Well-known identity of the channel control writes go to
    fn control_channel(&self) -> Uuid;

    /// Valid resistance levels, `None` when the device has no resistance control
    fn resistance_range(&self) -> Option<RangeInclusive<i16>>;

    /// Clamp a resistance target into the valid range
    fn clamp_resistance(&self, target: i16) -> Option<i16> {
        self.resistance_range()
            .map(|range| target.clamp(*range.start(), *range.end()))
    }

    /// Decode one frame; short or foreign frames yield no updates
    fn decode(&mut self, frame: &Frame, ctx: &DecodeContext<'_>) -> Vec<MetricUpdate>;

    /// Bytes the device expects in answer to `frame`, if any
    fn reply(&self, _frame: &Frame) -> Option<Bytes> {
        None
    }

    /// Encode a command into one or more frames; an empty list means the
    /// command has no wire representation and is only signalled
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::UnsupportedCommand`] if the family cannot
    /// express the command.
    fn encode(&self, command: &Command) -> Result<Vec<Bytes>>;

    /// Acknowledgement policy for control writes
    fn ack_mode(&self) -> AckMode;

    /// Frames written once when the session becomes ready
    fn init_sequence(&self) -> Vec<Bytes> {
        Vec::new()
    }

    /// Frame written on every ready tick to refresh telemetry
    fn poll(&self, _resistance: i16) -> Option<Bytes> {
        None
    }

    /// The poll frame already carries the resistance level, so a tick that
    /// wrote a resistance frame skips the poll
    fn poll_carries_resistance(&self) -> bool {
        false
    }

    /// Multi-frame commands are spread one frame per tick
    fn paces_commands(&self) -> bool {
        false
    }
}

/// Build the codec for a family
#[must_use]
pub fn codec_for(family: DeviceFamily) -> Box<dyn Codec> {
    match family {
        DeviceFamily::Concept2Rower => Box::new(Concept2Codec::new()),
        DeviceFamily::SportsPlusBike => Box::new(SportsPlusCodec::new()),
        DeviceFamily::ToorxTreadmill => Box::new(ToorxCodec::new()),
    }
}

pub(crate) fn unsupported(command: &Command, family: DeviceFamily) -> DeviceError {
    DeviceError::UnsupportedCommand {
        command: command.to_string(),
        family: family.to_string(),
    }
}

/// Little-endian 24-bit field at `offset`
pub(crate) fn u24_le(data: &[u8], offset: usize) -> u32 {
    u32::from(data[offset]) | (u32::from(data[offset + 1]) << 8) | (u32::from(data[offset + 2]) << 16)
}

/// Little-endian 16-bit field at `offset`
pub(crate) fn u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Big-endian 16-bit field at `offset`
pub(crate) fn u16_be(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Expand a 16-bit assigned number into a Bluetooth base UUID
#[must_use]
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | ((short as u128) << 96))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_helpers() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(u24_le(&data, 0), 0x03_0201);
        assert_eq!(u16_le(&data, 1), 0x0302);
        assert_eq!(u16_be(&data, 1), 0x0203);
    }

    #[test]
    fn test_uuid_from_u16() {
        assert_eq!(
            uuid_from_u16(0x2AD9),
            Uuid::parse_str("00002ad9-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn test_codec_for_family() {
        for family in [
            DeviceFamily::Concept2Rower,
            DeviceFamily::SportsPlusBike,
            DeviceFamily::ToorxTreadmill,
        ] {
            assert_eq!(codec_for(family).family(), family);
        }
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(Uuid::nil(), Bytes::from_static(&[0xAA, 0xBB]));
        assert_eq!(frame.len(), 2);
        assert!(!frame.is_empty());
        assert_eq!(frame.data(), &[0xAA, 0xBB]);
        assert_eq!(frame.channel(), Uuid::nil());
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::SetResistance(5).to_string(), "resistance 5");
        assert_eq!(Command::SetSpeed(10.5).to_string(), "speed 10.5 km/h");
        assert_eq!(Command::Start.to_string(), "start");
    }
}
