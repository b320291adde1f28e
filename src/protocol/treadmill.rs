//! Toorx treadmill console over a serial port profile link.
//!
//! The console answers a 4-byte poll with a 17-byte status frame (big-endian
//! fields). A 13-byte frame is a handshake and must be answered before
//! the console starts streaming.

use bytes::Bytes;
use std::ops::RangeInclusive;
use tracing::trace;
use uuid::Uuid;

use super::{u16_be, unsupported, Codec, Command, DecodeContext, Frame};
use crate::{
    error::Result,
    metrics::{MetricKind, MetricUpdate},
    types::{AckMode, DeviceFamily},
};

/// Serial port profile service class, also used as the stream's channel id
pub const SERIAL_PORT_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

const STATUS_LEN: usize = 17;
const HANDSHAKE_LEN: usize = 13;

const HANDSHAKE_REPLY: [u8; 8] = [0x55, 0x17, 0x01, 0x01, 0x55, 0xB5, 0x01, 0xFF];
const POLL: [u8; 4] = [0x55, 0x17, 0x01, 0x01];

const INIT_QUERIES: [u8; 12] = [0x55, 0x0C, 0x01, 0xFF, 0x55, 0xBB, 0x01, 0xFF, 0x55, 0x24, 0x01, 0xFF];

/// Register ids queried after the first burst, each sent as `55 id 01 ff`
const INIT_REGISTERS: [u8; 24] = [
    0x25, 0x26, 0x27, 0x02, 0x03, 0x04, 0x06, 0x1F, 0xA0, 0xB0, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7,
    0xB8, 0xB9, 0xBA, 0x0B, 0x18, 0x19, 0x1A, 0x1B,
];

const START: [u8; 4] = [0x55, 0x0A, 0x01, 0x02];
const START_PROGRAM: [u8; 9] = [0x55, 0x01, 0x06, 0x1D, 0x00, 0x3C, 0x00, 0xAA, 0x00];
const START_PHASES: [&[u8]; 4] = [
    &[0x55, 0x15, 0x01, 0x00],
    &[0x55, 0x0F, 0x02, 0x01, 0x00],
    &[0x55, 0x11, 0x01, 0x01],
    &[0x55, 0x08, 0x01, 0x01],
];

/// Codec for the Toorx treadmill
#[derive(Debug, Default)]
pub struct ToorxCodec;

impl ToorxCodec {
    /// Create a codec
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Codec for ToorxCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::ToorxTreadmill
    }

    fn control_channel(&self) -> Uuid {
        SERIAL_PORT_UUID
    }

    fn resistance_range(&self) -> Option<RangeInclusive<i16>> {
        None
    }

    fn decode(&mut self, frame: &Frame, _ctx: &DecodeContext<'_>) -> Vec<MetricUpdate> {
        let data = frame.data();
        if data.len() != STATUS_LEN {
            trace!("Skipping {} byte console frame", data.len());
            return Vec::new();
        }

        let speed = (f64::from(data[13]) * 100.0 + f64::from(data[14])) / 100.0;
        vec![
            MetricUpdate::Set(MetricKind::Elapsed, f64::from(u16_be(data, 7))),
            MetricUpdate::Set(MetricKind::Distance, f64::from(u16_be(data, 9))),
            MetricUpdate::Set(MetricKind::Calories, f64::from(u16_be(data, 11))),
            MetricUpdate::Set(MetricKind::Speed, speed),
            MetricUpdate::Set(MetricKind::Inclination, f64::from(data[15])),
            MetricUpdate::Set(MetricKind::HeartRate, f64::from(data[16])),
        ]
    }

    fn reply(&self, frame: &Frame) -> Option<Bytes> {
        (frame.len() == HANDSHAKE_LEN).then(|| Bytes::from_static(&HANDSHAKE_REPLY))
    }

    fn encode(&self, command: &Command) -> Result<Vec<Bytes>> {
        match command {
            Command::Start => {
                let mut frames = vec![Bytes::from_static(&START), Bytes::from_static(&START_PROGRAM)];
                frames.extend(START_PHASES.iter().copied().map(Bytes::from_static));
                Ok(frames)
            }
            Command::Stop => Ok(Vec::new()),
            Command::SetResistance(_) | Command::SetSpeed(_) | Command::SetInclination(_) => {
                Err(unsupported(command, self.family()))
            }
        }
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::FireAndForget
    }

    fn init_sequence(&self) -> Vec<Bytes> {
        let registers: Vec<u8> = INIT_REGISTERS
            .iter()
            .flat_map(|register| [0x55, *register, 0x01, 0xFF])
            .collect();
        vec![Bytes::from_static(&INIT_QUERIES), Bytes::from(registers)]
    }

    fn poll(&self, _resistance: i16) -> Option<Bytes> {
        Some(Bytes::from_static(&POLL))
    }

    fn paces_commands(&self) -> bool {
        true
    }
}
