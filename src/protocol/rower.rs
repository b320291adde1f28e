//! Concept2 PM5 rowing monitor.
//!
//! Telemetry arrives on three vendor characteristics of the rowing service,
//! all fields little-endian. Resistance is written to the standard fitness
//! machine control point.

use bytes::Bytes;
use std::{ops::RangeInclusive, time::Instant};
use tracing::trace;
use uuid::Uuid;

use super::{u16_le, u24_le, unsupported, uuid_from_u16, Codec, Command, DecodeContext, Frame};
use crate::{
    error::Result,
    metrics::{MetricKind, MetricUpdate},
    types::{AckMode, DeviceFamily},
};

/// Rowing general status: elapsed time and distance
pub const GENERAL_STATUS_UUID: Uuid = Uuid::from_u128(0xce06_0031_43e5_11e4_916c_0800_200c_9a66);
/// Rowing additional status: speed, stroke rate, heart rate
pub const ADDITIONAL_STATUS_UUID: Uuid = Uuid::from_u128(0xce06_0032_43e5_11e4_916c_0800_200c_9a66);
/// Rowing additional status 2: calories
pub const ENERGY_STATUS_UUID: Uuid = Uuid::from_u128(0xce06_0033_43e5_11e4_916c_0800_200c_9a66);
/// Fitness machine control point
pub const CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2AD9);

const GENERAL_STATUS_LEN: usize = 19;
const ADDITIONAL_STATUS_LEN: usize = 17;
const ENERGY_STATUS_LEN: usize = 20;

/// Heart rate byte value meaning "no strap"
const HEART_RATE_ABSENT: u8 = 0xFF;

/// Control point opcode for "set target resistance level"
const OP_SET_RESISTANCE: u8 = 0x11;

/// Divisor for stroke rate (spm) times milliseconds since the previous frame
const STROKE_DIVISOR: f64 = 600_000.0;

const MIN_RESISTANCE: i16 = 1;
const MAX_RESISTANCE: i16 = 100;

/// Codec for the Concept2 PM5
#[derive(Debug, Default)]
pub struct Concept2Codec {
    last_frame_at: Option<Instant>,
}

impl Concept2Codec {
    /// Create a codec with no frame history
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_frame_at: None,
        }
    }

    fn decode_general(data: &[u8], updates: &mut Vec<MetricUpdate>) {
        if data.len() < GENERAL_STATUS_LEN {
            return;
        }
        let elapsed_centis = u24_le(data, 0);
        let distance_dm = u24_le(data, 3);
        updates.push(MetricUpdate::Set(MetricKind::Elapsed, f64::from(elapsed_centis) / 100.0));
        updates.push(MetricUpdate::Set(MetricKind::Distance, f64::from(distance_dm) / 10_000.0));
    }

    fn decode_additional(data: &[u8], elapsed_ms: f64, updates: &mut Vec<MetricUpdate>) {
        if data.len() < ADDITIONAL_STATUS_LEN {
            return;
        }
        let speed_mms = u16_le(data, 3);
        let stroke_rate = f64::from(data[5]);
        let heart_rate = data[6];

        updates.push(MetricUpdate::Set(MetricKind::Speed, f64::from(speed_mms) * 0.0036));
        updates.push(MetricUpdate::Set(MetricKind::Cadence, stroke_rate));
        updates.push(MetricUpdate::Accumulate(
            MetricKind::StrokeCount,
            stroke_rate * elapsed_ms / STROKE_DIVISOR,
        ));

        if heart_rate != HEART_RATE_ABSENT {
            updates.push(MetricUpdate::Set(MetricKind::HeartRate, f64::from(heart_rate)));
        }
    }

    fn decode_energy(data: &[u8], updates: &mut Vec<MetricUpdate>) {
        if data.len() < ENERGY_STATUS_LEN {
            return;
        }
        updates.push(MetricUpdate::Set(MetricKind::Calories, f64::from(u16_le(data, 6))));
    }
}

impl Codec for Concept2Codec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Concept2Rower
    }

    fn control_channel(&self) -> Uuid {
        CONTROL_POINT_UUID
    }

    fn resistance_range(&self) -> Option<RangeInclusive<i16>> {
        Some(MIN_RESISTANCE..=MAX_RESISTANCE)
    }

    fn decode(&mut self, frame: &Frame, ctx: &DecodeContext<'_>) -> Vec<MetricUpdate> {
        let elapsed_ms = self
            .last_frame_at
            .map_or(0.0, |last| ctx.now.saturating_duration_since(last).as_secs_f64() * 1000.0);
        self.last_frame_at = Some(ctx.now);

        let mut updates = Vec::new();
        match frame.channel() {
            GENERAL_STATUS_UUID => Self::decode_general(frame.data(), &mut updates),
            ADDITIONAL_STATUS_UUID => Self::decode_additional(frame.data(), elapsed_ms, &mut updates),
            ENERGY_STATUS_UUID => Self::decode_energy(frame.data(), &mut updates),
            other => trace!("Ignoring frame from channel {}", other),
        }
        updates
    }

    fn encode(&self, command: &Command) -> Result<Vec<Bytes>> {
        match command {
            Command::SetResistance(level) => {
                let raw = u16::try_from(*level).unwrap_or(0).saturating_mul(100);
                let [lo, hi] = raw.to_le_bytes();
                Ok(vec![Bytes::copy_from_slice(&[
                    OP_SET_RESISTANCE,
                    0x00,
                    0x00,
                    lo,
                    hi,
                    0x00,
                    0x00,
                ])])
            }
            Command::Start | Command::Stop => Ok(Vec::new()),
            Command::SetSpeed(_) | Command::SetInclination(_) => {
                Err(unsupported(command, self.family()))
            }
        }
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::WaitForWrite
    }
}
