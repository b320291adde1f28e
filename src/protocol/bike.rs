//! Sports Plus bike.
//!
//! One vendor characteristic carries both directions. Inbound frames are
//! 12 bytes with a discriminator at index 1: `0x20` frames carry speed,
//! `0x30` frames carry power. Cadence and calories are present in both.
//! The console never reports distance, so it is integrated from speed.

use bytes::Bytes;
use std::{ops::RangeInclusive, time::Instant};
use tracing::trace;
use uuid::Uuid;

use super::{u16_be, unsupported, uuid_from_u16, Codec, Command, DecodeContext, Frame};
use crate::{
    error::Result,
    metrics::{speed_from_power, MetricKind, MetricUpdate},
    types::{AckMode, DeviceFamily},
};

/// Vendor service
pub const SERVICE_UUID: Uuid = uuid_from_u16(0xFFF0);
/// Notify and write characteristic
pub const DATA_UUID: Uuid = uuid_from_u16(0xFFF1);

const FRAME_LEN: usize = 12;
const HEADER_SPEED: u8 = 0x20;
const HEADER_POWER: u8 = 0x30;

const INIT_FRAME: [u8; 5] = [0x40, 0x00, 0x16, 0x0A, 0x60];

const MAX_RESISTANCE: i16 = 24;

/// Codec for the Sports Plus bike
#[derive(Debug, Default)]
pub struct SportsPlusCodec {
    last_speed_frame: Option<Instant>,
}

impl SportsPlusCodec {
    /// Create a codec with no frame history
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_speed_frame: None,
        }
    }

    /// Control frame carrying the resistance level; doubles as keepalive
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn resistance_frame(level: i16) -> Bytes {
        let level = level.clamp(0, MAX_RESISTANCE) as u8;
        Bytes::copy_from_slice(&[0x20, 0x01, level, 0x00, 0x21 + level])
    }
}

impl Codec for SportsPlusCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::SportsPlusBike
    }

    fn control_channel(&self) -> Uuid {
        DATA_UUID
    }

    fn resistance_range(&self) -> Option<RangeInclusive<i16>> {
        Some(0..=MAX_RESISTANCE)
    }

    fn decode(&mut self, frame: &Frame, ctx: &DecodeContext<'_>) -> Vec<MetricUpdate> {
        let data = frame.data();
        if frame.channel() != DATA_UUID || data.len() != FRAME_LEN {
            trace!("Discarding {} byte frame from {}", data.len(), frame.channel());
            return Vec::new();
        }

        let mut updates = Vec::new();
        match data[1] {
            HEADER_SPEED => {
                let speed = f64::from(u16_be(data, 2)) / 100.0;
                if let Some(last) = self.last_speed_frame {
                    let elapsed_ms = ctx.now.saturating_duration_since(last).as_secs_f64() * 1000.0;
                    if elapsed_ms > 0.0 {
                        updates.push(MetricUpdate::Accumulate(
                            MetricKind::Distance,
                            (speed / 3600.0) / (1000.0 / elapsed_ms),
                        ));
                    }
                }
                self.last_speed_frame = Some(ctx.now);

                let speed = if ctx.settings.speed_power_based {
                    speed_from_power(ctx.metrics.value(MetricKind::Power))
                } else {
                    speed
                };
                updates.push(MetricUpdate::Set(MetricKind::Speed, speed));
            }
            HEADER_POWER => {
                updates.push(MetricUpdate::Set(MetricKind::Power, f64::from(u16_be(data, 2))));
            }
            other => trace!("Unknown frame header {:#04x}", other),
        }

        updates.push(MetricUpdate::Set(MetricKind::Cadence, f64::from(data[8])));
        updates.push(MetricUpdate::Set(MetricKind::Calories, f64::from(u16_be(data, 6))));
        updates.push(MetricUpdate::Set(MetricKind::FanSpeed, 0.0));
        updates
    }

    fn encode(&self, command: &Command) -> Result<Vec<Bytes>> {
        match command {
            Command::SetResistance(level) => Ok(vec![Self::resistance_frame(*level)]),
            Command::Start | Command::Stop => Ok(Vec::new()),
            Command::SetSpeed(_) | Command::SetInclination(_) => {
                Err(unsupported(command, self.family()))
            }
        }
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::WaitForResponse
    }

    fn init_sequence(&self) -> Vec<Bytes> {
        vec![Bytes::from_static(&INIT_FRAME)]
    }

    fn poll(&self, resistance: i16) -> Option<Bytes> {
        Some(Self::resistance_frame(resistance))
    }

    fn poll_carries_resistance(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Settings, metrics::MetricsModel};
    use std::time::Duration;

    fn frame(header: u8, value: u16, kcal: u16, cadence: u8) -> Frame {
        let mut data = [0u8; 12];
        data[1] = header;
        data[2..4].copy_from_slice(&value.to_be_bytes());
        data[6..8].copy_from_slice(&kcal.to_be_bytes());
        data[8] = cadence;
        Frame::new(DATA_UUID, Bytes::copy_from_slice(&data))
    }

    fn decode_at(
        codec: &mut SportsPlusCodec,
        frame: &Frame,
        now: Instant,
        metrics: &mut MetricsModel,
        settings: &Settings,
    ) {
        let ctx = DecodeContext {
            now,
            metrics,
            settings,
        };
        let updates = codec.decode(frame, &ctx);
        for update in updates {
            metrics.apply(update);
        }
    }

    #[test]
    fn test_speed_frame_big_endian() {
        let mut codec = SportsPlusCodec::new();
        let mut metrics = MetricsModel::new();
        let settings = Settings::default();

        // 0x0834 = 2100 -> 21.00 km/h
        decode_at(&mut codec, &frame(0x20, 0x0834, 0x0102, 75), Instant::now(), &mut metrics, &settings);

        assert!((metrics.value(MetricKind::Speed) - 21.0).abs() < 1e-9);
        assert!((metrics.value(MetricKind::Cadence) - 75.0).abs() < f64::EPSILON);
        assert!((metrics.value(MetricKind::Calories) - 258.0).abs() < f64::EPSILON);
        // first speed frame does not integrate
        assert!(metrics.value(MetricKind::Distance).abs() < f64::EPSILON);
    }

    #[test]
    fn test_power_frame() {
        let mut codec = SportsPlusCodec::new();
        let mut metrics = MetricsModel::new();
        let settings = Settings::default();

        decode_at(&mut codec, &frame(0x30, 0x00FA, 10, 80), Instant::now(), &mut metrics, &settings);

        assert!((metrics.value(MetricKind::Power) - 250.0).abs() < f64::EPSILON);
        assert!(metrics.value(MetricKind::Speed).abs() < f64::EPSILON);
    }

    #[test]
    fn test_distance_integration_console_formula() {
        // Reproduces the console's `(speed / 3600) / (1000 / elapsed_ms)`
        // as is; 36 km/h over one second yields 0.01.
        let mut codec = SportsPlusCodec::new();
        let mut metrics = MetricsModel::new();
        let settings = Settings::default();
        let start = Instant::now();
        let speed_frame = frame(0x20, 3600, 0, 60);

        decode_at(&mut codec, &speed_frame, start, &mut metrics, &settings);
        decode_at(
            &mut codec,
            &speed_frame,
            start + Duration::from_secs(1),
            &mut metrics,
            &settings,
        );

        assert!((metrics.value(MetricKind::Distance) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_speed_from_power_when_configured() {
        let mut codec = SportsPlusCodec::new();
        let mut metrics = MetricsModel::new();
        let settings = Settings {
            speed_power_based: true,
            ..Default::default()
        };
        let now = Instant::now();

        decode_at(&mut codec, &frame(0x30, 200, 0, 90), now, &mut metrics, &settings);
        decode_at(&mut codec, &frame(0x20, 1000, 0, 90), now, &mut metrics, &settings);

        assert!((metrics.value(MetricKind::Speed) - speed_from_power(200.0)).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_length_discarded() {
        let mut codec = SportsPlusCodec::new();
        let metrics = MetricsModel::new();
        let settings = Settings::default();
        let ctx = DecodeContext {
            now: Instant::now(),
            metrics: &metrics,
            settings: &settings,
        };

        for len in [0, 5, 11, 13] {
            let short = Frame::new(DATA_UUID, Bytes::from(vec![0x20; len]));
            assert!(codec.decode(&short, &ctx).is_empty());
        }
    }

    #[test]
    fn test_resistance_frame_checksum() {
        let codec = SportsPlusCodec::new();
        assert_eq!(
            codec.encode(&Command::SetResistance(5)).unwrap(),
            vec![Bytes::from_static(&[0x20, 0x01, 0x05, 0x00, 0x26])]
        );
        assert_eq!(codec.poll(30), Some(Bytes::from_static(&[0x20, 0x01, 24, 0x00, 0x39])));
        assert_eq!(codec.clamp_resistance(-3), Some(0));
        assert!(codec.poll_carries_resistance());
    }

    #[test]
    fn test_init_sequence() {
        let codec = SportsPlusCodec::new();
        assert_eq!(
            codec.init_sequence(),
            vec![Bytes::from_static(&[0x40, 0x00, 0x16, 0x0A, 0x60])]
        );
        assert_eq!(codec.ack_mode(), AckMode::WaitForResponse);
    }
}
