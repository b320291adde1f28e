//! Control channel: pending control requests and acknowledged writes.
//!
//! Requests coming from the local surface, the virtual peripheral bridge or a
//! workout feed only fill slots here. The session drains the slots once per
//! ready tick through [`ControlChannel::service`], so every write to the
//! device happens from the session's own flow.

use bytes::Bytes;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    protocol::{Codec, Command},
    transport::{AckSlot, Channel, Transport},
    types::{AckMode, SessionSignal, WriteOutcome},
};

/// Pending control requests for one device session
#[derive(Debug)]
pub struct ControlChannel {
    acks: AckSlot,
    ack_timeout: Duration,
    pending_resistance: Option<i16>,
    pending_speed: Option<f64>,
    pending_inclination: Option<f64>,
    start_requested: bool,
    stop_requested: bool,
    last_applied_resistance: Option<i16>,
    paced: VecDeque<Bytes>,
}

impl ControlChannel {
    /// Create a control channel waiting on `acks` for at most `ack_timeout`
    #[must_use]
    pub const fn new(acks: AckSlot, ack_timeout: Duration) -> Self {
        Self {
            acks,
            ack_timeout,
            pending_resistance: None,
            pending_speed: None,
            pending_inclination: None,
            start_requested: false,
            stop_requested: false,
            last_applied_resistance: None,
            paced: VecDeque::new(),
        }
    }

    /// Request a resistance level; a newer request replaces an unconsumed one
    pub fn set_resistance(&mut self, target: i16) {
        self.pending_resistance = Some(target);
    }

    /// Request a belt speed in km/h
    pub fn set_speed(&mut self, speed: f64) {
        self.pending_speed = Some(speed);
    }

    /// Request an inclination in percent
    pub fn set_inclination(&mut self, inclination: f64) {
        self.pending_inclination = Some(inclination);
    }

    /// Request a workout start
    pub fn start(&mut self) {
        self.start_requested = true;
    }

    /// Request a workout stop
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Resistance request not yet consumed by a tick
    #[must_use]
    pub const fn pending_resistance(&self) -> Option<i16> {
        self.pending_resistance
    }

    /// Speed request not yet consumed by a tick
    #[must_use]
    pub const fn pending_speed(&self) -> Option<f64> {
        self.pending_speed
    }

    /// Inclination request not yet consumed by a tick
    #[must_use]
    pub const fn pending_inclination(&self) -> Option<f64> {
        self.pending_inclination
    }

    /// Last resistance level written to the device
    #[must_use]
    pub const fn last_applied_resistance(&self) -> Option<i16> {
        self.last_applied_resistance
    }

    /// Frames of a multi-frame command still waiting for a tick
    #[must_use]
    pub fn paced_len(&self) -> usize {
        self.paced.len()
    }

    /// Consume the pending resistance request.
    ///
    /// Returns the clamped level if it differs from the last applied one.
    fn take_resistance(&mut self, codec: &dyn Codec) -> Option<i16> {
        let target = self.pending_resistance.take()?;
        let Some(level) = codec.clamp_resistance(target) else {
            debug!("{} has no resistance control, dropping target {}", codec.family(), target);
            return None;
        };
        (self.last_applied_resistance != Some(level)).then_some(level)
    }

    /// Abandon any outstanding acknowledgement wait and queued frames
    pub fn abandon(&mut self) {
        self.acks.cancel();
        self.paced.clear();
    }

    /// Write `data` and, unless `mode` is fire-and-forget, wait for the
    /// matching acknowledgement or the ack deadline, whichever comes first.
    ///
    /// A timeout is not an error: the write is best-effort and the next tick
    /// re-evaluates the target.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the write itself was rejected.
    pub async fn write_and_maybe_wait(
        &self,
        transport: &mut dyn Transport,
        channel: &Channel,
        data: &[u8],
        mode: AckMode,
    ) -> Result<WriteOutcome> {
        let waiter = match mode {
            AckMode::FireAndForget => None,
            AckMode::WaitForWrite | AckMode::WaitForResponse => Some(self.acks.arm(mode)),
        };

        if let Err(e) = transport.write(channel, data, mode).await {
            self.acks.cancel();
            return Err(e);
        }

        let Some(waiter) = waiter else {
            return Ok(WriteOutcome::Sent);
        };

        match tokio::time::timeout(self.ack_timeout, waiter).await {
            Ok(Ok(())) => Ok(WriteOutcome::Acknowledged),
            Ok(Err(_)) => Ok(WriteOutcome::Abandoned),
            Err(_) => {
                self.acks.cancel();
                warn!(
                    "No acknowledgement on {} within {:?}, continuing",
                    channel.id, self.ack_timeout
                );
                Ok(WriteOutcome::TimedOut)
            }
        }
    }

    async fn write_logged(
        &self,
        transport: &mut dyn Transport,
        channel: &Channel,
        data: &[u8],
        mode: AckMode,
    ) -> bool {
        match self.write_and_maybe_wait(transport, channel, data, mode).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Control write to {} failed: {}", channel.id, e);
                false
            }
        }
    }

    /// Drain the pending slots for one ready tick and return the signals to
    /// emit, in order.
    ///
    /// The tick writes, in order: a changed resistance target, the family's
    /// poll frame, speed and inclination targets, one queued frame of an
    /// earlier paced command, then any new start or stop command.
    pub async fn service(
        &mut self,
        transport: &mut dyn Transport,
        codec: &dyn Codec,
        channel: &Channel,
    ) -> Vec<SessionSignal> {
        let mode = codec.ack_mode();
        let mut signals = Vec::new();

        let resistance = self.take_resistance(codec);
        if let Some(level) = resistance {
            match codec.encode(&Command::SetResistance(level)) {
                Ok(frames) => {
                    for frame in &frames {
                        self.write_logged(transport, channel, frame, mode).await;
                    }
                    info!("Resistance set to {}", level);
                    self.last_applied_resistance = Some(level);
                    signals.push(SessionSignal::ResistanceApplied(level));
                }
                Err(e) => warn!("Dropping resistance target: {}", e),
            }
        }

        if !(resistance.is_some() && codec.poll_carries_resistance()) {
            if let Some(poll) = codec.poll(self.last_applied_resistance.unwrap_or(0)) {
                self.write_logged(transport, channel, &poll, mode).await;
            }
        }

        if let Some(speed) = self.pending_speed.take() {
            if self.send(transport, codec, channel, Command::SetSpeed(speed)).await {
                signals.push(SessionSignal::SpeedApplied(speed));
            }
        }

        if let Some(inclination) = self.pending_inclination.take() {
            if self
                .send(transport, codec, channel, Command::SetInclination(inclination))
                .await
            {
                signals.push(SessionSignal::InclinationApplied(inclination));
            }
        }

        if let Some(frame) = self.paced.pop_front() {
            self.write_logged(transport, channel, &frame, mode).await;
        }

        if std::mem::take(&mut self.start_requested) {
            info!("Starting workout");
            self.send(transport, codec, channel, Command::Start).await;
            signals.push(SessionSignal::Started);
        }

        if std::mem::take(&mut self.stop_requested) {
            info!("Stopping workout");
            self.send(transport, codec, channel, Command::Stop).await;
            signals.push(SessionSignal::Stopped);
        }

        signals
    }

    /// Encode and write a command. Paced codecs write the first frame now and
    /// queue the rest, one per tick.
    async fn send(
        &mut self,
        transport: &mut dyn Transport,
        codec: &dyn Codec,
        channel: &Channel,
        command: Command,
    ) -> bool {
        let frames = match codec.encode(&command) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Dropping {} request: {}", command, e);
                return false;
            }
        };

        let mode = codec.ack_mode();
        let mut frames = frames.into_iter();
        if codec.paces_commands() {
            if let Some(first) = frames.next() {
                self.write_logged(transport, channel, &first, mode).await;
            }
            self.paced.extend(frames);
            true
        } else {
            let mut written = true;
            for frame in frames {
                written &= self.write_logged(transport, channel, &frame, mode).await;
            }
            written
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{bike, rower, treadmill, Concept2Codec, SportsPlusCodec, ToorxCodec},
        transport::{
            fake::{FakeHandle, FakeTransport},
            ChannelProperties, EventSink, TransportEvent,
        },
    };
    use tokio::time::Instant;
    use uuid::Uuid;

    fn channel(id: Uuid) -> Channel {
        Channel {
            id,
            service: Uuid::nil(),
            properties: ChannelProperties {
                write: true,
                notify: true,
                ..Default::default()
            },
        }
    }

    fn setup() -> (
        ControlChannel,
        FakeTransport,
        FakeHandle,
        tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (mut transport, handle) = FakeTransport::new(Vec::new());
        let (sink, events) = EventSink::new();
        let control = ControlChannel::new(sink.acks().clone(), Duration::from_millis(300));
        transport.attach(sink);
        (control, transport, handle, events)
    }

    #[tokio::test]
    async fn test_stable_resistance_written_once() {
        let (mut control, mut transport, handle, _events) = setup();
        let codec = Concept2Codec::new();
        let control_point = channel(rower::CONTROL_POINT_UUID);
        transport.auto_ack_writes = true;

        control.set_resistance(5);
        control.set_resistance(5);
        let first = control.service(&mut transport, &codec, &control_point).await;

        control.set_resistance(5);
        let second = control.service(&mut transport, &codec, &control_point).await;

        assert_eq!(first, vec![SessionSignal::ResistanceApplied(5)]);
        assert!(second.is_empty());
        assert_eq!(handle.writes_to(rower::CONTROL_POINT_UUID).len(), 1);
        assert_eq!(control.last_applied_resistance(), Some(5));
    }

    #[tokio::test]
    async fn test_resistance_compared_after_clamp() {
        let (mut control, mut transport, handle, _events) = setup();
        let codec = Concept2Codec::new();
        let control_point = channel(rower::CONTROL_POINT_UUID);
        transport.auto_ack_writes = true;

        control.set_resistance(100);
        control.service(&mut transport, &codec, &control_point).await;
        control.set_resistance(250);
        let signals = control.service(&mut transport, &codec, &control_point).await;

        assert!(signals.is_empty());
        assert_eq!(handle.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bike_poll_carries_resistance() {
        let (mut control, mut transport, handle, _events) = setup();
        let codec = SportsPlusCodec::new();
        let data = channel(bike::DATA_UUID);

        control.set_resistance(3);
        control.service(&mut transport, &codec, &data).await;
        control.service(&mut transport, &codec, &data).await;

        assert_eq!(
            handle.writes_to(bike::DATA_UUID),
            vec![vec![0x20, 0x01, 0x03, 0x00, 0x24], vec![0x20, 0x01, 0x03, 0x00, 0x24]]
        );
    }

    #[tokio::test]
    async fn test_start_stop_consumed_once() {
        let (mut control, mut transport, _handle, _events) = setup();
        let codec = Concept2Codec::new();
        let control_point = channel(rower::CONTROL_POINT_UUID);

        control.start();
        control.stop();
        let first = control.service(&mut transport, &codec, &control_point).await;
        let second = control.service(&mut transport, &codec, &control_point).await;

        assert_eq!(first, vec![SessionSignal::Started, SessionSignal::Stopped]);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_paced_start_one_frame_per_tick() {
        let (mut control, mut transport, handle, _events) = setup();
        let codec = ToorxCodec::new();
        let stream = channel(treadmill::SERIAL_PORT_UUID);
        let poll = vec![0x55, 0x17, 0x01, 0x01];

        control.start();
        control.service(&mut transport, &codec, &stream).await;
        assert_eq!(control.paced_len(), 5);
        assert_eq!(
            handle.writes_to(treadmill::SERIAL_PORT_UUID),
            vec![poll.clone(), vec![0x55, 0x0A, 0x01, 0x02]]
        );

        for _ in 0..5 {
            control.service(&mut transport, &codec, &stream).await;
        }
        assert_eq!(control.paced_len(), 0);

        let writes = handle.writes_to(treadmill::SERIAL_PORT_UUID);
        let non_poll: Vec<_> = writes.into_iter().filter(|w| *w != poll).collect();
        assert_eq!(non_poll.len(), 6);
        assert_eq!(non_poll[5], vec![0x55, 0x08, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn test_unsupported_command_not_signalled() {
        let (mut control, mut transport, handle, _events) = setup();
        let codec = Concept2Codec::new();
        let control_point = channel(rower::CONTROL_POINT_UUID);

        control.set_speed(12.0);
        let signals = control.service(&mut transport, &codec, &control_point).await;

        assert!(signals.is_empty());
        assert!(handle.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_write_completes_before_deadline() {
        let (control, mut transport, _handle, _events) = setup();
        let control_point = channel(rower::CONTROL_POINT_UUID);
        transport.auto_ack_writes = true;

        let started = Instant::now();
        let outcome = control
            .write_and_maybe_wait(&mut transport, &control_point, &[0x11], AckMode::WaitForWrite)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Acknowledged);
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_write_waits_for_deadline() {
        let (control, mut transport, _handle, _events) = setup();
        let control_point = channel(rower::CONTROL_POINT_UUID);

        let started = Instant::now();
        let outcome = control
            .write_and_maybe_wait(&mut transport, &control_point, &[0x11], AckMode::WaitForWrite)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_ack_from_later_frame() {
        let (control, mut transport, handle, _events) = setup();
        let data = channel(bike::DATA_UUID);

        let device = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            device.emit(TransportEvent::Frame(crate::protocol::Frame::new(
                bike::DATA_UUID,
                Bytes::from_static(&[0u8; 12]),
            )));
        });

        let started = Instant::now();
        let outcome = control
            .write_and_maybe_wait(&mut transport, &data, &[0x20], AckMode::WaitForResponse)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Acknowledged);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_immediately() {
        let (control, mut transport, handle, _events) = setup();
        let stream = channel(treadmill::SERIAL_PORT_UUID);

        let outcome = control
            .write_and_maybe_wait(&mut transport, &stream, &[0x55], AckMode::FireAndForget)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Sent);
        assert_eq!(handle.writes().len(), 1);
    }
}
