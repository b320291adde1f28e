//! Transport capability consumed by device sessions.
//!
//! A transport is either a GATT peripheral ([`crate::ble::BtleTransport`]) or a
//! serial byte stream ([`crate::serial::SerialTransport`]). Request methods
//! return `Result`s, while link state changes, inbound frames and
//! acknowledgements are pushed as [`TransportEvent`]s through an [`EventSink`].
//! The sink completes a pending acknowledgement wait the moment a matching
//! event is emitted. The session consuming the events may be busy at that
//! point (for example inside that very wait).

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    error::Result,
    protocol::Frame,
    types::{AckMode, DeviceIdentity},
};

/// Capabilities of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ChannelProperties {
    /// Readable
    pub read: bool,
    /// Writable with response
    pub write: bool,
    /// Writable without response
    pub write_without_response: bool,
    /// Sends notifications
    pub notify: bool,
    /// Sends indications
    pub indicate: bool,
}

impl ChannelProperties {
    /// Channel needs a subscription before it delivers data
    #[must_use]
    pub const fn subscribable(&self) -> bool {
        self.notify || self.indicate
    }

    /// Channel accepts writes of either kind
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// An addressable endpoint: a GATT characteristic or a serial stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Channel identity
    pub id: Uuid,
    /// Owning service
    pub service: Uuid,
    /// What the channel can do
    pub properties: ChannelProperties,
}

/// A discovered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service identity
    pub id: Uuid,
}

/// Events pushed by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link established
    Connected,
    /// Link lost
    Disconnected,
    /// A notify/indicate subscription was confirmed
    SubscriptionAcknowledged(Uuid),
    /// A write to the channel was confirmed
    CharacteristicWritten(Uuid),
    /// Inbound data
    Frame(Frame),
    /// Transport-level error; informational only
    Error(String),
}

struct PendingAck {
    mode: AckMode,
    done: oneshot::Sender<()>,
}

/// Single-shot acknowledgement slot shared between a session and its transport
#[derive(Clone, Default)]
pub struct AckSlot {
    pending: Arc<Mutex<Option<PendingAck>>>,
}

impl std::fmt::Debug for AckSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckSlot")
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl AckSlot {
    /// Arm the slot for `mode`; any previous wait is abandoned
    #[must_use]
    pub fn arm(&self, mode: AckMode) -> oneshot::Receiver<()> {
        let (done, receiver) = oneshot::channel();
        *self.lock() = Some(PendingAck { mode, done });
        receiver
    }

    /// Complete the pending wait if `event` is the acknowledgement it expects
    pub fn observe(&self, event: &TransportEvent) {
        let mut pending = self.lock();
        let matches = pending.as_ref().is_some_and(|ack| {
            matches!(
                (ack.mode, event),
                (AckMode::WaitForWrite, TransportEvent::CharacteristicWritten(_))
                    | (AckMode::WaitForResponse, TransportEvent::Frame(_))
            )
        });

        if matches {
            if let Some(ack) = pending.take() {
                let _ = ack.done.send(());
            }
        }
    }

    /// Drop the pending wait; the waiter sees it as abandoned
    pub fn cancel(&self) {
        self.lock().take();
    }

    /// Whether a wait is outstanding
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingAck>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sending half of a session's event queue
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<TransportEvent>,
    acks: AckSlot,
}

impl EventSink {
    /// Create a sink and the receiver the session drains
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                acks: AckSlot::default(),
            },
            receiver,
        )
    }

    /// Push an event; returns `false` once the session is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.acks.observe(&event);
        self.sender.send(event).is_ok()
    }

    /// Acknowledgement slot fed by this sink
    #[must_use]
    pub const fn acks(&self) -> &AckSlot {
        &self.acks
    }
}

/// Transport capability used by a device session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand the transport the sink it pushes events into
    fn attach(&mut self, sink: EventSink);

    /// Start connecting; success is reported as [`TransportEvent::Connected`]
    async fn connect(&mut self, identity: &DeviceIdentity) -> Result<()>;

    /// Enumerate services on the connected device
    async fn discover_services(&mut self) -> Result<Vec<ServiceInfo>>;

    /// Enumerate channels of one service
    async fn discover_channels(&mut self, service: &ServiceInfo) -> Result<Vec<Channel>>;

    /// Request notifications or indications; confirmation is reported as
    /// [`TransportEvent::SubscriptionAcknowledged`]
    async fn subscribe(&mut self, channel: &Channel) -> Result<()>;

    /// Write bytes to a channel
    async fn write(&mut self, channel: &Channel, data: &[u8], mode: AckMode) -> Result<()>;

    /// Whether the link is currently up
    async fn is_connected(&self) -> bool;

    /// Drop the link
    async fn disconnect(&mut self) -> Result<()>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame() -> TransportEvent {
        TransportEvent::Frame(Frame::new(Uuid::nil(), Bytes::from_static(&[1, 2, 3])))
    }

    #[tokio::test]
    async fn test_sink_forwards_events_in_order() {
        let (sink, mut events) = EventSink::new();
        assert!(sink.emit(TransportEvent::Connected));
        assert!(sink.emit(frame()));

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(events.recv().await, Some(frame()));
    }

    #[tokio::test]
    async fn test_response_ack_completes_on_frame() {
        let (sink, _events) = EventSink::new();
        let waiter = sink.acks().arm(AckMode::WaitForResponse);

        sink.emit(TransportEvent::CharacteristicWritten(Uuid::nil()));
        assert!(sink.acks().is_armed());

        sink.emit(frame());
        assert!(!sink.acks().is_armed());
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_write_ack_ignores_frames() {
        let (sink, _events) = EventSink::new();
        let waiter = sink.acks().arm(AckMode::WaitForWrite);

        sink.emit(frame());
        assert!(sink.acks().is_armed());

        sink.emit(TransportEvent::CharacteristicWritten(Uuid::nil()));
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_abandons_waiter() {
        let (sink, _events) = EventSink::new();
        let waiter = sink.acks().arm(AckMode::WaitForResponse);
        sink.acks().cancel();
        assert!(waiter.await.is_err());
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, events) = EventSink::new();
        drop(events);
        assert!(!sink.emit(TransportEvent::Disconnected));
    }

    #[test]
    fn test_channel_properties() {
        let notify = ChannelProperties {
            notify: true,
            ..Default::default()
        };
        assert!(notify.subscribable());
        assert!(!notify.writable());

        let control = ChannelProperties {
            write: true,
            indicate: true,
            ..Default::default()
        };
        assert!(control.subscribable());
        assert!(control.writable());
    }
}
