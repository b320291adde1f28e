use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::{
    error::{DeviceError, Result},
    protocol::{treadmill::SERIAL_PORT_UUID, Frame},
    transport::{Channel, ChannelProperties, EventSink, ServiceInfo, Transport, TransportEvent},
    types::{AckMode, DeviceIdentity, TimeoutConfig},
};

/// Largest chunk read from the stream at once
const READ_BUFFER_LEN: usize = 256;

/// Line rate requested on open. RFCOMM ignores it but the tty needs one.
const BAUD_RATE: u32 = 115_200;

/// Record lengths the console sends: the status record and the handshake
const RECORD_LENGTHS: [usize; 2] = [17, 13];

/// Quiet time after which a buffered partial record is flushed
const SETTLE_GAP: Duration = Duration::from_millis(50);

/// Reading half of an opened stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Writing half of an opened stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the byte stream behind a serial device
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Open a stream to `identity`
    async fn open(&self, identity: &DeviceIdentity) -> Result<(BoxedReader, BoxedWriter)>;
}

/// Opens a bound RFCOMM device node, with the node path as the identity's
/// address (for example `/dev/rfcomm0`)
///
/// The node is a tty. It is opened in raw mode so carriage returns, control
/// characters and flow control bytes in binary records pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RfcommDevice;

#[async_trait]
impl StreamOpener for RfcommDevice {
    async fn open(&self, identity: &DeviceIdentity) -> Result<(BoxedReader, BoxedWriter)> {
        let port = tokio_serial::new(&identity.address, BAUD_RATE)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        debug!("Opened {} at {} baud", identity.address, BAUD_RATE);
        let (reader, writer) = tokio::io::split(port);
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Cuts the byte stream back into console records
///
/// Reads can split a record or carry several. Bytes are buffered and the
/// longest record length is cut off as soon as it is available. Whatever is
/// left when the stream goes quiet is emitted if it has a known record length
/// and dropped otherwise, which also realigns the stream after noise.
#[derive(Debug)]
struct FrameAssembler {
    lengths: &'static [usize],
    longest: usize,
    pending: BytesMut,
}

impl FrameAssembler {
    fn new(lengths: &'static [usize]) -> Self {
        Self {
            lengths,
            longest: lengths.iter().copied().max().unwrap_or(READ_BUFFER_LEN),
            pending: BytesMut::with_capacity(READ_BUFFER_LEN),
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut records = Vec::new();
        while self.pending.len() >= self.longest {
            records.push(self.pending.split_to(self.longest).freeze());
        }
        records
    }

    fn flush(&mut self) -> Option<Bytes> {
        let rest = self.pending.split().freeze();
        if self.lengths.contains(&rest.len()) {
            Some(rest)
        } else {
            if !rest.is_empty() {
                debug!("Dropping {} unframed bytes: {:02x?}", rest.len(), &rest[..]);
            }
            None
        }
    }
}

/// Transport over a serial port profile byte stream
///
/// The stream is presented as a single service with a single channel, both
/// identified by the serial port profile UUID. Subscribing is a no-op that is
/// acknowledged immediately.
pub struct SerialTransport<O = RfcommDevice> {
    opener: O,
    timeouts: TimeoutConfig,
    sink: Option<EventSink>,
    writer: Mutex<Option<BoxedWriter>>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl<O> std::fmt::Debug for SerialTransport<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("timeouts", &self.timeouts)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SerialTransport<RfcommDevice> {
    /// Transport over RFCOMM device nodes
    #[must_use]
    pub fn rfcomm(timeouts: TimeoutConfig) -> Self {
        Self::new(RfcommDevice, timeouts)
    }
}

impl<O: StreamOpener> SerialTransport<O> {
    /// Create a transport that opens its stream with `opener`
    #[must_use]
    pub fn new(opener: O, timeouts: TimeoutConfig) -> Self {
        Self {
            opener,
            timeouts,
            sink: None,
            writer: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    fn sink(&self) -> Result<&EventSink> {
        self.sink.as_ref().ok_or_else(|| DeviceError::NotReady {
            reason: "transport not attached to a session".to_string(),
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::Disconnected)
        }
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl<O> Drop for SerialTransport<O> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn emit_record(sink: &EventSink, record: Bytes) -> bool {
    sink.emit(TransportEvent::Frame(Frame::new(SERIAL_PORT_UUID, record)))
}

async fn pump(mut reader: BoxedReader, sink: EventSink, connected: Arc<AtomicBool>) {
    let mut buffer = [0u8; READ_BUFFER_LEN];
    let mut assembler = FrameAssembler::new(&RECORD_LENGTHS);
    loop {
        let read = if assembler.is_empty() {
            reader.read(&mut buffer).await
        } else {
            match timeout(SETTLE_GAP, reader.read(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    if let Some(record) = assembler.flush() {
                        if !emit_record(&sink, record) {
                            return;
                        }
                    }
                    continue;
                }
            }
        };

        match read {
            Ok(0) => {
                info!("Serial stream closed by the device");
                break;
            }
            Ok(n) => {
                for record in assembler.push(&buffer[..n]) {
                    if !emit_record(&sink, record) {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                sink.emit(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    sink.emit(TransportEvent::Disconnected);
}

#[async_trait]
impl<O: StreamOpener> Transport for SerialTransport<O> {
    fn attach(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    async fn connect(&mut self, identity: &DeviceIdentity) -> Result<()> {
        self.stop_reader();
        let sink = self.sink()?.clone();

        let timeout_ms = self.timeouts.connect_timeout_ms;
        let (reader, writer) = timeout(Duration::from_millis(timeout_ms), self.opener.open(identity))
            .await
            .map_err(|_| DeviceError::Timeout { timeout_ms })?
            .map_err(|e| DeviceError::ConnectionFailed(format!("{identity}: {e}")))?;

        *self.writer.get_mut() = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        self.reader = Some(tokio::spawn(pump(reader, sink.clone(), self.connected.clone())));

        info!("Serial stream to {} open", identity);
        sink.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<Vec<ServiceInfo>> {
        self.ensure_connected()?;
        Ok(vec![ServiceInfo { id: SERIAL_PORT_UUID }])
    }

    async fn discover_channels(&mut self, service: &ServiceInfo) -> Result<Vec<Channel>> {
        self.ensure_connected()?;
        if service.id != SERIAL_PORT_UUID {
            return Ok(Vec::new());
        }
        Ok(vec![Channel {
            id: SERIAL_PORT_UUID,
            service: SERIAL_PORT_UUID,
            properties: ChannelProperties {
                notify: true,
                write: true,
                write_without_response: true,
                ..Default::default()
            },
        }])
    }

    async fn subscribe(&mut self, channel: &Channel) -> Result<()> {
        self.ensure_connected()?;
        self.sink()?
            .emit(TransportEvent::SubscriptionAcknowledged(channel.id));
        Ok(())
    }

    async fn write(&mut self, channel: &Channel, data: &[u8], mode: AckMode) -> Result<()> {
        self.ensure_connected()?;
        let writer = self.writer.get_mut().as_mut().ok_or(DeviceError::Disconnected)?;

        debug!(">> {:02x?}", data);
        writer.write_all(data).await?;
        writer.flush().await?;

        if mode == AckMode::WaitForWrite {
            self.sink()?
                .emit(TransportEvent::CharacteristicWritten(channel.id));
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_reader();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.get_mut().take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}
