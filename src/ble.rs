use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{DeviceError, Result},
    protocol::Frame,
    transport::{Channel, ChannelProperties, EventSink, ServiceInfo, Transport, TransportEvent},
    types::{AckMode, DeviceFamily, DeviceIdentity, LinkKind, TimeoutConfig},
};

/// Interval between peripheral list checks while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// GATT transport backed by the first Bluetooth adapter
pub struct BtleTransport {
    adapter: Adapter,
    timeouts: TimeoutConfig,
    sink: Option<EventSink>,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<Uuid, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BtleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleTransport")
            .field("timeouts", &self.timeouts)
            .field("connected_to", &self.peripheral.as_ref().map(|p| p.address()))
            .field("characteristics", &self.characteristics.len())
            .finish_non_exhaustive()
    }
}

impl BtleTransport {
    /// Create a transport on the first available adapter
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Ble`] if the Bluetooth stack cannot be opened,
    /// or [`DeviceError::DeviceNotFound`] if there is no adapter.
    pub async fn new(timeouts: TimeoutConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::DeviceNotFound("no Bluetooth adapter".to_string()))?;

        Ok(Self {
            adapter,
            timeouts,
            sink: None,
            peripheral: None,
            characteristics: HashMap::new(),
            tasks: Vec::new(),
        })
    }

    /// Scan for supported GATT devices
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Ble`] if the scan cannot be started.
    pub async fn scan(&self) -> Result<Vec<DeviceIdentity>> {
        info!("Scanning for fitness devices...");
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(self.timeouts.scan_timeout_ms)).await;
        self.adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = properties.local_name else {
                continue;
            };
            let Some(family) = DeviceFamily::from_name(&name) else {
                continue;
            };
            if family.link() != LinkKind::Gatt {
                continue;
            }

            let identity = DeviceIdentity::new(name, properties.address.to_string(), family);
            info!("Found {}", identity);
            devices.push(identity);
        }

        info!("Scan completed. Found {} device(s)", devices.len());
        Ok(devices)
    }

    async fn find_peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        if let Some(peripheral) = &self.peripheral {
            if self.is_match(peripheral, identity).await {
                return Ok(peripheral.clone());
            }
        }

        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = timeout(Duration::from_millis(self.timeouts.scan_timeout_ms), async {
            loop {
                for peripheral in self.adapter.peripherals().await? {
                    if self.is_match(&peripheral, identity).await {
                        return Ok::<_, DeviceError>(peripheral);
                    }
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;
        self.adapter.stop_scan().await?;

        found.map_err(|_| DeviceError::DeviceNotFound(identity.to_string()))?
    }

    async fn is_match(&self, peripheral: &Peripheral, identity: &DeviceIdentity) -> bool {
        let Ok(Some(properties)) = peripheral.properties().await else {
            return false;
        };
        matches_identity(
            &properties.address.to_string(),
            properties.local_name.as_deref(),
            identity,
        )
    }

    fn sink(&self) -> Result<&EventSink> {
        self.sink.as_ref().ok_or_else(|| DeviceError::NotReady {
            reason: "transport not attached to a session".to_string(),
        })
    }

    fn peripheral(&self) -> Result<&Peripheral> {
        self.peripheral.as_ref().ok_or(DeviceError::Disconnected)
    }

    fn characteristic(&self, channel: &Channel) -> Result<&Characteristic> {
        self.characteristics
            .get(&channel.id)
            .ok_or_else(|| DeviceError::Protocol(format!("characteristic {} not discovered", channel.id)))
    }

    async fn spawn_pumps(&mut self, peripheral: &Peripheral) -> Result<()> {
        let sink = self.sink()?.clone();

        let mut notifications = peripheral.notifications().await?;
        let frames = sink.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let frame = Frame::new(notification.uuid, Bytes::from(notification.value));
                if !frames.emit(TransportEvent::Frame(frame)) {
                    break;
                }
            }
            debug!("Notification stream ended");
        }));

        let mut events = self.adapter.events().await?;
        let id = peripheral.id();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(lost) if *lost == id) {
                    info!("Peripheral {:?} disconnected", id);
                    if !sink.emit(TransportEvent::Disconnected) {
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[async_trait]
impl Transport for BtleTransport {
    fn attach(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    async fn connect(&mut self, identity: &DeviceIdentity) -> Result<()> {
        self.abort_tasks();
        self.characteristics.clear();

        let peripheral = self.find_peripheral(identity).await?;
        let connect_timeout_ms = self.timeouts.connect_timeout_ms;
        timeout(Duration::from_millis(connect_timeout_ms), peripheral.connect())
            .await
            .map_err(|_| DeviceError::Timeout {
                timeout_ms: connect_timeout_ms,
            })?
            .map_err(|e| DeviceError::ConnectionFailed(e.to_string()))?;

        self.spawn_pumps(&peripheral).await?;
        self.peripheral = Some(peripheral);

        info!("Link to {} established", identity);
        self.sink()?.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<Vec<ServiceInfo>> {
        let peripheral = self.peripheral()?.clone();
        peripheral.discover_services().await?;

        let services = peripheral.services();
        self.characteristics = services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .map(|characteristic| (characteristic.uuid, characteristic.clone()))
            .collect();

        Ok(services.iter().map(|service| ServiceInfo { id: service.uuid }).collect())
    }

    async fn discover_channels(&mut self, service: &ServiceInfo) -> Result<Vec<Channel>> {
        let services = self.peripheral()?.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service.id)
            .ok_or_else(|| DeviceError::Protocol(format!("service {} not found", service.id)))?;

        Ok(service
            .characteristics
            .iter()
            .map(|characteristic| Channel {
                id: characteristic.uuid,
                service: service.uuid,
                properties: channel_properties(characteristic.properties),
            })
            .collect())
    }

    async fn subscribe(&mut self, channel: &Channel) -> Result<()> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral()?.subscribe(characteristic).await?;
        self.sink()?
            .emit(TransportEvent::SubscriptionAcknowledged(channel.id));
        Ok(())
    }

    async fn write(&mut self, channel: &Channel, data: &[u8], mode: AckMode) -> Result<()> {
        let characteristic = self.characteristic(channel)?;
        let write_type = write_type(mode, channel.properties);
        debug!(">> {} {:02x?}", channel.id, data);

        self.peripheral()?
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| DeviceError::Protocol(format!("write to {} failed: {e}", channel.id)))?;

        if matches!(write_type, WriteType::WithResponse) {
            self.sink()?
                .emit(TransportEvent::CharacteristicWritten(channel.id));
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match &self.peripheral {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.abort_tasks();
        if let Some(peripheral) = &self.peripheral {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn channel_properties(flags: CharPropFlags) -> ChannelProperties {
    ChannelProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// Writes that wait for a write confirmation, or target a channel without
/// unacknowledged writes, go out with response
fn write_type(mode: AckMode, properties: ChannelProperties) -> WriteType {
    if mode == AckMode::WaitForWrite || !properties.write_without_response {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

/// An identity with an address matches by address only; otherwise by name
fn matches_identity(address: &str, name: Option<&str>, identity: &DeviceIdentity) -> bool {
    if identity.address.is_empty() {
        name == Some(identity.name.as_str())
    } else {
        address.eq_ignore_ascii_case(&identity.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_mapping() {
        let control = channel_properties(CharPropFlags::WRITE | CharPropFlags::INDICATE);
        assert!(control.write);
        assert!(control.indicate);
        assert!(!control.notify);
        assert!(control.subscribable());

        let data = channel_properties(
            CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::READ,
        );
        assert!(data.read);
        assert!(data.writable());
        assert!(!data.write);
    }

    #[test]
    fn test_write_type() {
        let both = ChannelProperties {
            write: true,
            write_without_response: true,
            ..Default::default()
        };
        assert!(matches!(write_type(AckMode::WaitForWrite, both), WriteType::WithResponse));
        assert!(matches!(
            write_type(AckMode::WaitForResponse, both),
            WriteType::WithoutResponse
        ));
        assert!(matches!(
            write_type(AckMode::FireAndForget, both),
            WriteType::WithoutResponse
        ));

        let acked_only = ChannelProperties {
            write: true,
            ..Default::default()
        };
        assert!(matches!(
            write_type(AckMode::FireAndForget, acked_only),
            WriteType::WithResponse
        ));
    }

    #[test]
    fn test_identity_matching() {
        let by_address = DeviceIdentity::new("PM5 430000000", "C4:7A:11:22:33:44", DeviceFamily::Concept2Rower);
        assert!(matches_identity("c4:7a:11:22:33:44", None, &by_address));
        assert!(!matches_identity("C4:7A:11:22:33:45", Some("PM5 430000000"), &by_address));

        let by_name = DeviceIdentity::new("PM5 430000000", "", DeviceFamily::Concept2Rower);
        assert!(matches_identity("00:00:00:00:00:00", Some("PM5 430000000"), &by_name));
        assert!(!matches_identity("00:00:00:00:00:00", None, &by_name));
    }
}
