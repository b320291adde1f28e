//! Virtual peripheral bridge.
//!
//! Once a session first becomes ready it may create a bridge that re-publishes
//! its telemetry to another consumer (a virtual bike or treadmill advertised
//! to a training app) and feeds that consumer's control requests back into
//! the session. The outward protocol is up to the [`VirtualPeripheral`]
//! implementation; the session only hands it [`MetricsSnapshot`]s.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::{
    error::Result,
    metrics::{MetricKind, MetricsSnapshot},
    types::DeviceIdentity,
    workout::WorkoutRow,
};

/// Requests a session accepts from the bridge, a workout feed or the local
/// control surface
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Target resistance level
    SetResistance(i16),
    /// Target belt speed in km/h
    SetSpeed(f64),
    /// Target inclination in percent
    SetInclination(f64),
    /// Start the workout
    Start,
    /// Stop the workout
    Stop,
    /// Apply the targets of a workout row
    ApplyRow(WorkoutRow),
    /// A reading from an external sensor (heart rate belt, cadence sensor,
    /// power meter); used only while the matching override is configured
    ExternalSample(MetricKind, f64),
}

/// Sink that re-encodes canonical metrics into an outward protocol
pub trait VirtualPeripheral: Send {
    /// Publish the latest telemetry
    fn publish(&mut self, snapshot: &MetricsSnapshot);

    /// Stop advertising and release resources
    fn shutdown(&mut self);
}

/// Creates the bridge for a session
pub trait BridgeFactory: Send {
    /// Build a bridge; `requests` feeds control requests back to the session
    ///
    /// # Errors
    ///
    /// Returns an error if the outward peripheral cannot be brought up.
    fn create(
        &mut self,
        identity: &DeviceIdentity,
        requests: mpsc::UnboundedSender<ControlRequest>,
    ) -> Result<Box<dyn VirtualPeripheral>>;
}

/// Bridge that publishes into a watch channel
///
/// Useful on its own for in-process consumers, and as the model for
/// peripheral implementations that own a radio.
#[derive(Debug)]
pub struct WatchBridge {
    snapshots: watch::Sender<MetricsSnapshot>,
    instance: usize,
}

impl VirtualPeripheral for WatchBridge {
    fn publish(&mut self, snapshot: &MetricsSnapshot) {
        self.snapshots.send_replace(*snapshot);
    }

    fn shutdown(&mut self) {
        info!("Shutting down virtual peripheral #{}", self.instance);
    }
}

/// Factory for [`WatchBridge`]s that share one published snapshot and one
/// request sender the consumer can use
#[derive(Debug, Clone)]
pub struct WatchBridgeFactory {
    snapshots: watch::Sender<MetricsSnapshot>,
    requests: Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<ControlRequest>>>>,
    created: Arc<AtomicUsize>,
}

impl Default for WatchBridgeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchBridgeFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(MetricsSnapshot::default());
        Self {
            snapshots,
            requests: Arc::default(),
            created: Arc::default(),
        }
    }

    /// Observe what the bridge publishes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Send a request as the bridge's consumer would; `false` until a bridge
    /// exists or after its session is gone
    #[must_use]
    pub fn request(&self, request: ControlRequest) -> bool {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sender| sender.send(request).is_ok())
    }

    /// Number of bridges created so far
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl BridgeFactory for WatchBridgeFactory {
    fn create(
        &mut self,
        identity: &DeviceIdentity,
        requests: mpsc::UnboundedSender<ControlRequest>,
    ) -> Result<Box<dyn VirtualPeripheral>> {
        let instance = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Creating virtual peripheral #{} for {}", instance, identity);

        *self
            .requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(requests);

        Ok(Box::new(WatchBridge {
            snapshots: self.snapshots.clone(),
            instance,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceFamily;

    #[test]
    fn test_factory_publishes_and_forwards() {
        let mut factory = WatchBridgeFactory::new();
        let observer = factory.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(!factory.request(ControlRequest::Start));

        let identity = DeviceIdentity::new("Bike", "AA:BB", DeviceFamily::SportsPlusBike);
        let mut bridge = factory.create(&identity, tx).unwrap();
        assert_eq!(factory.created(), 1);

        let snapshot = MetricsSnapshot {
            speed: 21.0,
            cadence: 80.0,
            ..Default::default()
        };
        bridge.publish(&snapshot);
        assert_eq!(*observer.borrow(), snapshot);

        assert!(factory.request(ControlRequest::SetResistance(7)));
        assert_eq!(rx.try_recv().unwrap(), ControlRequest::SetResistance(7));

        bridge.shutdown();
    }

    #[test]
    fn test_request_after_session_gone() {
        let mut factory = WatchBridgeFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = DeviceIdentity::new("PM5", "AA:BB", DeviceFamily::Concept2Rower);
        let _bridge = factory.create(&identity, tx).unwrap();

        drop(rx);
        assert!(!factory.request(ControlRequest::Stop));
    }
}
