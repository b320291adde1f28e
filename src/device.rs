use crate::{
    bridge::{BridgeFactory, ControlRequest, VirtualPeripheral},
    config::Settings,
    control::ControlChannel,
    error::{DeviceError, Result},
    metrics::{MetricKind, MetricUpdate, MetricsModel, MetricsSnapshot},
    protocol::{codec_for, Codec, DecodeContext, Frame},
    transport::{Channel, EventSink, Transport, TransportEvent},
    types::{AckMode, ConnectionState, DeviceIdentity, SessionSignal},
    workout::WorkoutRow,
};
use std::{collections::HashSet, sync::Arc, time::Instant};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Capacity of the signal broadcast; slow receivers lag rather than block
const SIGNAL_CAPACITY: usize = 64;

/// One connection to one fitness device
///
/// A `DeviceSession` owns the device's transport, its codec, its
/// [`MetricsModel`] and, once it has first become ready, its virtual
/// peripheral bridge. All of them are driven from a single flow: transport
/// events, control requests and the fixed-period tick are handled one at a
/// time by [`DeviceSession::run`], so the model has exactly one writer.
///
/// # Lifecycle
///
/// 1. [`connect`](Self::connect) moves the session to `Connecting`
/// 2. the transport's connected event starts service discovery and every
///    notify or indicate channel is subscribed
/// 3. when every subscription is acknowledged, the next tick writes the
///    family's init sequence and the session becomes `Ready`
/// 4. while ready each tick polls the device and applies pending control
///    requests
///
/// A dropped link, reported either as an event or found by the tick, emits
/// [`SessionSignal::Disconnected`] and reconnects to the same device right
/// away. Failed attempts are retried on every following tick without a cap or
/// backoff until [`disconnect`](Self::disconnect) is called. A discovery or
/// subscription that times out on a live link is retried on the next tick;
/// any other failure there drops the link and takes the reconnect path.
///
/// # Examples
///
/// ```no_run
/// use ergolink::{
///     ble::BtleTransport, DeviceFamily, DeviceIdentity, DeviceSession, Settings,
///     WatchBridgeFactory,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let settings = Arc::new(Settings::default());
///     let identity = DeviceIdentity::new("PM5 430000000", "", DeviceFamily::Concept2Rower);
///     let transport = BtleTransport::new(settings.timeouts.clone()).await?;
///
///     let session = DeviceSession::new(identity, Box::new(transport), settings)
///         .with_bridge_factory(Box::new(WatchBridgeFactory::new()));
///     let handle = session.handle();
///     let task = tokio::spawn(session.run());
///
///     handle.set_resistance(8)?;
///     println!("{:?}", handle.snapshot());
///
///     handle.shutdown();
///     task.await??;
///     Ok(())
/// }
/// ```
pub struct DeviceSession {
    identity: DeviceIdentity,
    settings: Arc<Settings>,
    transport: Box<dyn Transport>,
    codec: Box<dyn Codec>,
    metrics: MetricsModel,
    control: ControlChannel,
    state: ConnectionState,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    requests: mpsc::UnboundedReceiver<ControlRequest>,
    request_sender: mpsc::UnboundedSender<ControlRequest>,
    control_channel: Option<Channel>,
    outstanding_subscriptions: HashSet<Uuid>,
    init_request: bool,
    rediscover: bool,
    bridge_factory: Option<Box<dyn BridgeFactory>>,
    bridge: Option<Box<dyn VirtualPeripheral>>,
    torn_down: bool,
    reconnect_attempts: u32,
    snapshots: watch::Sender<MetricsSnapshot>,
    states: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<SessionSignal>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("has_bridge", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Create a session for `identity` talking over `transport`
    ///
    /// The codec is selected from the identity's family. Nothing is sent until
    /// [`connect`](Self::connect) or [`run`](Self::run) is called.
    #[must_use]
    pub fn new(identity: DeviceIdentity, mut transport: Box<dyn Transport>, settings: Arc<Settings>) -> Self {
        let (sink, events) = EventSink::new();
        let control = ControlChannel::new(sink.acks().clone(), settings.timeouts.ack_timeout());
        transport.attach(sink);

        let (request_sender, requests) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(MetricsSnapshot::default());
        let (states, _) = watch::channel(ConnectionState::Idle);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            codec: codec_for(identity.family),
            identity,
            settings,
            transport,
            metrics: MetricsModel::new(),
            control,
            state: ConnectionState::Idle,
            events,
            requests,
            request_sender,
            control_channel: None,
            outstanding_subscriptions: HashSet::new(),
            init_request: false,
            rediscover: false,
            bridge_factory: None,
            bridge: None,
            torn_down: false,
            reconnect_attempts: 0,
            snapshots,
            states,
            signals,
            shutdown,
        }
    }

    /// Create a virtual peripheral with `factory` the first time the session
    /// becomes ready, if enabled in the settings
    #[must_use]
    pub fn with_bridge_factory(mut self, factory: Box<dyn BridgeFactory>) -> Self {
        self.bridge_factory = Some(factory);
        self
    }

    /// Handle for controlling and observing the session from other tasks
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            requests: self.request_sender.clone(),
            snapshots: self.snapshots.subscribe(),
            states: self.states.subscribe(),
            signals: self.signals.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Device this session talks to
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Live telemetry
    #[must_use]
    pub const fn metrics(&self) -> &MetricsModel {
        &self.metrics
    }

    /// Number of reconnect attempts since the session was created
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// A virtual peripheral bridge is running
    #[must_use]
    pub const fn has_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    /// Connect to the device
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the connection attempt failed. The
    /// session stays `Disconnected` and the next tick tries again.
    pub async fn connect(&mut self) -> Result<()> {
        self.torn_down = false;
        info!("Connecting to {}", self.identity);
        self.set_state(ConnectionState::Connecting);

        match self.transport.connect(&self.identity).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connection to {} failed: {}", self.identity, e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn reconnect(&mut self) {
        self.reconnect_attempts += 1;
        info!(
            "Reconnecting to {} (attempt {})",
            self.identity, self.reconnect_attempts
        );
        // failures are logged by connect and retried on the next tick
        let _ = self.connect().await;
    }

    /// Tear the session down: no further reconnects, the bridge is shut down,
    /// then the transport is disconnected
    ///
    /// # Errors
    ///
    /// Returns the transport's error if disconnecting failed; the session is
    /// torn down regardless.
    pub async fn disconnect(&mut self) -> Result<()> {
        info!("Disconnecting from {}", self.identity);
        self.torn_down = true;
        self.control.abandon();
        self.outstanding_subscriptions.clear();
        self.init_request = false;
        self.rediscover = false;
        self.set_state(ConnectionState::Disconnected);

        if let Some(mut bridge) = self.bridge.take() {
            bridge.shutdown();
        }

        self.transport.disconnect().await
    }

    /// Handle one transport event
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.torn_down {
                    debug!("Ignoring connected event after teardown");
                    return;
                }
                info!("Connected to {}", self.identity);
                self.discover().await;
            }
            TransportEvent::Disconnected => {
                if self.transport.is_connected().await {
                    debug!("Ignoring stale disconnect event, link is up");
                    return;
                }
                self.on_link_lost().await;
            }
            TransportEvent::SubscriptionAcknowledged(channel) => {
                self.outstanding_subscriptions.remove(&channel);
                if self.state == ConnectionState::SubscribingNotifications {
                    self.init_request = true;
                }
                debug!(
                    "Subscription to {} acknowledged, {} outstanding",
                    channel,
                    self.outstanding_subscriptions.len()
                );
            }
            TransportEvent::CharacteristicWritten(channel) => {
                trace!("Write to {} confirmed", channel);
            }
            TransportEvent::Frame(frame) => self.on_frame(&frame).await,
            TransportEvent::Error(message) => {
                warn!("Transport error on {}: {}", self.identity, message);
            }
        }
    }

    /// Handle every event already queued by the transport
    pub async fn process_pending_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
        }
    }

    /// Handle one control request
    pub fn handle_request(&mut self, request: ControlRequest) {
        debug!("Control request: {:?}", request);
        match request {
            ControlRequest::SetResistance(level) => self.control.set_resistance(level),
            ControlRequest::SetSpeed(speed) => self.control.set_speed(speed),
            ControlRequest::SetInclination(inclination) => self.control.set_inclination(inclination),
            ControlRequest::Start => self.control.start(),
            ControlRequest::Stop => self.control.stop(),
            ControlRequest::ApplyRow(row) => row.apply_to(&mut self.control),
            ControlRequest::ExternalSample(kind, value) => self.on_external_sample(kind, value),
        }
    }

    /// Handle every control request already queued
    pub fn process_pending_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            self.handle_request(request);
        }
    }

    /// One period of the connection manager
    pub async fn tick(&mut self) {
        if self.torn_down {
            return;
        }

        if self.state == ConnectionState::Disconnected {
            self.reconnect().await;
            return;
        }

        if self.state.expects_link() && !self.transport.is_connected().await {
            warn!("Link to {} dropped", self.identity);
            self.on_link_lost().await;
            return;
        }

        if self.rediscover {
            info!("Retrying discovery on {}", self.identity);
            self.discover().await;
            return;
        }

        if self.init_request && self.outstanding_subscriptions.is_empty() {
            self.init_request = false;
            self.become_ready().await;
        }

        if self.state != ConnectionState::Ready {
            return;
        }

        let Some(channel) = self.control_channel else {
            return;
        };
        let signals = self
            .control
            .service(self.transport.as_mut(), self.codec.as_ref(), &channel)
            .await;

        for signal in signals {
            if let SessionSignal::ResistanceApplied(level) = signal {
                self.metrics
                    .apply(MetricUpdate::Set(MetricKind::Resistance, f64::from(level)));
                self.publish_snapshot();
            }
            self.emit(signal);
        }
    }

    /// Connect, then drive the session until [`SessionHandle::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection attempt fails or the final
    /// disconnect is rejected by the transport.
    pub async fn run(mut self) -> Result<()> {
        self.connect().await?;

        let mut ticker = tokio::time::interval(self.settings.timeouts.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                Some(event) = self.events.recv() => self.handle_event(event).await,
                Some(request) = self.requests.recv() => self.handle_request(request),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.disconnect().await
    }

    async fn discover(&mut self) {
        self.set_state(ConnectionState::DiscoveringServices);
        self.outstanding_subscriptions.clear();
        self.init_request = false;
        self.rediscover = false;

        if let Err(e) = self.discover_and_subscribe().await {
            self.on_discovery_failed(e).await;
        }
    }

    async fn discover_and_subscribe(&mut self) -> Result<()> {
        let services = self.transport.discover_services().await?;

        let control_id = self.codec.control_channel();
        let mut subscribable = Vec::new();
        for service in &services {
            let channels = match self.transport.discover_channels(service).await {
                Ok(channels) => channels,
                Err(e) => {
                    warn!("Channel discovery for service {} failed: {}", service.id, e);
                    continue;
                }
            };

            for channel in channels {
                debug!("Discovered channel {} in {}", channel.id, service.id);
                if channel.id == control_id && channel.properties.writable() {
                    self.control_channel = Some(channel);
                }
                if channel.properties.subscribable() {
                    subscribable.push(channel);
                }
            }
        }

        if self.control_channel.is_none() {
            warn!("{} exposes no control channel {}", self.identity, control_id);
        }

        self.set_state(ConnectionState::SubscribingNotifications);
        if subscribable.is_empty() {
            self.init_request = true;
            return Ok(());
        }

        self.outstanding_subscriptions
            .extend(subscribable.iter().map(|channel| channel.id));
        for channel in &subscribable {
            self.transport.subscribe(channel).await?;
        }
        Ok(())
    }

    /// A failure on a live link is retried from discovery on the next tick.
    /// Anything else drops the link and goes through a full reconnect.
    async fn on_discovery_failed(&mut self, e: DeviceError) {
        if e.is_recoverable() && !e.is_connection_error() {
            warn!(
                "Discovery on {} failed, retrying on next tick: {}",
                self.identity, e
            );
            self.rediscover = true;
            return;
        }

        error!("Discovery on {} failed, reconnecting: {}", self.identity, e);
        if let Err(e) = self.transport.disconnect().await {
            debug!("Dropping link to {} failed: {}", self.identity, e);
        }
        self.on_link_lost().await;
    }

    async fn become_ready(&mut self) {
        if let Some(channel) = self.control_channel {
            let mode = self.codec.ack_mode();
            for frame in self.codec.init_sequence() {
                if let Err(e) = self
                    .control
                    .write_and_maybe_wait(self.transport.as_mut(), &channel, &frame, mode)
                    .await
                {
                    warn!("Init write to {} failed: {}", self.identity, e);
                }
            }
        }

        self.set_state(ConnectionState::Ready);
        self.emit(SessionSignal::Ready);

        if self.bridge.is_none() && self.settings.virtual_device_enabled {
            if let Some(factory) = self.bridge_factory.as_mut() {
                match factory.create(&self.identity, self.request_sender.clone()) {
                    Ok(bridge) => self.bridge = Some(bridge),
                    Err(e) => error!("Virtual peripheral for {} failed: {}", self.identity, e),
                }
            }
        }
    }

    async fn on_link_lost(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionSignal::Disconnected);
        }
        self.control.abandon();
        self.control_channel = None;
        self.outstanding_subscriptions.clear();
        self.init_request = false;
        self.rediscover = false;

        if !self.torn_down {
            self.reconnect().await;
        }
    }

    async fn on_frame(&mut self, frame: &Frame) {
        trace!("<< {} {:02x?}", frame.channel(), frame.data());

        if let (Some(reply), Some(channel)) = (self.codec.reply(frame), self.control_channel) {
            if let Err(e) = self
                .control
                .write_and_maybe_wait(self.transport.as_mut(), &channel, &reply, AckMode::FireAndForget)
                .await
            {
                warn!("Reply to {} failed: {}", self.identity, e);
            }
        }

        if self.state != ConnectionState::Ready {
            return;
        }

        let updates = {
            let ctx = DecodeContext {
                now: Instant::now(),
                metrics: &self.metrics,
                settings: &self.settings,
            };
            self.codec.decode(frame, &ctx)
        };
        if updates.is_empty() {
            return;
        }

        for update in updates {
            if matches!(update, MetricUpdate::Set(kind, _) if !self.settings.accepts_local(kind)) {
                continue;
            }
            self.metrics.apply(update);
        }
        self.metrics.derive_crank_event();
        self.publish_snapshot();
    }

    fn on_external_sample(&mut self, kind: MetricKind, value: f64) {
        if self.settings.accepts_local(kind) {
            debug!("Ignoring external {} sample, no override configured", kind);
            return;
        }
        self.metrics.apply(MetricUpdate::Set(kind, value));
        self.publish_snapshot();
    }

    fn publish_snapshot(&mut self) {
        let snapshot = self.metrics.snapshot();
        self.snapshots.send_replace(snapshot);
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.publish(&snapshot);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("{}: {} -> {}", self.identity.name, self.state, state);
        self.state = state;
        self.states.send_replace(state);
        self.emit(SessionSignal::StateChanged(state));
    }

    fn emit(&self, signal: SessionSignal) {
        // no receivers is fine
        let _ = self.signals.send(signal);
    }
}

/// Cloneable handle to a running [`DeviceSession`]
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<ControlRequest>,
    snapshots: watch::Receiver<MetricsSnapshot>,
    states: watch::Receiver<ConnectionState>,
    signals: broadcast::Sender<SessionSignal>,
    shutdown: watch::Sender<bool>,
}

impl SessionHandle {
    /// Queue a control request for the session's next turn
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn request(&self, request: ControlRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| DeviceError::ChannelClosed)
    }

    /// Request a resistance level
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn set_resistance(&self, level: i16) -> Result<()> {
        self.request(ControlRequest::SetResistance(level))
    }

    /// Request a belt speed in km/h
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        self.request(ControlRequest::SetSpeed(speed))
    }

    /// Request an inclination in percent
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn set_inclination(&self, inclination: f64) -> Result<()> {
        self.request(ControlRequest::SetInclination(inclination))
    }

    /// Request a workout start
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn start(&self) -> Result<()> {
        self.request(ControlRequest::Start)
    }

    /// Request a workout stop
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn stop(&self) -> Result<()> {
        self.request(ControlRequest::Stop)
    }

    /// Apply the targets of a workout row
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn apply_row(&self, row: WorkoutRow) -> Result<()> {
        self.request(ControlRequest::ApplyRow(row))
    }

    /// Feed a reading from an external sensor
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ChannelClosed`] once the session has ended.
    pub fn external_sample(&self, kind: MetricKind, value: f64) -> Result<()> {
        self.request(ControlRequest::ExternalSample(kind, value))
    }

    /// Latest published telemetry
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.snapshots.borrow()
    }

    /// Receiver that wakes on every published snapshot
    #[must_use]
    pub fn watch_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshots.clone()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.states.borrow()
    }

    /// Subscribe to session signals emitted from now on
    #[must_use]
    pub fn subscribe_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Ask [`DeviceSession::run`] to tear the session down and return
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
