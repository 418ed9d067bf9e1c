//! Bridge Session
//!
//! The session task exclusively owns the device registry, the lighting SDK
//! handle and the control-switch flag. Connection events, inbound messages,
//! handle commands and the optional refresh timer are all consumed by one
//! loop, so every registry mutation is serialized against topic lookups.
//!
//! # Lifecycle
//!
//! - on every `Connected`: enumerate devices if none are known yet, then
//!   publish-all (subscriptions, discovery documents, states)
//! - on every inbound message: route by topic and apply
//! - on shutdown: set the stop flag, disconnect, release SDK control

mod dispatch;

pub use dispatch::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::device::Rgb;
use crate::discovery::{parse_command, CommandPayload, DiscoveryDocument, PowerState, StatePayload};
use crate::mqtt::{
    ConnectionDriver, ConnectionEvent, ConnectionState, MqttPublish, QoS, StopSignal,
    TransportEvents,
};
use crate::registry::{DeviceRegistry, EntityTopics, EntryId, TopicScheme};
use crate::sdk::{self, LightingSdk, CONTROL_PRIORITY, YIELD_PRIORITY};
use crate::types::{Error, Result};

/// Retained discovery documents of every entity
const DISCOVERY_QOS: QoS = QoS::ExactlyOnce;

/// Device and aggregate state and command topics
const LIGHT_QOS: QoS = QoS::ExactlyOnce;

/// Control switch state and command topics
const SWITCH_QOS: QoS = QoS::AtLeastOnce;

const COMMAND_CHANNEL_SIZE: usize = 32;

/// Capacity of the rumqttc request channel
const CLIENT_CHANNEL_SIZE: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Session parameters derived from [`BridgeConfig`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scheme: TopicScheme,
    pub reconnect_delay: Duration,
    /// Periodic hardware re-read; `None` disables it
    pub refresh_interval: Option<Duration>,
    /// Release exclusive SDK control on shutdown
    pub exclusive_control: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scheme: TopicScheme::default(),
            reconnect_delay: Duration::from_secs(10),
            refresh_interval: None,
            exclusive_control: false,
        }
    }
}

impl From<&BridgeConfig> for SessionSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            scheme: config.bridge.topic_scheme(),
            reconnect_delay: config.mqtt.reconnect_delay(),
            refresh_interval: config.bridge.refresh_interval(),
            exclusive_control: config.sdk.exclusive_control,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Commands that can be sent to a running session
pub enum SessionCommand {
    /// Re-enumerate devices and publish-all
    Rescan,

    /// Request a status snapshot
    GetStatus(oneshot::Sender<SessionStatus>),

    /// Request graceful shutdown
    Shutdown,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub connected: bool,
    pub devices: usize,
    pub has_control: bool,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    /// Connection state written by the driver
    state: Arc<AtomicU8>,
}

impl SessionHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<SessionCommand>, state: Arc<AtomicU8>) -> Self {
        Self { command_tx, state }
    }

    /// Current broker connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::NotRunning)
    }

    pub async fn rescan(&self) -> Result<()> {
        self.send(SessionCommand::Rescan).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetStatus(tx)).await?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    /// Request graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Background tasks of a running bridge
pub struct BridgeTasks {
    session: JoinHandle<()>,
    driver: JoinHandle<()>,
}

impl BridgeTasks {
    /// Wait for the session to finish, then for the connection to close
    pub async fn join(self) {
        if let Err(e) = self.session.await {
            error!("Bridge session task failed: {}", e);
        }
        if let Err(e) = self.driver.await {
            error!("Connection driver task failed: {}", e);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────────────────

/// Connect to the configured broker and start bridging
pub fn connect(config: &BridgeConfig, sdk: Box<dyn LightingSdk>) -> (SessionHandle, BridgeTasks) {
    let client_id = config.mqtt.client_id();
    let mut options = MqttOptions::new(&client_id, &config.mqtt.host, config.mqtt.port);
    options.set_keep_alive(config.mqtt.keep_alive());
    options.set_clean_session(true);
    if let Some((username, password)) = config.mqtt.credentials() {
        options.set_credentials(username, password);
    }

    info!(
        client_id = %client_id,
        "Bridging to MQTT broker {}:{}",
        config.mqtt.host,
        config.mqtt.port
    );

    let (client, eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_SIZE);
    spawn(client, eventloop, sdk, SessionSettings::from(config))
}

/// Start the connection driver and the session over any transport
pub fn spawn<P, T>(
    publisher: P,
    transport: T,
    sdk: Box<dyn LightingSdk>,
    settings: SessionSettings,
) -> (SessionHandle, BridgeTasks)
where
    P: MqttPublish + 'static,
    T: TransportEvents + 'static,
{
    let stop = StopSignal::new();
    let state = Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let driver = ConnectionDriver::new(
        transport,
        settings.reconnect_delay,
        stop.clone(),
        state.clone(),
        event_tx,
    );
    let session = BridgeSession::new(publisher, sdk, &settings, stop);

    let tasks = BridgeTasks {
        driver: tokio::spawn(driver.run()),
        session: tokio::spawn(session.run(event_rx, command_rx, settings.refresh_interval)),
    };
    (SessionHandle::new(command_tx, state), tasks)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps broker-side entities in step with the hardware
pub struct BridgeSession<P> {
    publisher: P,
    sdk: Box<dyn LightingSdk>,
    registry: DeviceRegistry,
    aggregate_topics: EntityTopics,
    switch_topics: EntityTopics,
    /// Whether the bridge layer sits above the vendor software's layer
    has_control: bool,
    connected: bool,
    exclusive_control: bool,
    stop: StopSignal,
}

impl<P: MqttPublish> BridgeSession<P> {
    pub fn new(
        publisher: P,
        sdk: Box<dyn LightingSdk>,
        settings: &SessionSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            publisher,
            sdk,
            registry: DeviceRegistry::new(settings.scheme.clone()),
            aggregate_topics: settings.scheme.aggregate(),
            switch_topics: settings.scheme.control_switch(),
            has_control: true,
            connected: false,
            exclusive_control: settings.exclusive_control,
            stop,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn has_control(&self) -> bool {
        self.has_control
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.connected,
            devices: self.registry.len(),
            has_control: self.has_control,
        }
    }

    /// Run until shutdown is requested or the connection driver goes away
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
        refresh_interval: Option<Duration>,
    ) {
        let period = refresh_interval.unwrap_or(Duration::from_secs(3600));
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Rescan) => {
                        info!("Rescanning lighting devices");
                        if let Err(e) = self.rescan().await {
                            warn!("Rescan failed: {}", e);
                        }
                    }
                    Some(SessionCommand::GetStatus(tx)) => {
                        let _ = tx.send(self.status());
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },

                event = events.recv() => match event {
                    Some(ConnectionEvent::Connected) => {
                        if let Err(e) = self.on_connected().await {
                            warn!("Failed to publish entities: {}", e);
                        }
                    }
                    Some(ConnectionEvent::Disconnected) => {
                        self.connected = false;
                        info!("Disconnected from MQTT broker");
                    }
                    Some(ConnectionEvent::Message { topic, payload }) => {
                        if let Err(e) = self.handle_message(&topic, &payload).await {
                            warn!(topic = %topic, "Failed to handle message: {}", e);
                        }
                    }
                    None => {
                        debug!("Connection driver ended");
                        break;
                    }
                },

                _ = refresh.tick(), if refresh_interval.is_some() => {
                    if let Err(e) = self.refresh_all().await {
                        warn!("Colour refresh failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Ask the SDK for devices and register them in a new pass
    pub fn enumerate(&mut self) {
        let snapshots = sdk::enumerate(self.sdk.as_ref());
        self.registry.register_all(snapshots);
        info!(devices = self.registry.len(), "Enumerated lighting devices");
    }

    /// The transport reported an open session
    pub async fn on_connected(&mut self) -> Result<()> {
        self.connected = true;
        if self.registry.is_empty() {
            self.enumerate();
        }
        self.publish_all().await
    }

    /// Re-enumerate, then publish everything if connected
    pub async fn rescan(&mut self) -> Result<()> {
        self.enumerate();
        if self.connected {
            self.publish_all().await?;
        }
        Ok(())
    }

    /// Subscribe and publish discovery plus state for every entity
    pub async fn publish_all(&mut self) -> Result<()> {
        for entry in self.registry.all() {
            let topics = &entry.topics;
            self.publisher.subscribe(&topics.command, LIGHT_QOS).await?;
            self.publisher.subscribe(&topics.state, LIGHT_QOS).await?;
            self.publisher
                .publish(&topics.config, DiscoveryDocument::for_entry(entry).to_bytes()?, DISCOVERY_QOS, true)
                .await?;
            self.publisher
                .publish(&topics.state, StatePayload::device(entry.snapshot.color).to_bytes()?, LIGHT_QOS, true)
                .await?;
        }

        let aggregate = &self.aggregate_topics;
        self.publisher.subscribe(&aggregate.command, LIGHT_QOS).await?;
        self.publisher.subscribe(&aggregate.state, LIGHT_QOS).await?;
        self.publisher
            .publish(&aggregate.config, DiscoveryDocument::aggregate(aggregate).to_bytes()?, DISCOVERY_QOS, true)
            .await?;
        self.publish_aggregate_state().await?;

        let switch = &self.switch_topics;
        self.publisher.subscribe(&switch.command, SWITCH_QOS).await?;
        self.publisher.subscribe(&switch.state, SWITCH_QOS).await?;
        self.publisher
            .publish(&switch.config, DiscoveryDocument::control_switch(switch).to_bytes()?, DISCOVERY_QOS, true)
            .await?;
        self.publish_switch_state().await?;

        debug!(devices = self.registry.len(), "Published all entities");
        Ok(())
    }

    async fn publish_device_state(&self, id: EntryId) -> Result<()> {
        let Some(entry) = self.registry.get(id) else {
            return Ok(());
        };
        let payload = StatePayload::device(entry.snapshot.color).to_bytes()?;
        self.publisher.publish(&entry.topics.state, payload, LIGHT_QOS, true).await
    }

    async fn publish_aggregate_state(&mut self) -> Result<()> {
        let payload = StatePayload::aggregate(self.registry.aggregate_state()).to_bytes()?;
        self.publisher
            .publish(&self.aggregate_topics.state, payload, LIGHT_QOS, true)
            .await
    }

    async fn publish_switch_state(&self) -> Result<()> {
        let payload = PowerState::from_bool(self.has_control).as_str().as_bytes().to_vec();
        self.publisher
            .publish(&self.switch_topics.state, payload, SWITCH_QOS, true)
            .await
    }

    /// Route one inbound message
    pub async fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let route = route(topic, &self.registry, &self.aggregate_topics, &self.switch_topics);
        trace!(topic, ?route, "Inbound message");

        match route {
            Route::AggregateState => {
                let current = StatePayload::aggregate(self.registry.aggregate_state());
                if is_echo(payload, &current) {
                    return Ok(());
                }
                self.publish_aggregate_state().await
            }
            Route::SwitchState => {
                if PowerState::parse_plain(payload) == Some(PowerState::from_bool(self.has_control)) {
                    return Ok(());
                }
                self.publish_switch_state().await
            }
            Route::DeviceState(id) => self.refresh_device(id, payload).await,
            Route::Command(target) => {
                let Some(command) = parse_command(payload) else {
                    return Ok(());
                };
                self.apply_command(target, command).await
            }
            Route::SwitchCommand => self.set_control(payload).await,
            Route::Ignored => Ok(()),
        }
    }

    /// Re-read one device after a poke on its state topic
    async fn refresh_device(&mut self, id: EntryId, payload: &[u8]) -> Result<()> {
        if self.read_device(id) {
            self.publish_device_state(id).await?;
            return self.publish_aggregate_state().await;
        }
        let Some(entry) = self.registry.get(id) else {
            return Ok(());
        };
        if is_echo(payload, &StatePayload::device(entry.snapshot.color)) {
            return Ok(());
        }
        self.publish_device_state(id).await
    }

    /// Read LED colours back from the SDK; `true` if the average changed
    fn read_device(&mut self, id: EntryId) -> bool {
        let Some(entry) = self.registry.get_mut(id) else {
            return false;
        };
        let Some(index) = entry.device_index() else {
            return false;
        };
        let leds = self.sdk.get_device_colors(index);
        if !sdk::check_last_error(self.sdk.as_ref(), "get_device_colors") {
            return false;
        }
        leds.is_some_and(|leds| entry.snapshot.refresh_from_leds(&leds))
    }

    /// Apply a parsed light command, then republish the affected states
    pub async fn apply_command(&mut self, target: Target, command: CommandPayload) -> Result<()> {
        match target {
            Target::Device(id) => {
                self.apply_to_device(id, &command);
                self.publish_device_state(id).await?;
            }
            Target::Aggregate => {
                self.apply_to_all(&command);
                for id in 0..self.registry.len() {
                    self.publish_device_state(id).await?;
                }
            }
        }
        self.publish_aggregate_state().await
    }

    fn apply_to_device(&mut self, id: EntryId, command: &CommandPayload) {
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        let Some(index) = entry.device_index() else {
            warn!(entity_id = %entry.entity_id, "Device is no longer connected, ignoring command");
            return;
        };
        let color = match (command.color, command.state) {
            (Some(color), _) => color,
            (None, PowerState::On) => entry.restore_color(),
            (None, PowerState::Off) => {
                entry.remember_on_color();
                Rgb::BLACK
            }
        };

        debug!(entity_id = %entry.entity_id, %color, "Setting device colour");
        if write_color(self.sdk.as_mut(), index, color) {
            entry.apply_color(color);
        } else {
            warn!(entity_id = %entry.entity_id, "Device colour left unchanged");
        }
    }

    fn apply_to_all(&mut self, command: &CommandPayload) {
        let color = match (command.color, command.state) {
            (Some(color), _) => color,
            (None, PowerState::On) => self.registry.aggregate_restore_color(),
            (None, PowerState::Off) => {
                self.registry.remember_on_colors();
                Rgb::BLACK
            }
        };

        debug!(%color, devices = self.registry.len(), "Setting colour on all devices");
        for entry in self.registry.all_mut() {
            let Some(index) = entry.device_index() else {
                continue;
            };
            if write_color(self.sdk.as_mut(), index, color) {
                entry.apply_color(color);
            } else {
                warn!(entity_id = %entry.entity_id, "Device colour left unchanged");
            }
        }
    }

    /// Handle a control switch command
    async fn set_control(&mut self, payload: &[u8]) -> Result<()> {
        match PowerState::parse_plain(payload) {
            Some(state) => {
                let (has_control, priority) = match state {
                    PowerState::On => (true, CONTROL_PRIORITY),
                    PowerState::Off => (false, YIELD_PRIORITY),
                };
                self.has_control = has_control;
                self.sdk.set_layer_priority(priority);
                sdk::check_last_error(self.sdk.as_ref(), "set_layer_priority");
                info!(has_control, priority, "Lighting control switched");
            }
            None => warn!(
                payload = %String::from_utf8_lossy(payload),
                "Ignoring unknown control switch payload"
            ),
        }
        self.publish_switch_state().await
    }

    /// Re-read every device and publish the ones that changed
    pub async fn refresh_all(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let changed: Vec<EntryId> = (0..self.registry.len())
            .filter(|&id| self.read_device(id))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        debug!(changed = changed.len(), "Device colours changed outside the bridge");
        for id in changed {
            self.publish_device_state(id).await?;
        }
        self.publish_aggregate_state().await
    }

    /// Stop reconnecting, disconnect and hand lighting back
    pub async fn shutdown(&mut self) {
        info!("Shutting down bridge session");
        self.stop.trigger();

        if self.connected {
            if let Err(e) = self.publisher.disconnect().await {
                warn!("Failed to disconnect cleanly: {}", e);
            }
            self.connected = false;
        }

        if self.exclusive_control {
            self.sdk.release_control();
            if sdk::check_last_error(self.sdk.as_ref(), "release_control") {
                info!("Released exclusive lighting control");
            }
        }
    }
}

/// Write a colour and check the SDK's last error
fn write_color(backend: &mut dyn LightingSdk, index: usize, color: Rgb) -> bool {
    let written = backend.set_device_color(index, color);
    sdk::check_last_error(backend, "set_device_color") && written
}

/// Whether an inbound state payload is the one we would publish anyway
fn is_echo(payload: &[u8], current: &StatePayload) -> bool {
    serde_json::from_slice::<StatePayload>(payload).is_ok_and(|seen| &seen == current)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
