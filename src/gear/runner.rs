//! Async driver for one device session.
//!
//! The runner owns the transport connection, the notification stream and
//! every session timer, and does nothing but shuttle events into the
//! [`SessionCore`] and execute the effects it returns. One task per
//! device; the rest of the application talks to it through a
//! [`GearHandle`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use derive_more::Display;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::ota::VerifiedFirmware;
use super::profile::GearModel;
use super::session::{SessionCore, SessionEffect, SessionEvent, SessionState, SessionTimer, StatusUpdate};
use super::transport::{GearConnection, GearNotification, GearTransport};
use crate::aggregate::CatalogEvent;
use crate::error::InteractionError;

const OPS_CHANNEL_CAPACITY: usize = 32;

/// Requests a [`GearHandle`] can make of its runner.
#[derive(Debug)]
pub enum GearOp {
    Connect,
    Disconnect,
    Send { message: String },
    StartOta { firmware: VerifiedFirmware },
    SetAutoReconnect(bool),
}

/// Battery charge, in whichever unit the model reports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum BatteryCharge {
    /// 0 through 4 bars.
    #[display("{_0}/4")]
    Bars(u8),
    #[display("{_0}%")]
    Percent(u8),
}

/// Latest observable state of one device session.
#[derive(Debug, Clone, PartialEq)]
pub struct GearStatus {
    device_id: String,
    local_name: String,
    model: GearModel,
    state: SessionState,
    version: Option<String>,
    battery: Option<BatteryCharge>,
    charging: Option<bool>,
    ota_progress: Option<u8>,
    last_message: Option<String>,
}

impl GearStatus {
    pub(crate) fn new(device_id: String, local_name: String, model: GearModel) -> Self {
        Self {
            device_id,
            local_name,
            model,
            state: SessionState::Disconnected,
            version: None,
            battery: None,
            charging: None,
            ota_progress: None,
            last_message: None,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    #[must_use]
    pub fn model(&self) -> GearModel {
        self.model
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    #[must_use]
    pub fn battery(&self) -> Option<BatteryCharge> {
        self.battery
    }

    #[must_use]
    pub fn charging(&self) -> Option<bool> {
        self.charging
    }

    /// Firmware upload progress in percent, while one is in flight.
    #[must_use]
    pub fn ota_progress(&self) -> Option<u8> {
        self.ota_progress
    }

    /// The most recent user-facing message from the session.
    #[must_use]
    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::Ready | SessionState::Busy | SessionState::Updating
        )
    }

    fn absorb(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::State(state) => {
                self.state = *state;
                if !self.is_connected() {
                    self.version = None;
                    self.battery = None;
                    self.charging = None;
                    self.ota_progress = None;
                }
            }
            StatusUpdate::Version(version) => self.version = Some(version.clone()),
            StatusUpdate::BatteryBars(level) => self.battery = Some(BatteryCharge::Bars(*level)),
            StatusUpdate::BatteryPercent(percent) => {
                self.battery = Some(BatteryCharge::Percent(*percent));
            }
            StatusUpdate::Charging(charging) => self.charging = Some(*charging),
            StatusUpdate::OtaProgress(progress) => self.ota_progress = Some(*progress),
            StatusUpdate::Message(message) => self.last_message = Some(message.clone()),
        }
    }
}

/// Cloneable handle to one running device session.
#[derive(Clone)]
pub struct GearHandle {
    device_id: String,
    model: GearModel,
    ops: mpsc::Sender<GearOp>,
    status: watch::Receiver<GearStatus>,
}

impl GearHandle {
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn model(&self) -> GearModel {
        self.model
    }

    /// A watch on the session's observable state.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<GearStatus> {
        self.status.clone()
    }

    pub async fn connect(&self) {
        let _ = self.ops.send(GearOp::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.ops.send(GearOp::Disconnect).await;
    }

    /// Queues one message for the device; chains and shorthands apply.
    pub async fn send(&self, message: impl Into<String>) {
        let _ = self
            .ops
            .send(GearOp::Send {
                message: message.into(),
            })
            .await;
    }

    pub async fn start_ota(&self, firmware: VerifiedFirmware) {
        let _ = self.ops.send(GearOp::StartOta { firmware }).await;
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) {
        let _ = self.ops.send(GearOp::SetAutoReconnect(enabled)).await;
    }
}

/// Spawns the session task for one discovered device.
#[must_use]
pub fn spawn_session(
    transport: Arc<dyn GearTransport>,
    core: SessionCore,
    local_name: String,
    catalog_events: mpsc::Sender<CatalogEvent>,
) -> GearHandle {
    let device_id = core.device_id().to_string();
    let model = core.profile().model();
    let (ops_tx, ops_rx) = mpsc::channel(OPS_CHANNEL_CAPACITY);
    let (status_tx, status_rx) = watch::channel(GearStatus::new(
        device_id.clone(),
        local_name,
        model,
    ));

    let runner = SessionRunner {
        core,
        transport,
        connection: None,
        notifications: None,
        deadlines: HashMap::new(),
        status_tx,
        catalog_events,
        was_connected: false,
    };
    tokio::spawn(runner.run(ops_rx));

    GearHandle {
        device_id,
        model,
        ops: ops_tx,
        status: status_rx,
    }
}

struct SessionRunner {
    core: SessionCore,
    transport: Arc<dyn GearTransport>,
    connection: Option<Box<dyn GearConnection>>,
    notifications: Option<mpsc::Receiver<GearNotification>>,
    deadlines: HashMap<SessionTimer, Instant>,
    status_tx: watch::Sender<GearStatus>,
    catalog_events: mpsc::Sender<CatalogEvent>,
    was_connected: bool,
}

impl SessionRunner {
    #[instrument(skip_all, fields(device_id = %self.core.device_id(), model = %self.core.profile().model()))]
    async fn run(mut self, mut ops_rx: mpsc::Receiver<GearOp>) {
        loop {
            let next_deadline = self.deadlines.values().min().copied();
            let wakeup = tokio::select! {
                op = ops_rx.recv() => Wakeup::Op(op),
                notification = recv_or_pending(&mut self.notifications) => {
                    Wakeup::Notification(notification)
                }
                () = sleep_until_or_pending(next_deadline) => Wakeup::TimerTick,
            };
            match wakeup {
                Wakeup::Op(Some(op)) => self.handle_op(op).await,
                Wakeup::Op(None) => break,
                Wakeup::Notification(Some(notification)) => {
                    self.apply(SessionEvent::Notified(notification)).await;
                }
                Wakeup::Notification(None) => {
                    debug!("notification stream closed");
                    self.drop_link();
                    self.apply(SessionEvent::Disconnected).await;
                }
                Wakeup::TimerTick => self.fire_elapsed_timers().await,
            }
        }
        if let Some(mut connection) = self.connection.take()
            && let Err(error) = connection.disconnect().await
        {
            debug!(%error, "disconnect on shutdown failed");
        }
    }

    async fn handle_op(&mut self, op: GearOp) {
        match op {
            GearOp::Connect => self.apply(SessionEvent::ConnectRequested).await,
            GearOp::Disconnect => self.apply(SessionEvent::DisconnectRequested).await,
            GearOp::Send { message } => self.apply(SessionEvent::SendRequested { message }).await,
            GearOp::StartOta { firmware } => {
                self.apply(SessionEvent::StartOtaRequested { firmware }).await;
            }
            GearOp::SetAutoReconnect(enabled) => self.core.set_auto_reconnect(enabled),
        }
    }

    async fn fire_elapsed_timers(&mut self) {
        let now = Instant::now();
        let elapsed: Vec<SessionTimer> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(timer, _)| *timer)
            .collect();
        for timer in elapsed {
            self.deadlines.remove(&timer);
            self.apply(SessionEvent::TimerElapsed(timer)).await;
        }
    }

    async fn apply(&mut self, event: SessionEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            for effect in self.core.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    events.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, effect: SessionEffect) -> Option<SessionEvent> {
        match effect {
            SessionEffect::Connect => match self.transport.connect(self.core.device_id()).await {
                Ok(connection) => {
                    self.connection = Some(connection);
                    Some(SessionEvent::Connected)
                }
                Err(error) => Some(connect_failure(&error)),
            },
            SessionEffect::Subscribe => match self.connection.as_mut() {
                Some(connection) => match connection.subscribe().await {
                    Ok(notifications) => {
                        self.notifications = Some(notifications);
                        Some(SessionEvent::Subscribed)
                    }
                    Err(error) => Some(connect_failure(&error)),
                },
                None => Some(SessionEvent::ConnectFailed {
                    message: "no open connection to subscribe on".to_string(),
                    fatal: false,
                }),
            },
            SessionEffect::Write(message) => self.write(message.as_bytes().to_vec()).await,
            SessionEffect::WriteChunk(chunk) => self.write(chunk).await,
            SessionEffect::ReadBattery => match self.connection.as_mut() {
                Some(connection) => match connection.read_battery_percent().await {
                    Ok(percent) => Some(SessionEvent::BatteryRead { percent }),
                    Err(error) => {
                        debug!(%error, "battery read failed");
                        None
                    }
                },
                None => None,
            },
            SessionEffect::StartTimer { timer, after } => {
                self.deadlines.insert(timer, Instant::now() + after);
                None
            }
            SessionEffect::CancelTimer(timer) => {
                self.deadlines.remove(&timer);
                None
            }
            SessionEffect::CancelAllTimers => {
                self.deadlines.clear();
                None
            }
            SessionEffect::Publish(update) => {
                self.status_tx.send_modify(|status| status.absorb(&update));
                self.publish_connectivity().await;
                None
            }
            SessionEffect::CatalogLoaded(commands) => {
                self.emit_catalog_event(CatalogEvent::CommandsReplaced {
                    device_id: self.core.device_id().to_string(),
                    commands,
                })
                .await;
                None
            }
            SessionEffect::CatalogChanged(changed) => {
                self.emit_catalog_event(CatalogEvent::StateChanged {
                    device_id: self.core.device_id().to_string(),
                    changed,
                })
                .await;
                None
            }
            SessionEffect::CatalogCleared => {
                self.emit_catalog_event(CatalogEvent::CommandsCleared {
                    device_id: self.core.device_id().to_string(),
                })
                .await;
                None
            }
            SessionEffect::Disconnect => {
                if let Some(mut connection) = self.connection.take()
                    && let Err(error) = connection.disconnect().await
                {
                    debug!(%error, "disconnect failed");
                }
                self.notifications = None;
                Some(SessionEvent::Disconnected)
            }
        }
    }

    async fn write(&mut self, payload: Vec<u8>) -> Option<SessionEvent> {
        match self.connection.as_mut() {
            Some(connection) => match connection.write(&payload).await {
                Ok(()) => Some(SessionEvent::WriteAcked),
                Err(error) => {
                    warn!(%error, "write failed, treating the link as lost");
                    self.drop_link();
                    Some(SessionEvent::Disconnected)
                }
            },
            None => None,
        }
    }

    fn drop_link(&mut self) {
        self.connection = None;
        self.notifications = None;
    }

    async fn publish_connectivity(&mut self) {
        let connected = self.status_tx.borrow().is_connected();
        if connected == self.was_connected {
            return;
        }
        self.was_connected = connected;
        let device_id = self.core.device_id().to_string();
        let event = if connected {
            CatalogEvent::Connected { device_id }
        } else {
            CatalogEvent::Disconnected { device_id }
        };
        self.emit_catalog_event(event).await;
    }

    async fn emit_catalog_event(&self, event: CatalogEvent) {
        if self.catalog_events.send(event).await.is_err() {
            debug!("aggregator is gone, dropping catalog event");
        }
    }
}

enum Wakeup {
    Op(Option<GearOp>),
    Notification(Option<GearNotification>),
    TimerTick,
}

/// A missing endpoint or unrecognised model means this is the wrong
/// device, and reconnecting to it cannot help.
fn connect_failure(error: &InteractionError) -> SessionEvent {
    SessionEvent::ConnectFailed {
        message: error.to_string(),
        fatal: matches!(
            error,
            InteractionError::MissingEndpoint { .. } | InteractionError::UnknownModel { .. }
        ),
    }
}

async fn recv_or_pending(
    notifications: &mut Option<mpsc::Receiver<GearNotification>>,
) -> Option<GearNotification> {
    match notifications {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
