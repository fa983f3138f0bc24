//! Per-device protocol state machine.
//!
//! [`SessionCore`] is a pure transition core: the runner feeds it
//! [`SessionEvent`]s and executes the [`SessionEffect`]s it returns
//! against the transport. Keeping the core synchronous makes every
//! protocol quirk (squashed notifications, busy retries, call chains,
//! the reconnect throttle, chunked firmware pacing) testable without a
//! transport or a clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use strum_macros::Display;
use tracing::{debug, warn};

use super::ota::{OtaUpload, VerifiedFirmware};
use super::profile::{BatteryReporting, GearProfile};
use super::transport::{GearNotification, NotifySource};
use crate::catalog::{CommandInfo, GearCatalog};
use crate::protocol::{
    ChainReply, Dialect, MarkerReassembler, MarkerReply, expand_call, next_chain_step,
    parse_chain_reply,
};

/// Interval between keepalive messages while the channel is idle.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Wait before re-sending a call the device answered with the busy sentence.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Wait between automatic reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Attempts after which automatic reconnection stops.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Connection lifecycle of one device session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum SessionState {
    #[strum(to_string = "disconnected")]
    Disconnected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "service_discovery")]
    ServiceDiscovery,
    #[strum(to_string = "ready")]
    Ready,
    /// A call is outstanding; further sends are deferred.
    #[strum(to_string = "busy")]
    Busy,
    /// A firmware upload is in flight.
    #[strum(to_string = "updating")]
    Updating,
}

/// The timers a session arms. The runner owns the actual deadlines.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum SessionTimer {
    #[strum(to_string = "keepalive")]
    Keepalive,
    #[strum(to_string = "busy_retry")]
    BusyRetry,
    #[strum(to_string = "chain_pause")]
    ChainPause,
    #[strum(to_string = "reconnect")]
    Reconnect,
    #[strum(to_string = "reboot_fallback")]
    RebootFallback,
}

/// Everything that can happen to a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The user (or the reconnect timer) asked for a connection.
    ConnectRequested,
    /// The transport-level connection is established.
    Connected,
    /// Notifications are enabled; the channel is usable.
    Subscribed,
    /// Connecting failed before the channel became usable. A fatal
    /// failure means the device lacks the expected endpoints, so
    /// retrying the same device cannot succeed.
    ConnectFailed { message: String, fatal: bool },
    /// The link dropped, for any reason.
    Disconnected,
    DisconnectRequested,
    Notified(GearNotification),
    SendRequested { message: String },
    TimerElapsed(SessionTimer),
    /// Result of a GATT battery read.
    BatteryRead { percent: Option<u8> },
    /// The previous write was acknowledged by the device.
    WriteAcked,
    StartOtaRequested { firmware: VerifiedFirmware },
}

/// Observable facts a session publishes as they change.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    State(SessionState),
    Version(String),
    /// Battery in bars, 0 through 4, from `BAT<n>` replies.
    BatteryBars(u8),
    /// Battery in percent, from the GATT battery service.
    BatteryPercent(u8),
    Charging(bool),
    OtaProgress(u8),
    /// A sentence meant for the user's eyes.
    Message(String),
}

/// Instructions for the runner.
#[derive(Debug, PartialEq)]
pub enum SessionEffect {
    Connect,
    Subscribe,
    Write(String),
    WriteChunk(Vec<u8>),
    ReadBattery,
    StartTimer { timer: SessionTimer, after: Duration },
    CancelTimer(SessionTimer),
    CancelAllTimers,
    Publish(StatusUpdate),
    /// The catalog was (re)loaded wholesale.
    CatalogLoaded(Vec<CommandInfo>),
    /// Commands whose run/availability state changed.
    CatalogChanged(Vec<CommandInfo>),
    CatalogCleared,
    Disconnect,
}

/// Pure per-device protocol state machine.
pub struct SessionCore {
    profile: GearProfile,
    device_id: String,
    definitions: Vec<CommandInfo>,
    shorthands: HashMap<String, String>,
    state: SessionState,
    catalog: GearCatalog,
    reassembler: MarkerReassembler,
    current_call: Option<String>,
    current_sub_call: Option<String>,
    call_queue: VecDeque<String>,
    pending_chain_message: Option<String>,
    deferred_sends: VecDeque<String>,
    version: Option<String>,
    reconnect_attempts: u32,
    auto_reconnect: bool,
    gave_up: bool,
    teardown_requested: bool,
    ota: Option<OtaUpload>,
}

impl SessionCore {
    #[must_use]
    pub fn new(
        profile: GearProfile,
        device_id: String,
        definitions: Vec<CommandInfo>,
        shorthands: HashMap<String, String>,
        auto_reconnect: bool,
    ) -> Self {
        Self {
            profile,
            device_id,
            definitions,
            shorthands,
            state: SessionState::Disconnected,
            catalog: GearCatalog::new(),
            reassembler: MarkerReassembler::new(),
            current_call: None,
            current_sub_call: None,
            call_queue: VecDeque::new(),
            pending_chain_message: None,
            deferred_sends: VecDeque::new(),
            version: None,
            reconnect_attempts: 0,
            auto_reconnect,
            gave_up: false,
            teardown_requested: false,
            ota: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn profile(&self) -> &GearProfile {
        &self.profile
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    #[must_use]
    pub fn catalog(&self) -> &GearCatalog {
        &self.catalog
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        if enabled {
            self.gave_up = false;
            self.reconnect_attempts = 0;
        }
    }

    /// Applies one event and returns the effects to execute, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        match event {
            SessionEvent::ConnectRequested => self.on_connect_requested(),
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::Subscribed => self.on_subscribed(),
            SessionEvent::ConnectFailed { message, fatal } => {
                if fatal {
                    self.on_protocol_mismatch(message)
                } else {
                    debug!(device_id = %self.device_id, %message, "connection attempt failed");
                    self.on_link_lost()
                }
            }
            SessionEvent::Disconnected => self.on_link_lost(),
            SessionEvent::DisconnectRequested => self.on_disconnect_requested(),
            SessionEvent::Notified(notification) => self.on_notified(&notification),
            SessionEvent::SendRequested { message } => self.on_send_requested(message),
            SessionEvent::TimerElapsed(timer) => self.on_timer_elapsed(timer),
            SessionEvent::BatteryRead { percent } => percent
                .map(|percent| vec![SessionEffect::Publish(StatusUpdate::BatteryPercent(percent))])
                .unwrap_or_default(),
            SessionEvent::WriteAcked => self.on_write_acked(),
            SessionEvent::StartOtaRequested { firmware } => self.on_start_ota(firmware),
        }
    }

    fn on_connect_requested(&mut self) -> Vec<SessionEffect> {
        if self.state != SessionState::Disconnected {
            return Vec::new();
        }
        // A user-initiated connect resets the throttle.
        self.gave_up = false;
        self.reconnect_attempts = 0;
        self.teardown_requested = false;
        let mut effects = self.set_state(SessionState::Connecting);
        effects.push(SessionEffect::Connect);
        effects
    }

    fn on_connected(&mut self) -> Vec<SessionEffect> {
        let mut effects = self.set_state(SessionState::ServiceDiscovery);
        effects.push(SessionEffect::Subscribe);
        effects
    }

    fn on_subscribed(&mut self) -> Vec<SessionEffect> {
        self.reconnect_attempts = 0;
        self.gave_up = false;
        let mut effects = self.set_state(SessionState::Ready);
        if self.profile.battery_reporting() == BatteryReporting::GattService {
            effects.push(SessionEffect::ReadBattery);
        }
        effects.extend(self.issue_call("VER"));
        effects
    }

    fn on_disconnect_requested(&mut self) -> Vec<SessionEffect> {
        self.teardown_requested = true;
        vec![SessionEffect::CancelAllTimers, SessionEffect::Disconnect]
    }

    /// The device is not the model its name promised. Not worth
    /// retrying; the user gets told what was missing instead.
    fn on_protocol_mismatch(&mut self, message: String) -> Vec<SessionEffect> {
        warn!(device_id = %self.device_id, %message, "device does not expose the expected endpoints");
        self.gave_up = true;
        let mut effects = vec![SessionEffect::Publish(StatusUpdate::Message(message))];
        effects.extend(self.on_link_lost());
        effects
    }

    fn on_link_lost(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();

        if let Some(upload) = &self.ota
            && upload.is_complete()
        {
            // The post-upload reboot; the update made it.
            effects.push(SessionEffect::CancelTimer(SessionTimer::RebootFallback));
            effects.push(SessionEffect::Publish(StatusUpdate::Message(
                "Firmware upload complete. The gear is restarting to apply the update.".to_string(),
            )));
        }
        self.ota = None;

        self.current_call = None;
        self.current_sub_call = None;
        self.call_queue.clear();
        self.pending_chain_message = None;
        self.deferred_sends.clear();
        self.reassembler = MarkerReassembler::new();
        self.version = None;
        // The state reaches Disconnected before the catalog clears,
        // never the reverse.
        effects.extend(self.set_state(SessionState::Disconnected));
        if !self.catalog.is_empty() {
            self.catalog.clear();
            effects.push(SessionEffect::CatalogCleared);
        }
        effects.push(SessionEffect::CancelAllTimers);

        if self.teardown_requested {
            self.teardown_requested = false;
            return effects;
        }
        if !self.auto_reconnect || self.gave_up {
            return effects;
        }
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
            self.gave_up = true;
            effects.push(SessionEffect::Publish(StatusUpdate::Message(
                "Connection lost, and reconnecting was attempted too many times. Giving up; \
                 check the gear and connect again when it is ready."
                    .to_string(),
            )));
        } else {
            effects.push(SessionEffect::StartTimer {
                timer: SessionTimer::Reconnect,
                after: RECONNECT_DELAY,
            });
        }
        effects
    }

    fn on_send_requested(&mut self, message: String) -> Vec<SessionEffect> {
        if !matches!(self.state, SessionState::Ready | SessionState::Busy) {
            debug!(device_id = %self.device_id, %message, state = %self.state, "dropping send while not connected");
            return Vec::new();
        }
        if self.current_call.is_some() {
            // One call on the wire at a time; the rest wait their turn.
            self.deferred_sends.push_back(message);
            return Vec::new();
        }
        self.issue_call(&message)
    }

    fn on_notified(&mut self, notification: &GearNotification) -> Vec<SessionEffect> {
        match notification.source() {
            NotifySource::Battery => {
                let percent = notification.payload().first().copied().unwrap_or(0);
                vec![SessionEffect::Publish(StatusUpdate::BatteryPercent(percent))]
            }
            NotifySource::Charging => {
                let charging = notification.text().contains("ON");
                vec![SessionEffect::Publish(StatusUpdate::Charging(charging))]
            }
            NotifySource::Command => match self.profile.dialect() {
                Dialect::LeadingMarker => self.on_marker_notification(&notification.text()),
                Dialect::TrailingMarker => self.on_chain_notification(&notification.text()),
            },
        }
    }

    fn on_marker_notification(&mut self, text: &str) -> Vec<SessionEffect> {
        let mut effects = Vec::new();

        if self.current_call.as_deref() == Some("VER") {
            effects.extend(self.accept_version(text));
            self.current_call = None;
            self.current_sub_call = None;
            // The older firmware has no battery service; poll right away.
            effects.extend(self.issue_call("BATT"));
            return effects;
        }

        let replies = {
            let catalog = &self.catalog;
            self.reassembler
                .feed(text, &|command| catalog.is_known(command))
        };
        for reply in replies {
            match reply {
                MarkerReply::Running { command, running } => {
                    let changed = self.catalog.set_running(&command, running);
                    if !changed.is_empty() {
                        effects.push(SessionEffect::CatalogChanged(changed));
                    }
                }
                MarkerReply::BatteryBars { level } => {
                    effects.push(SessionEffect::Publish(StatusUpdate::BatteryBars(level)));
                }
                MarkerReply::Unrecognised { message } => {
                    debug!(device_id = %self.device_id, %message, "unrecognised notification");
                }
            }
        }
        self.current_call = None;
        self.current_sub_call = None;
        effects.extend(self.after_call_cleared());
        effects
    }

    fn on_chain_notification(&mut self, text: &str) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        match parse_chain_reply(text) {
            ChainReply::Busy => {
                // The device will take the same call once it calms down.
                effects.push(SessionEffect::StartTimer {
                    timer: SessionTimer::BusyRetry,
                    after: BUSY_RETRY_DELAY,
                });
                return effects;
            }
            ChainReply::Version { version } => {
                effects.extend(self.accept_version(&version));
            }
            ChainReply::Pong => {
                if self.current_call.as_deref() != Some("PING") {
                    warn!(device_id = %self.device_id, "out-of-order keepalive response");
                }
            }
            ChainReply::Started => {
                debug!(device_id = %self.device_id, "device announced itself");
            }
            ChainReply::Begin => {
                if let Some(call) = self.current_call.clone() {
                    let changed = self.catalog.set_running(&call, true);
                    if !changed.is_empty() {
                        effects.push(SessionEffect::CatalogChanged(changed));
                    }
                }
                return effects;
            }
            ChainReply::End => {
                if let Some(step) = next_chain_step(&mut self.call_queue) {
                    if step.delay.is_zero() {
                        self.current_sub_call = Some(step.message.clone());
                        effects.push(SessionEffect::Write(step.message));
                    } else {
                        self.pending_chain_message = Some(step.message);
                        effects.push(SessionEffect::StartTimer {
                            timer: SessionTimer::ChainPause,
                            after: step.delay,
                        });
                    }
                    return effects;
                }
                if let Some(call) = self.current_call.clone() {
                    let changed = self.catalog.set_running(&call, false);
                    if !changed.is_empty() {
                        effects.push(SessionEffect::CatalogChanged(changed));
                    }
                }
            }
            ChainReply::Unrecognised { message } => {
                debug!(device_id = %self.device_id, %message, "unrecognised notification");
            }
        }
        self.current_call = None;
        self.current_sub_call = None;
        effects.extend(self.after_call_cleared());
        effects
    }

    fn on_timer_elapsed(&mut self, timer: SessionTimer) -> Vec<SessionEffect> {
        match timer {
            SessionTimer::Keepalive => {
                let mut effects = Vec::new();
                if self.current_call.is_none() && self.ota.is_none() && self.is_connected() {
                    effects.extend(self.issue_call(self.profile.keepalive_message()));
                }
                if self.is_connected() {
                    effects.push(SessionEffect::StartTimer {
                        timer: SessionTimer::Keepalive,
                        after: KEEPALIVE_INTERVAL,
                    });
                }
                effects
            }
            SessionTimer::BusyRetry => match self.current_sub_call.clone() {
                Some(sub_call) => vec![SessionEffect::Write(sub_call)],
                None => Vec::new(),
            },
            SessionTimer::ChainPause => match self.pending_chain_message.take() {
                Some(message) => {
                    self.current_sub_call = Some(message.clone());
                    vec![SessionEffect::Write(message)]
                }
                None => Vec::new(),
            },
            SessionTimer::Reconnect => {
                if self.state != SessionState::Disconnected {
                    return Vec::new();
                }
                let mut effects = self.set_state(SessionState::Connecting);
                effects.push(SessionEffect::Connect);
                effects
            }
            SessionTimer::RebootFallback => {
                if self.ota.take().is_some() {
                    let mut effects = vec![SessionEffect::Publish(StatusUpdate::Message(
                        "The firmware upload completed but the gear did not restart on its own. \
                         Power cycle it to finish the update."
                            .to_string(),
                    ))];
                    effects.extend(self.set_state(SessionState::Ready));
                    effects
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn on_write_acked(&mut self) -> Vec<SessionEffect> {
        let Some(upload) = &mut self.ota else {
            return Vec::new();
        };
        if let Some(chunk) = upload.next_chunk() {
            let progress = upload.progress_percent();
            return vec![
                SessionEffect::WriteChunk(chunk),
                SessionEffect::Publish(StatusUpdate::OtaProgress(progress)),
            ];
        }
        // Everything is on the wire; the device now verifies and reboots.
        vec![SessionEffect::StartTimer {
            timer: SessionTimer::RebootFallback,
            after: super::ota::REBOOT_FALLBACK_TIMEOUT,
        }]
    }

    fn on_start_ota(&mut self, firmware: VerifiedFirmware) -> Vec<SessionEffect> {
        if !self.profile.supports_ota() {
            return vec![SessionEffect::Publish(StatusUpdate::Message(
                "This gear model has no firmware update path.".to_string(),
            ))];
        }
        if self.ota.is_some() {
            return vec![SessionEffect::Publish(StatusUpdate::Message(
                "A firmware upload is already in flight.".to_string(),
            ))];
        }
        if !self.is_connected() {
            return vec![SessionEffect::Publish(StatusUpdate::Message(
                "Connect to the gear before starting a firmware update.".to_string(),
            ))];
        }
        let upload = OtaUpload::new(firmware);
        let announcement = upload.announcement();
        let progress = upload.progress_percent();
        self.ota = Some(upload);
        self.current_call = None;
        self.current_sub_call = None;
        self.call_queue.clear();
        self.deferred_sends.clear();
        let mut effects = self.set_state(SessionState::Updating);
        effects.push(SessionEffect::CancelTimer(SessionTimer::Keepalive));
        effects.push(SessionEffect::Write(announcement));
        effects.push(SessionEffect::Publish(StatusUpdate::OtaProgress(progress)));
        effects
    }

    fn accept_version(&mut self, version: &str) -> Vec<SessionEffect> {
        self.version = Some(version.to_string());
        let mut effects = vec![SessionEffect::Publish(StatusUpdate::Version(
            version.to_string(),
        ))];
        self.catalog.clear();
        for definition in self.definitions.clone() {
            self.catalog.add(definition);
        }
        if !self.catalog.is_empty() {
            effects.push(SessionEffect::CatalogLoaded(self.catalog.all().to_vec()));
        }
        effects.push(SessionEffect::StartTimer {
            timer: SessionTimer::Keepalive,
            after: KEEPALIVE_INTERVAL,
        });
        effects
    }

    fn issue_call(&mut self, message: &str) -> Vec<SessionEffect> {
        let call = expand_call(message, &self.shorthands);
        let mut effects = Vec::new();
        self.call_queue = call.rest;
        self.current_call = Some(call.logical.clone());
        self.current_sub_call = Some(call.first.clone());
        if call.expanded {
            // The device echoes sub-calls, not the shorthand, so mark the
            // logical command running ourselves.
            let changed = self.catalog.set_running(&call.logical, true);
            if !changed.is_empty() {
                effects.push(SessionEffect::CatalogChanged(changed));
            }
        }
        if self.profile.dialect() == Dialect::LeadingMarker {
            // Interrupted commands squash notifications; trust our own
            // bookkeeping over the device's reporting here.
            let changed = self.catalog.set_running(&call.logical, true);
            if !changed.is_empty() {
                effects.push(SessionEffect::CatalogChanged(changed));
            }
        }
        effects.extend(self.set_state(SessionState::Busy));
        effects.push(SessionEffect::Write(call.first));
        effects
    }

    fn after_call_cleared(&mut self) -> Vec<SessionEffect> {
        let mut effects = self.set_state(SessionState::Ready);
        if let Some(message) = self.deferred_sends.pop_front() {
            effects.extend(self.issue_call(&message));
        }
        effects
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::Ready | SessionState::Busy | SessionState::Updating
        )
    }

    fn set_state(&mut self, state: SessionState) -> Vec<SessionEffect> {
        if self.state == state {
            return Vec::new();
        }
        // Updating persists until the upload resolves one way or another.
        if self.state == SessionState::Updating && self.ota.is_some() {
            return Vec::new();
        }
        self.state = state;
        vec![SessionEffect::Publish(StatusUpdate::State(state))]
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gear::ota::verify_firmware;
    use crate::gear::profile::{GearModel, profile_for};

    fn definitions() -> Vec<CommandInfo> {
        vec![
            CommandInfo {
                name: "Slow Wag".to_string(),
                command: "TAILS1".to_string(),
                category: "relaxed".to_string(),
                duration: Duration::from_millis(11530),
                minimum_cooldown: Duration::from_millis(1000),
                group: 1,
                ..CommandInfo::default()
            },
            CommandInfo {
                name: "Happy Wag".to_string(),
                command: "TAILHM".to_string(),
                category: "excited".to_string(),
                duration: Duration::from_millis(3000),
                group: 1,
                ..CommandInfo::default()
            },
        ]
    }

    fn mitail_core() -> SessionCore {
        SessionCore::new(
            profile_for(GearModel::Mitail),
            "AA:BB".to_string(),
            definitions(),
            HashMap::new(),
            false,
        )
    }

    fn digitail_core() -> SessionCore {
        SessionCore::new(
            profile_for(GearModel::Digitail),
            "CC:DD".to_string(),
            definitions(),
            HashMap::new(),
            false,
        )
    }

    fn ready_mitail_core() -> SessionCore {
        let mut core = mitail_core();
        core.handle(SessionEvent::ConnectRequested);
        core.handle(SessionEvent::Connected);
        core.handle(SessionEvent::Subscribed);
        core.handle(SessionEvent::Notified(command_notification("VER 5.0.16")));
        core
    }

    fn command_notification(text: &str) -> GearNotification {
        GearNotification::new(NotifySource::Command, text.as_bytes().to_vec())
    }

    fn writes(effects: &[SessionEffect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::Write(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connection_walks_through_discovery_to_the_version_handshake() {
        let mut core = mitail_core();

        let connecting = core.handle(SessionEvent::ConnectRequested);
        assert!(connecting.contains(&SessionEffect::Connect));
        assert_eq!(SessionState::Connecting, core.state());

        let discovery = core.handle(SessionEvent::Connected);
        assert!(discovery.contains(&SessionEffect::Subscribe));
        assert_eq!(SessionState::ServiceDiscovery, core.state());

        let ready = core.handle(SessionEvent::Subscribed);
        assert_eq!(vec!["VER".to_string()], writes(&ready));
        assert!(ready.contains(&SessionEffect::ReadBattery));
        assert_eq!(SessionState::Busy, core.state());
    }

    #[test]
    fn version_reply_loads_the_catalog_and_starts_the_keepalive() {
        let mut core = mitail_core();
        core.handle(SessionEvent::ConnectRequested);
        core.handle(SessionEvent::Connected);
        core.handle(SessionEvent::Subscribed);

        let effects = core.handle(SessionEvent::Notified(command_notification("VER 5.0.16")));

        assert_eq!(Some("VER 5.0.16"), core.version());
        assert_eq!(2, core.catalog().len());
        assert!(effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::StartTimer {
                timer: SessionTimer::Keepalive,
                ..
            }
        )));
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, SessionEffect::CatalogLoaded(loaded) if loaded.len() == 2))
        );
        assert_eq!(SessionState::Ready, core.state());
    }

    #[test]
    fn digitail_version_reply_chains_into_a_battery_poll() {
        let mut core = digitail_core();
        core.handle(SessionEvent::ConnectRequested);
        core.handle(SessionEvent::Connected);
        core.handle(SessionEvent::Subscribed);

        let effects = core.handle(SessionEvent::Notified(command_notification("v5.0")));

        assert_eq!(Some("v5.0"), core.version());
        assert_eq!(vec!["BATT".to_string()], writes(&effects));
    }

    #[test]
    fn busy_reply_arms_a_retry_of_the_same_sub_call() {
        let mut core = ready_mitail_core();
        core.handle(SessionEvent::SendRequested {
            message: "TAILS1".to_string(),
        });

        let effects = core.handle(SessionEvent::Notified(command_notification(
            "System is busy now",
        )));
        assert!(effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::StartTimer {
                timer: SessionTimer::BusyRetry,
                after,
            } if *after == BUSY_RETRY_DELAY
        )));

        let retry = core.handle(SessionEvent::TimerElapsed(SessionTimer::BusyRetry));
        assert_eq!(vec!["TAILS1".to_string()], writes(&retry));
    }

    #[test]
    fn chain_end_advances_to_the_next_sub_call_after_a_pause() {
        let mut shorthands = HashMap::new();
        shorthands.insert("TAILHA".to_string(), "TAILS1;PAUSE 200;TAILHM".to_string());
        let mut core = SessionCore::new(
            profile_for(GearModel::Mitail),
            "AA:BB".to_string(),
            definitions(),
            shorthands,
            false,
        );
        core.handle(SessionEvent::ConnectRequested);
        core.handle(SessionEvent::Connected);
        core.handle(SessionEvent::Subscribed);
        core.handle(SessionEvent::Notified(command_notification("VER 5.0.16")));

        let first = core.handle(SessionEvent::SendRequested {
            message: "TAILHA".to_string(),
        });
        assert_eq!(vec!["TAILS1".to_string()], writes(&first));

        let after_end = core.handle(SessionEvent::Notified(command_notification("TAILS1 END")));
        assert!(after_end.iter().any(|effect| matches!(
            effect,
            SessionEffect::StartTimer {
                timer: SessionTimer::ChainPause,
                after,
            } if *after == Duration::from_millis(3000)
        )));

        let resumed = core.handle(SessionEvent::TimerElapsed(SessionTimer::ChainPause));
        assert_eq!(vec!["TAILHM".to_string()], writes(&resumed));

        core.handle(SessionEvent::Notified(command_notification("TAILHM END")));
        assert_eq!(SessionState::Ready, core.state());
    }

    #[test]
    fn sends_while_a_call_is_outstanding_are_deferred_not_dropped() {
        let mut core = ready_mitail_core();
        core.handle(SessionEvent::SendRequested {
            message: "TAILS1".to_string(),
        });

        let deferred = core.handle(SessionEvent::SendRequested {
            message: "TAILHM".to_string(),
        });
        assert!(deferred.is_empty());

        core.handle(SessionEvent::Notified(command_notification("TAILS1 BEGIN")));
        let finished = core.handle(SessionEvent::Notified(command_notification("TAILS1 END")));
        assert_eq!(vec!["TAILHM".to_string()], writes(&finished));
    }

    #[test]
    fn keepalive_fires_only_while_the_channel_is_idle() {
        let mut core = ready_mitail_core();

        let idle = core.handle(SessionEvent::TimerElapsed(SessionTimer::Keepalive));
        assert_eq!(vec!["PING".to_string()], writes(&idle));

        core.handle(SessionEvent::Notified(command_notification("PONG")));
        core.handle(SessionEvent::SendRequested {
            message: "TAILS1".to_string(),
        });
        let while_busy = core.handle(SessionEvent::TimerElapsed(SessionTimer::Keepalive));
        assert!(writes(&while_busy).is_empty());
        // The timer still re-arms for the next round.
        assert!(while_busy.iter().any(|effect| matches!(
            effect,
            SessionEffect::StartTimer {
                timer: SessionTimer::Keepalive,
                ..
            }
        )));
    }

    #[test]
    fn squashed_notifications_update_the_catalog_on_a_digitail() {
        let mut core = digitail_core();
        core.handle(SessionEvent::ConnectRequested);
        core.handle(SessionEvent::Connected);
        core.handle(SessionEvent::Subscribed);
        core.handle(SessionEvent::Notified(command_notification("v5.0")));
        core.handle(SessionEvent::Notified(command_notification("BAT3")));
        core.handle(SessionEvent::SendRequested {
            message: "TAILS1".to_string(),
        });

        core.handle(SessionEvent::Notified(command_notification(
            "END TAILS1BEGIN TAIL",
        )));
        let effects = core.handle(SessionEvent::Notified(command_notification("HM")));

        assert!(effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::CatalogChanged(changed)
                if changed.iter().any(|info| info.command == "TAILHM" && info.is_running)
        )));
        let slow_wag = core.catalog().find("TAILS1").unwrap();
        assert!(!slow_wag.is_running);
    }

    #[test]
    fn eleven_failed_attempts_produce_exactly_one_giving_up_message() {
        let mut core = SessionCore::new(
            profile_for(GearModel::Mitail),
            "AA:BB".to_string(),
            definitions(),
            HashMap::new(),
            true,
        );
        core.handle(SessionEvent::ConnectRequested);

        let mut messages = 0;
        for _ in 0..15 {
            core.handle(SessionEvent::TimerElapsed(SessionTimer::Reconnect));
            let effects = core.handle(SessionEvent::ConnectFailed {
                message: "adapter fell over".to_string(),
                fatal: false,
            });
            messages += effects
                .iter()
                .filter(|effect| {
                    matches!(
                        effect,
                        SessionEffect::Publish(StatusUpdate::Message(message))
                            if message.contains("too many")
                    )
                })
                .count();
        }

        assert_eq!(1, messages);
        assert_eq!(SessionState::Disconnected, core.state());
    }

    #[test]
    fn a_missing_endpoint_is_surfaced_once_and_never_retried() {
        let mut core = SessionCore::new(
            profile_for(GearModel::Mitail),
            "AA:BB".to_string(),
            definitions(),
            HashMap::new(),
            true,
        );
        core.handle(SessionEvent::ConnectRequested);

        let effects = core.handle(SessionEvent::ConnectFailed {
            message: "required endpoint `write characteristic` was not found".to_string(),
            fatal: true,
        });

        assert!(effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::Publish(StatusUpdate::Message(message))
                if message.contains("was not found")
        )));
        assert!(!effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::StartTimer {
                timer: SessionTimer::Reconnect,
                ..
            }
        )));
        assert_eq!(SessionState::Disconnected, core.state());
        // Any armed reconnect timer dies with the rest.
        assert!(effects.contains(&SessionEffect::CancelAllTimers));
    }

    #[test]
    fn the_state_reaches_disconnected_before_the_catalog_clears() {
        let mut core = ready_mitail_core();
        assert!(!core.catalog().is_empty());

        let effects = core.handle(SessionEvent::Disconnected);

        let state_position = effects
            .iter()
            .position(|effect| {
                matches!(
                    effect,
                    SessionEffect::Publish(StatusUpdate::State(SessionState::Disconnected))
                )
            })
            .expect("the state change is published");
        let clear_position = effects
            .iter()
            .position(|effect| matches!(effect, SessionEffect::CatalogCleared))
            .expect("the catalog clear is emitted");
        assert!(state_position < clear_position);
    }

    #[test]
    fn requested_disconnect_does_not_trigger_reconnection() {
        let mut core = SessionCore::new(
            profile_for(GearModel::Mitail),
            "AA:BB".to_string(),
            definitions(),
            HashMap::new(),
            true,
        );
        core.handle(SessionEvent::ConnectRequested);
        core.handle(SessionEvent::Connected);
        core.handle(SessionEvent::Subscribed);

        let teardown = core.handle(SessionEvent::DisconnectRequested);
        assert!(teardown.contains(&SessionEffect::Disconnect));

        let effects = core.handle(SessionEvent::Disconnected);
        assert!(!effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::StartTimer {
                timer: SessionTimer::Reconnect,
                ..
            }
        )));
    }

    #[test]
    fn firmware_chunks_are_paced_by_write_acknowledgements() {
        let mut core = ready_mitail_core();
        let data = vec![7u8; 10_000];
        let digest = {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            hasher.update(&data);
            hex::encode(hasher.finalize())
        };
        let firmware = verify_firmware(data, &digest).unwrap();

        let started = core.handle(SessionEvent::StartOtaRequested { firmware });
        assert_eq!(SessionState::Updating, core.state());
        assert_matches!(writes(&started).as_slice(), [announcement] if announcement.starts_with("OTA 10000 "));

        let mut chunks = 0;
        let mut last_progress = 0u8;
        loop {
            let effects = core.handle(SessionEvent::WriteAcked);
            let mut wrote_chunk = false;
            for effect in &effects {
                match effect {
                    SessionEffect::WriteChunk(chunk) => {
                        assert_eq!(500, chunk.len());
                        chunks += 1;
                        wrote_chunk = true;
                    }
                    SessionEffect::Publish(StatusUpdate::OtaProgress(progress)) => {
                        assert!(*progress >= last_progress);
                        last_progress = *progress;
                    }
                    _ => {}
                }
            }
            if !wrote_chunk {
                assert!(effects.iter().any(|effect| matches!(
                    effect,
                    SessionEffect::StartTimer {
                        timer: SessionTimer::RebootFallback,
                        ..
                    }
                )));
                break;
            }
        }

        assert_eq!(20, chunks);
        assert_eq!(99, last_progress);

        // The reboot disconnect closes out the update with a message.
        let effects = core.handle(SessionEvent::Disconnected);
        assert!(effects.iter().any(|effect| matches!(
            effect,
            SessionEffect::Publish(StatusUpdate::Message(message))
                if message.contains("restarting")
        )));
    }

    #[test]
    fn ota_on_unsupporting_gear_is_refused_with_a_message() {
        let mut core = SessionCore::new(
            profile_for(GearModel::EarGear),
            "EE:FF".to_string(),
            definitions(),
            HashMap::new(),
            false,
        );
        let firmware = verify_firmware(Vec::new(), "d41d8cd98f00b204e9800998ecf8427e").unwrap();

        let effects = core.handle(SessionEvent::StartOtaRequested { firmware });

        assert_matches!(
            effects.as_slice(),
            [SessionEffect::Publish(StatusUpdate::Message(message))]
                if message.contains("no firmware update path")
        );
    }
}
