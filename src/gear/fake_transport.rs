use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use super::profile::{BatteryReporting, GearModel, model_for_advertised_name, profile_for};
use super::transport::{
    FoundGear, GearConnection, GearNotification, GearTransport, NotifySource,
};
use crate::error::{FixtureError, InteractionError};
use crate::protocol::Dialect;

const DEFAULT_FIRMWARE_VERSION: &str = "VER 5.0.16";
const DEFAULT_BATTERY_PERCENT: u8 = 80;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// Parsed fake scan fixture records.
///
/// Records are `;`-separated, each `adapter|device_id|local_name|rssi`
/// with `-` standing in for an unreported RSSI.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<FoundGear>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_scan_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Settings for constructing a fake gear transport.
#[derive(Debug, Builder)]
pub struct FakeGearConfig {
    scan_fixture: ScanFixture,
    #[builder(default)]
    discovery_delay: Duration,
    firmware_version: Option<String>,
    battery_percent: Option<u8>,
    /// Number of command writes answered with the busy sentence before
    /// the device starts cooperating.
    #[builder(default)]
    busy_replies: u32,
}

type InjectorMap = Arc<Mutex<HashMap<String, mpsc::Sender<GearNotification>>>>;

/// Fixture-backed transport used in tests and `--fake` CLI runs.
///
/// Connected fakes answer `VER`, keepalives and battery reads on their
/// own, echo run-state markers around command writes in the dialect of
/// the advertised model, and swallow firmware chunks until the announced
/// byte count arrives, at which point they drop the connection the way
/// rebooting hardware does.
pub struct FakeGearTransport {
    devices: Vec<FoundGear>,
    discovery_delay: Duration,
    firmware_version: String,
    battery_percent: u8,
    busy_replies: u32,
    injectors: InjectorMap,
}

impl FakeGearTransport {
    #[must_use]
    pub fn new(config: FakeGearConfig) -> Self {
        Self {
            devices: config.scan_fixture.into(),
            discovery_delay: config.discovery_delay,
            firmware_version: config
                .firmware_version
                .unwrap_or_else(|| DEFAULT_FIRMWARE_VERSION.to_string()),
            battery_percent: config.battery_percent.unwrap_or(DEFAULT_BATTERY_PERCENT),
            busy_replies: config.busy_replies,
            injectors: Arc::default(),
        }
    }

    /// Returns a handle that can push raw notifications into a device's
    /// stream once that device has been subscribed to.
    #[must_use]
    pub fn injector(&self, device_id: &str) -> FakeNotificationInjector {
        FakeNotificationInjector {
            device_id: device_id.to_string(),
            injectors: Arc::clone(&self.injectors),
        }
    }
}

/// Test handle for injecting notifications into a fake connection.
#[derive(Clone)]
pub struct FakeNotificationInjector {
    device_id: String,
    injectors: InjectorMap,
}

impl FakeNotificationInjector {
    /// Pushes one command-channel notification, as if the device had
    /// spoken. Returns `false` when the device is not subscribed.
    pub async fn notify_text(&self, text: &str) -> bool {
        self.notify(GearNotification::new(
            NotifySource::Command,
            text.as_bytes().to_vec(),
        ))
        .await
    }

    /// Pushes one raw notification on an arbitrary source channel.
    pub async fn notify(&self, notification: GearNotification) -> bool {
        let sender = {
            let injectors = self.injectors.lock().expect("injector map poisoned");
            injectors.get(&self.device_id).cloned()
        };
        match sender {
            Some(sender) => sender.send(notification).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl GearTransport for FakeGearTransport {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<FoundGear>, InteractionError> {
        if !self.discovery_delay.is_zero() {
            sleep(self.discovery_delay).await;
        }
        Ok(self.devices.clone())
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn GearConnection>, InteractionError> {
        if !self.discovery_delay.is_zero() {
            sleep(self.discovery_delay).await;
        }
        let device = self
            .devices
            .iter()
            .find(|device| device.device_id() == device_id)
            .ok_or_else(|| InteractionError::NoMatchingDevice {
                name: device_id.to_string(),
            })?;
        let model = device
            .model()
            .ok_or_else(|| InteractionError::UnknownModel {
                name: device.local_name().to_string(),
            })?;
        Ok(Box::new(FakeGearConnection {
            device_id: device.device_id().to_string(),
            model,
            firmware_version: self.firmware_version.clone(),
            battery_percent: self.battery_percent,
            busy_replies_left: self.busy_replies,
            notify_tx: None,
            injectors: Arc::clone(&self.injectors),
            ota_bytes_left: None,
        }))
    }
}

struct FakeGearConnection {
    device_id: String,
    model: GearModel,
    firmware_version: String,
    battery_percent: u8,
    busy_replies_left: u32,
    notify_tx: Option<mpsc::Sender<GearNotification>>,
    injectors: InjectorMap,
    ota_bytes_left: Option<usize>,
}

impl FakeGearConnection {
    async fn notify_text(&self, text: &str) {
        if let Some(sender) = &self.notify_tx {
            let _ = sender
                .send(GearNotification::new(
                    NotifySource::Command,
                    text.as_bytes().to_vec(),
                ))
                .await;
        }
    }

    async fn answer_command(&mut self, message: &str) {
        let profile = profile_for(self.model);
        match message {
            "VER" => {
                let version = self.firmware_version.clone();
                self.notify_text(&version).await;
            }
            "PING" => {
                self.notify_text("PONG").await;
            }
            "BATT" => {
                let bars = (self.battery_percent / 25).min(4);
                self.notify_text(&format!("BAT{bars}")).await;
            }
            command => {
                if self.busy_replies_left > 0 {
                    self.busy_replies_left -= 1;
                    self.notify_text("System is busy now").await;
                    return;
                }
                match profile.dialect() {
                    Dialect::LeadingMarker => {
                        self.notify_text(&format!("BEGIN {command}")).await;
                        self.notify_text(&format!("END {command}")).await;
                    }
                    Dialect::TrailingMarker => {
                        self.notify_text(&format!("{command} BEGIN")).await;
                        self.notify_text(&format!("{command} END")).await;
                    }
                }
            }
        }
    }

    fn drop_connection(&mut self) {
        self.notify_tx = None;
        let mut injectors = self.injectors.lock().expect("injector map poisoned");
        injectors.remove(&self.device_id);
    }
}

#[async_trait]
impl GearConnection for FakeGearConnection {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn model(&self) -> GearModel {
        self.model
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<GearNotification>, InteractionError> {
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        self.notify_tx = Some(tx.clone());
        let mut injectors = self.injectors.lock().expect("injector map poisoned");
        injectors.insert(self.device_id.clone(), tx);
        Ok(rx)
    }

    async fn write(&mut self, payload: &[u8]) -> Result<(), InteractionError> {
        if self.notify_tx.is_none() {
            return Err(InteractionError::ConnectionClosed {
                device_id: self.device_id.clone(),
            });
        }

        if let Some(bytes_left) = self.ota_bytes_left {
            let remaining = bytes_left.saturating_sub(payload.len());
            debug!(device_id = %self.device_id, remaining, "fake firmware chunk received");
            if remaining == 0 {
                // Firmware complete; a real device reboots and drops the link.
                self.drop_connection();
            } else {
                self.ota_bytes_left = Some(remaining);
            }
            return Ok(());
        }

        let message = String::from_utf8_lossy(payload).into_owned();
        if let Some(announcement) = message.strip_prefix("OTA ") {
            let expected = announcement
                .split(' ')
                .next()
                .and_then(|length| length.parse::<usize>().ok())
                .unwrap_or(0);
            self.ota_bytes_left = Some(expected);
            return Ok(());
        }
        self.answer_command(&message).await;
        Ok(())
    }

    async fn read_battery_percent(&mut self) -> Result<Option<u8>, InteractionError> {
        let profile = profile_for(self.model);
        match profile.battery_reporting() {
            BatteryReporting::GattService => Ok(Some(self.battery_percent)),
            BatteryReporting::CommandChannelBars => Ok(None),
        }
    }

    async fn disconnect(&mut self) -> Result<(), InteractionError> {
        self.drop_connection();
        Ok(())
    }
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<FoundGear>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<FoundGear, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let rssi = if fields[3] == "-" {
        None
    } else {
        Some(fields[3].parse::<i16>()?)
    };

    Ok(FoundGear::new(
        fields[0].to_string(),
        fields[1].to_string(),
        fields[2].to_string(),
        rssi,
        model_for_advertised_name(fields[2]),
    ))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn transport_for(fixture: &str) -> FakeGearTransport {
        let config = FakeGearConfig::builder()
            .scan_fixture(fixture.parse().expect("fixture should parse"))
            .build();
        FakeGearTransport::new(config)
    }

    #[rstest]
    #[case("hci0|AA:BB|mitail|-43", 1)]
    #[case("hci0|AA:BB|mitail|-43;hci0|CC:DD|EG2|-55", 2)]
    fn scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let devices = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, devices.len());
    }

    #[test]
    fn scan_fixture_rejects_invalid_field_count() {
        assert_matches!(
            parse_scan_fixture("hci0|AA:BB|mitail"),
            Err(FixtureError::InvalidRecordFieldCount)
        );
    }

    #[test]
    fn scan_records_resolve_models_from_local_names() {
        let devices = parse_scan_fixture("hci0|AA:BB|mitail|-43;hci0|CC:DD|Speaker|-50")
            .expect("fixture should parse");

        assert_eq!(Some(GearModel::Mitail), devices[0].model());
        assert_eq!(None, devices[1].model());
    }

    #[tokio::test]
    async fn connecting_to_an_unsupported_device_fails() {
        let transport = transport_for("hci0|AA:BB|Speaker|-50");

        let result = transport.connect("AA:BB").await.map(|_| ());

        assert_matches!(result, Err(InteractionError::UnknownModel { name }) if name == "Speaker");
    }

    #[tokio::test]
    async fn connected_fake_answers_version_and_echoes_markers() {
        let transport = transport_for("hci0|AA:BB|mitail|-43");
        let mut connection = transport.connect("AA:BB").await.expect("should connect");
        let mut notifications = connection.subscribe().await.expect("should subscribe");

        connection.write(b"VER").await.expect("write should work");
        connection.write(b"TAILS1").await.expect("write should work");

        let version = notifications.recv().await.expect("version reply");
        assert_eq!(DEFAULT_FIRMWARE_VERSION, version.text());
        let begin = notifications.recv().await.expect("begin marker");
        assert_eq!("TAILS1 BEGIN", begin.text());
        let end = notifications.recv().await.expect("end marker");
        assert_eq!("TAILS1 END", end.text());
    }

    #[tokio::test]
    async fn firmware_upload_drops_the_connection_when_complete() {
        let transport = transport_for("hci0|AA:BB|mitail|-43");
        let mut connection = transport.connect("AA:BB").await.expect("should connect");
        let mut notifications = connection.subscribe().await.expect("should subscribe");

        connection
            .write(b"OTA 1000 d41d8cd98f00b204e9800998ecf8427e")
            .await
            .expect("announcement should work");
        connection.write(&[0u8; 500]).await.expect("chunk 1");
        connection.write(&[0u8; 500]).await.expect("chunk 2");

        assert_eq!(None, notifications.recv().await);
        assert_matches!(
            connection.write(b"PING").await,
            Err(InteractionError::ConnectionClosed { .. })
        );
    }
}
