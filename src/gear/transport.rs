use std::time::Duration;

use async_trait::async_trait;
use strum_macros::Display;
use tokio::sync::mpsc;

use super::profile::GearModel;
use crate::error::InteractionError;

/// Which channel a notification arrived on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum NotifySource {
    /// The vendor command characteristic.
    #[strum(to_string = "command")]
    Command,
    /// The GATT battery level characteristic.
    #[strum(to_string = "battery")]
    Battery,
    /// The charging state characteristic, where present.
    #[strum(to_string = "charging")]
    Charging,
}

/// One raw notification from a connected device.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GearNotification {
    source: NotifySource,
    payload: Vec<u8>,
}

impl GearNotification {
    #[must_use]
    pub fn new(source: NotifySource, payload: Vec<u8>) -> Self {
        Self { source, payload }
    }

    #[must_use]
    pub fn source(&self) -> NotifySource {
        self.source
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text. The gear talks ASCII on the command channel.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A piece of gear seen during discovery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FoundGear {
    adapter: String,
    device_id: String,
    local_name: String,
    rssi: Option<i16>,
    model: Option<GearModel>,
}

impl FoundGear {
    #[must_use]
    pub fn new(
        adapter: String,
        device_id: String,
        local_name: String,
        rssi: Option<i16>,
        model: Option<GearModel>,
    ) -> Self {
        Self {
            adapter,
            device_id,
            local_name,
            rssi,
            model,
        }
    }

    /// Adapter the device was seen on.
    #[must_use]
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    /// Stable device identifier, typically the BLE address.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Advertised local name.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Signal strength at scan time, when reported.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// The product the advertised name resolved to, if any.
    #[must_use]
    pub fn model(&self) -> Option<GearModel> {
        self.model
    }
}

/// Discovery and connection establishment, real or fixture-backed.
#[async_trait]
pub trait GearTransport: Send + Sync {
    /// Scans for advertising gear for up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error when no adapter is available or scanning fails.
    async fn scan(&self, timeout: Duration) -> Result<Vec<FoundGear>, InteractionError>;

    /// Connects to a previously discovered device and negotiates the
    /// model's endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error when the device is gone, the connection fails, or
    /// a required endpoint is missing.
    async fn connect(&self, device_id: &str) -> Result<Box<dyn GearConnection>, InteractionError>;
}

/// One open connection to a piece of gear.
///
/// Writes resolve once the device has acknowledged the value, which is
/// what paces chunked firmware uploads. Connections live inside spawned
/// session tasks, so implementations must be shareable across threads.
#[async_trait]
pub trait GearConnection: Send + Sync {
    fn device_id(&self) -> &str;

    fn model(&self) -> GearModel;

    /// Subscribes to all notify characteristics the model exposes and
    /// returns the merged stream.
    ///
    /// # Errors
    ///
    /// Returns an error when enabling notifications fails.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<GearNotification>, InteractionError>;

    /// Writes one value to the command characteristic.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is closed or the write fails.
    async fn write(&mut self, payload: &[u8]) -> Result<(), InteractionError>;

    /// Reads the GATT battery level, on models that expose the service.
    ///
    /// # Errors
    ///
    /// Returns an error when the read itself fails.
    async fn read_battery_percent(&mut self) -> Result<Option<u8>, InteractionError>;

    /// Tears the connection down.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport rejects the disconnect.
    async fn disconnect(&mut self) -> Result<(), InteractionError>;
}
