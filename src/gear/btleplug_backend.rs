//! The real transport, backed by `btleplug`.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace};

use super::profile::{
    BATTERY_LEVEL_CHARACTERISTIC_UUID, BatteryReporting, GearModel, GearProfile,
    model_for_advertised_name, profile_for,
};
use super::transport::{
    FoundGear, GearConnection, GearNotification, GearTransport, NotifySource,
};
use crate::error::InteractionError;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

/// BLE transport talking to physical gear through the platform stack.
#[derive(Debug)]
pub struct BtleplugTransport {
    manager: Manager,
}

impl BtleplugTransport {
    /// Creates the real transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the platform BLE stack is unavailable.
    pub async fn new() -> Result<Self, InteractionError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    #[instrument(skip(self), level = "trace")]
    async fn adapters(&self) -> Result<Vec<AdapterHandle>, InteractionError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(InteractionError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        Ok(handles)
    }

    async fn find_peripheral(
        &self,
        device_id: &str,
    ) -> Result<Option<Peripheral>, InteractionError> {
        for handle in self.adapters().await? {
            for peripheral in handle.adapter.peripherals().await? {
                if peripheral.id().to_string() == device_id {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl GearTransport for BtleplugTransport {
    #[instrument(skip(self), level = "debug")]
    async fn scan(&self, timeout: Duration) -> Result<Vec<FoundGear>, InteractionError> {
        let adapters = self.adapters().await?;
        info!(adapter_count = adapters.len(), "starting BLE scan");

        for handle in &adapters {
            handle.adapter.start_scan(ScanFilter::default()).await?;
        }
        sleep(timeout).await;

        let mut found = Vec::new();
        for handle in &adapters {
            for peripheral in handle.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let Some(local_name) = properties.local_name else {
                    continue;
                };

                let model = model_for_advertised_name(&local_name);
                found.push(FoundGear::new(
                    handle.name.clone(),
                    peripheral.id().to_string(),
                    local_name,
                    properties.rssi,
                    model,
                ));
            }

            if let Err(error) = handle.adapter.stop_scan().await {
                debug!(?error, "failed to stop adapter scan cleanly");
            }
        }
        Ok(found)
    }

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self, device_id: &str) -> Result<Box<dyn GearConnection>, InteractionError> {
        let peripheral = self.find_peripheral(device_id).await?.ok_or_else(|| {
            InteractionError::NoMatchingDevice {
                name: device_id.to_string(),
            }
        })?;

        let properties = peripheral.properties().await?;
        let local_name = properties
            .and_then(|properties| properties.local_name)
            .unwrap_or_default();
        let model = model_for_advertised_name(&local_name).ok_or_else(|| {
            InteractionError::UnknownModel {
                name: local_name.clone(),
            }
        })?;
        let profile = profile_for(model);

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let write_characteristic = locate_characteristic(
            &peripheral,
            profile.write_characteristic_uuid(),
        )
        .ok_or(InteractionError::MissingEndpoint {
            endpoint: "write characteristic",
            uuid: profile.write_characteristic_uuid(),
        })?;
        let read_characteristic = locate_characteristic(
            &peripheral,
            profile.read_characteristic_uuid(),
        )
        .ok_or(InteractionError::MissingEndpoint {
            endpoint: "read characteristic",
            uuid: profile.read_characteristic_uuid(),
        })?;
        // The battery service is advertised separately and some firmware
        // revisions omit it, so its absence is tolerated.
        let battery_characteristic = match profile.battery_reporting() {
            BatteryReporting::GattService => {
                locate_characteristic(&peripheral, BATTERY_LEVEL_CHARACTERISTIC_UUID)
            }
            BatteryReporting::CommandChannelBars => None,
        };
        let charging_characteristic = profile
            .charging_characteristic_uuid()
            .and_then(|uuid| locate_characteristic(&peripheral, uuid));

        info!(device_id, model = %model, "connected to gear");
        Ok(Box::new(BtleplugConnection {
            device_id: device_id.to_string(),
            profile,
            peripheral,
            write_characteristic,
            read_characteristic,
            battery_characteristic,
            charging_characteristic,
        }))
    }
}

fn locate_characteristic(peripheral: &Peripheral, uuid: &str) -> Option<Characteristic> {
    peripheral
        .services()
        .iter()
        .flat_map(|service| service.characteristics.iter())
        .find(|characteristic| characteristic.uuid.to_string().eq_ignore_ascii_case(uuid))
        .cloned()
}

#[derive(Debug)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

struct BtleplugConnection {
    device_id: String,
    profile: GearProfile,
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    read_characteristic: Characteristic,
    battery_characteristic: Option<Characteristic>,
    charging_characteristic: Option<Characteristic>,
}

#[async_trait]
impl GearConnection for BtleplugConnection {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn model(&self) -> GearModel {
        self.profile.model()
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<GearNotification>, InteractionError> {
        self.peripheral.subscribe(&self.read_characteristic).await?;
        if let Some(characteristic) = &self.battery_characteristic {
            self.peripheral.subscribe(characteristic).await?;
        }
        if let Some(characteristic) = &self.charging_characteristic {
            self.peripheral.subscribe(characteristic).await?;
        }

        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let mut stream = self.peripheral.notifications().await?;
        let read_uuid = self.read_characteristic.uuid;
        let battery_uuid = self
            .battery_characteristic
            .as_ref()
            .map(|characteristic| characteristic.uuid);
        let charging_uuid = self
            .charging_characteristic
            .as_ref()
            .map(|characteristic| characteristic.uuid);
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let source = if notification.uuid == read_uuid {
                    NotifySource::Command
                } else if battery_uuid == Some(notification.uuid) {
                    NotifySource::Battery
                } else if charging_uuid == Some(notification.uuid) {
                    NotifySource::Charging
                } else {
                    continue;
                };

                if notification_tx
                    .send(GearNotification::new(source, notification.value))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            trace!("notification stream closed");
        });
        Ok(notification_rx)
    }

    async fn write(&mut self, payload: &[u8]) -> Result<(), InteractionError> {
        self.peripheral
            .write(&self.write_characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read_battery_percent(&mut self) -> Result<Option<u8>, InteractionError> {
        let Some(characteristic) = &self.battery_characteristic else {
            return Ok(None);
        };
        let payload = self.peripheral.read(characteristic).await?;
        Ok(payload.first().copied())
    }

    async fn disconnect(&mut self) -> Result<(), InteractionError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
