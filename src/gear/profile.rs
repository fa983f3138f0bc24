use derive_more::Display;
use serde_with::SerializeDisplay;
use strum_macros::EnumIter;

use crate::protocol::Dialect;

/// Standard GATT battery level characteristic.
pub const BATTERY_LEVEL_CHARACTERISTIC_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";

const DIGITAIL_SERVICE_UUID: &str = "0000ffe0-0000-1000-8000-00805f9b34fb";
const DIGITAIL_RW_CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

const MITAIL_SERVICE_UUID: &str = "3af2108b-d066-42da-a7d4-55648fa0a9b6";
const MITAIL_READ_CHARACTERISTIC_UUID: &str = "c6612b64-0087-4974-939e-68968ef294b0";
const MITAIL_WRITE_CHARACTERISTIC_UUID: &str = "5bfd6484-ddee-4723-bfe6-b653372bbfd6";
const MITAIL_MINI_CHARGING_CHARACTERISTIC_UUID: &str = "5073792e-4fc0-45a0-b0a5-78b6c1756c91";

const EARGEAR_SERVICE_UUID: &str = "927dee04-ddd4-4582-8e42-69dc9fbfae66";
const EARGEAR_READ_CHARACTERISTIC_UUID: &str = "0b646a19-371e-4327-b169-9632d56c0e84";
const EARGEAR_WRITE_CHARACTERISTIC_UUID: &str = "05e026d8-b395-4416-9f8a-c00d6c3781b9";

/// The advertised local name used by the simulated gear fixture.
pub const FAKE_GEAR_LOCAL_NAME: &str = "FAKE";

/// The gear product lines this crate knows how to drive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, SerializeDisplay)]
pub enum GearModel {
    #[display("DIGITAiL")]
    Digitail,
    #[display("MiTail")]
    Mitail,
    #[display("MiTail Mini")]
    MitailMini,
    #[display("FlutterWings")]
    FlutterWings,
    #[display("EarGear")]
    EarGear,
    #[display("EarGear 2")]
    EarGear2,
    #[display("Simulated Gear")]
    Fake,
}

/// How a model reports battery charge.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum BatteryReporting {
    /// Polled over the command channel with `BATT`, answered as `BAT<n>`.
    #[display("command_channel_bars")]
    CommandChannelBars,
    /// Standard GATT battery service, reported in percent.
    #[display("gatt_service")]
    GattService,
}

/// Static per-model behaviour: endpoints, grammar and capabilities.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GearProfile {
    model: GearModel,
    service_uuid: &'static str,
    write_characteristic_uuid: &'static str,
    read_characteristic_uuid: &'static str,
    charging_characteristic_uuid: Option<&'static str>,
    dialect: Dialect,
    battery_reporting: BatteryReporting,
    keepalive_message: &'static str,
    supports_ota: bool,
    has_lights: bool,
    has_shutdown: bool,
    has_listening: bool,
    has_tilt: bool,
    default_command_file: &'static str,
}

impl GearProfile {
    #[must_use]
    pub fn model(&self) -> GearModel {
        self.model
    }

    /// The vendor service that carries the command channel.
    #[must_use]
    pub fn service_uuid(&self) -> &'static str {
        self.service_uuid
    }

    /// Characteristic commands are written to.
    #[must_use]
    pub fn write_characteristic_uuid(&self) -> &'static str {
        self.write_characteristic_uuid
    }

    /// Characteristic replies are notified on.
    #[must_use]
    pub fn read_characteristic_uuid(&self) -> &'static str {
        self.read_characteristic_uuid
    }

    /// Charging state characteristic, on models that expose one.
    #[must_use]
    pub fn charging_characteristic_uuid(&self) -> Option<&'static str> {
        self.charging_characteristic_uuid
    }

    /// The message grammar the model speaks.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn battery_reporting(&self) -> BatteryReporting {
        self.battery_reporting
    }

    /// The message sent every keepalive interval while the channel is idle.
    #[must_use]
    pub fn keepalive_message(&self) -> &'static str {
        self.keepalive_message
    }

    #[must_use]
    pub fn supports_ota(&self) -> bool {
        self.supports_ota
    }

    #[must_use]
    pub fn has_lights(&self) -> bool {
        self.has_lights
    }

    #[must_use]
    pub fn has_shutdown(&self) -> bool {
        self.has_shutdown
    }

    #[must_use]
    pub fn has_listening(&self) -> bool {
        self.has_listening
    }

    #[must_use]
    pub fn has_tilt(&self) -> bool {
        self.has_tilt
    }

    /// Name of the builtin command file shipped for this model.
    #[must_use]
    pub fn default_command_file(&self) -> &'static str {
        self.default_command_file
    }
}

/// Maps a BLE advertised name to the product it belongs to.
///
/// The names are exact; the hardware advertises fixed strings.
#[must_use]
pub fn model_for_advertised_name(local_name: &str) -> Option<GearModel> {
    match local_name {
        "(!)Tail1" => Some(GearModel::Digitail),
        "mitail" => Some(GearModel::Mitail),
        "minitail" => Some(GearModel::MitailMini),
        "flutter" => Some(GearModel::FlutterWings),
        "EarGear" => Some(GearModel::EarGear),
        "EG2" => Some(GearModel::EarGear2),
        FAKE_GEAR_LOCAL_NAME => Some(GearModel::Fake),
        _ => None,
    }
}

/// Returns the static behaviour profile for a model.
#[must_use]
pub fn profile_for(model: GearModel) -> GearProfile {
    match model {
        GearModel::Digitail => GearProfile {
            model,
            service_uuid: DIGITAIL_SERVICE_UUID,
            write_characteristic_uuid: DIGITAIL_RW_CHARACTERISTIC_UUID,
            read_characteristic_uuid: DIGITAIL_RW_CHARACTERISTIC_UUID,
            charging_characteristic_uuid: None,
            dialect: Dialect::LeadingMarker,
            battery_reporting: BatteryReporting::CommandChannelBars,
            keepalive_message: "BATT",
            supports_ota: false,
            has_lights: true,
            has_shutdown: false,
            has_listening: false,
            has_tilt: false,
            default_command_file: "digitail-builtin.crumpet",
        },
        GearModel::Mitail | GearModel::FlutterWings => GearProfile {
            model,
            service_uuid: MITAIL_SERVICE_UUID,
            write_characteristic_uuid: MITAIL_WRITE_CHARACTERISTIC_UUID,
            read_characteristic_uuid: MITAIL_READ_CHARACTERISTIC_UUID,
            charging_characteristic_uuid: None,
            dialect: Dialect::TrailingMarker,
            battery_reporting: BatteryReporting::GattService,
            keepalive_message: "PING",
            supports_ota: true,
            has_lights: true,
            has_shutdown: true,
            has_listening: false,
            has_tilt: false,
            default_command_file: "mitail-builtin.crumpet",
        },
        GearModel::MitailMini => GearProfile {
            model,
            service_uuid: MITAIL_SERVICE_UUID,
            write_characteristic_uuid: MITAIL_WRITE_CHARACTERISTIC_UUID,
            read_characteristic_uuid: MITAIL_READ_CHARACTERISTIC_UUID,
            charging_characteristic_uuid: Some(MITAIL_MINI_CHARGING_CHARACTERISTIC_UUID),
            dialect: Dialect::TrailingMarker,
            battery_reporting: BatteryReporting::GattService,
            keepalive_message: "PING",
            supports_ota: true,
            has_lights: true,
            has_shutdown: true,
            has_listening: false,
            has_tilt: false,
            default_command_file: "mitail-builtin.crumpet",
        },
        GearModel::EarGear => GearProfile {
            model,
            service_uuid: EARGEAR_SERVICE_UUID,
            write_characteristic_uuid: EARGEAR_WRITE_CHARACTERISTIC_UUID,
            read_characteristic_uuid: EARGEAR_READ_CHARACTERISTIC_UUID,
            charging_characteristic_uuid: None,
            dialect: Dialect::TrailingMarker,
            battery_reporting: BatteryReporting::GattService,
            keepalive_message: "PING",
            supports_ota: false,
            has_lights: false,
            has_shutdown: false,
            has_listening: true,
            has_tilt: false,
            default_command_file: "eargear-builtin.crumpet",
        },
        GearModel::EarGear2 => GearProfile {
            model,
            service_uuid: EARGEAR_SERVICE_UUID,
            write_characteristic_uuid: EARGEAR_WRITE_CHARACTERISTIC_UUID,
            read_characteristic_uuid: EARGEAR_READ_CHARACTERISTIC_UUID,
            charging_characteristic_uuid: None,
            dialect: Dialect::TrailingMarker,
            battery_reporting: BatteryReporting::GattService,
            keepalive_message: "PING",
            supports_ota: true,
            has_lights: false,
            has_shutdown: true,
            has_listening: true,
            has_tilt: true,
            default_command_file: "eargear-builtin.crumpet",
        },
        GearModel::Fake => GearProfile {
            model,
            service_uuid: MITAIL_SERVICE_UUID,
            write_characteristic_uuid: MITAIL_WRITE_CHARACTERISTIC_UUID,
            read_characteristic_uuid: MITAIL_READ_CHARACTERISTIC_UUID,
            charging_characteristic_uuid: None,
            dialect: Dialect::TrailingMarker,
            battery_reporting: BatteryReporting::GattService,
            keepalive_message: "PING",
            supports_ota: true,
            has_lights: true,
            has_shutdown: true,
            has_listening: true,
            has_tilt: true,
            default_command_file: "mitail-builtin.crumpet",
        },
    }
}
