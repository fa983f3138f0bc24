use derive_more::From;
use thiserror::Error;

use crate::crumpet::CommandFileError;
use crate::gear::OtaError;

/// Errors returned by BLE interaction operations.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("no supported gear named `{name}` was found during discovery")]
    NoMatchingDevice { name: String },
    #[error("device `{name}` does not advertise a known gear model")]
    UnknownModel { name: String },
    #[error("required endpoint `{endpoint}` ({uuid}) was not found on the connected device")]
    MissingEndpoint {
        endpoint: &'static str,
        uuid: &'static str,
    },
    #[error("the connection to `{device_id}` is no longer open")]
    ConnectionClosed { device_id: String },
    #[error("failed while waiting for Ctrl+C")]
    CtrlC { source: std::io::Error },
    #[error("failed while reading or writing persisted settings")]
    SettingsIo { source: std::io::Error },
    #[error("persisted settings are not valid JSON")]
    SettingsParse { source: serde_json::Error },
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// Errors returned when parsing fake gear fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level protocol errors wrapping module-specific error types.
#[derive(Debug, Error, From)]
pub enum GearError {
    #[error(transparent)]
    #[from(CommandFileError, Box<CommandFileError>)]
    CommandFile(Box<CommandFileError>),
    #[error(transparent)]
    #[from(OtaError, Box<OtaError>)]
    Ota(Box<OtaError>),
    #[error(transparent)]
    #[from(InteractionError, Box<InteractionError>)]
    Interaction(Box<InteractionError>),
}
