use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::catalog::CatalogArgs;
use crate::cli::listen::ListenArgs;
use crate::cli::scan::ScanArgs;
use crate::cli::send::SendArgs;
use crate::error::{CliConfigError, FixtureError};
use crate::gear::{FakeGearConfig, ScanFixture};

/// Command-line options for the gear control tool.
#[derive(Debug, Parser)]
#[command(name = "gearlink", about = "Drive animatronic wearable gear over BLE.")]
pub struct Args {
    /// Telemetry log level override. Falls back to `RUST_LOG`, then `warn`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Uses the simulated gear transport with fixture-driven discovery.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `adapter|device_id|local_name|rssi;...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Firmware version string the simulated gear answers `VER` with.
    #[arg(long, global = true, requires = "fake")]
    fake_version: Option<String>,
    /// Battery percentage the simulated gear reports.
    #[arg(long, global = true, requires = "fake")]
    fake_battery: Option<u8>,
    /// Command writes answered with the busy sentence before the fake cooperates.
    #[arg(long, global = true, requires = "fake")]
    fake_busy_replies: Option<u32>,
    /// Artificial fake discovery delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use gearlink::{Args, Command, ScanArgs};
    ///
    /// let args = Args::new(Command::Scan(ScanArgs::new(None)));
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            fake: false,
            fake_scan: None,
            fake_version: None,
            fake_battery: None,
            fake_busy_replies: None,
            fake_discovery_delay: None,
            command,
        }
    }

    /// Enables fake transport mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            firmware_version,
            battery_percent,
            busy_replies,
            discovery_delay,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_version = firmware_version;
        self.fake_battery = battery_percent;
        self.fake_busy_replies = Some(busy_replies);
        self.fake_discovery_delay = Some(discovery_delay);
        self
    }

    /// The requested telemetry log level, when one was given.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Splits parsed CLI arguments into command and optional fake-transport settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI transport configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            log_level: _,
            fake,
            fake_scan,
            fake_version,
            fake_battery,
            fake_busy_replies,
            fake_discovery_delay,
            command,
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                firmware_version: fake_version,
                battery_percent: fake_battery,
                busy_replies: fake_busy_replies.unwrap_or(0),
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake transport arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    firmware_version: Option<String>,
    battery_percent: Option<u8>,
    #[builder(default)]
    busy_replies: u32,
    #[builder(default)]
    discovery_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_transport_config(self) -> FakeGearConfig {
        let Self {
            scan_fixture,
            firmware_version,
            battery_percent,
            busy_replies,
            discovery_delay,
        } = self;

        FakeGearConfig::builder()
            .scan_fixture(scan_fixture)
            .maybe_firmware_version(firmware_version)
            .maybe_battery_percent(battery_percent)
            .busy_replies(busy_replies)
            .discovery_delay(discovery_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for advertising gear and list what was found.
    Scan(ScanArgs),
    /// Connect to discovered gear and stream session status until stopped.
    Listen(ListenArgs),
    /// Queue one or more commands, dispatch them, and wait for the queue to drain.
    Send(SendArgs),
    /// Connect to discovered gear and print the merged command catalog.
    Catalog(CatalogArgs),
}

/// Telemetry log level selectable from the command line.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fake_mode_requires_scan_fixture() {
        let result = Args::try_parse_from(["gearlink", "--fake", "scan"]);

        let error = result.expect_err("missing --fake-scan should fail argument parsing");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_fixture_flags_require_fake_mode() {
        let result = Args::try_parse_from(["gearlink", "--fake-version", "VER 5.0.16", "scan"]);

        let error = result.expect_err("fake fixture flags should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_scan_requires_fake_mode() {
        let result =
            Args::try_parse_from(["gearlink", "--fake-scan", "hci0|AA:BB|mitail|-43", "scan"]);

        let error = result.expect_err("--fake-scan should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_mode_builds_fake_settings() {
        let cli = Args::try_parse_from([
            "gearlink",
            "--fake",
            "--fake-scan",
            "hci0|AA:BB|mitail|-43",
            "scan",
        ])
        .expect("valid fake arguments should parse");

        let (command, fake_args) = cli
            .into_command_and_fake_args()
            .expect("valid fake arguments should resolve fake settings");
        assert_matches!(command, Command::Scan(_));
        assert_matches!(fake_args, Some(_));
    }

    #[test]
    fn log_level_parses_and_maps_to_a_filter() {
        let cli = Args::try_parse_from(["gearlink", "--log-level", "debug", "scan"])
            .expect("log level should parse");

        assert_eq!(Some(LogLevel::Debug), cli.log_level());
        assert_eq!(
            LevelFilter::DEBUG,
            cli.log_level().expect("present").as_level_filter()
        );
    }

    #[test]
    fn discovery_delay_accepts_humantime_values() {
        let cli = Args::try_parse_from([
            "gearlink",
            "--fake",
            "--fake-scan",
            "hci0|AA:BB|mitail|-43",
            "--fake-discovery-delay",
            "250ms",
            "scan",
        ])
        .expect("humantime delay should parse");

        assert_eq!(Some(Duration::from_millis(250)), cli.fake_discovery_delay);
    }
}
