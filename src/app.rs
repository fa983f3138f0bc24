use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::timeout;
use tracing::instrument;

use crate::aggregate::{AggregateEntry, CatalogEvent, spawn_aggregator};
use crate::cli::{Command, FakeArgs, LogLevel};
use crate::crumpet;
use crate::error::{GearError, InteractionError};
use crate::gear::{
    BtleplugTransport, FakeGearTransport, FoundGear, GearHandle, GearStatus, GearTransport,
    SessionCore, profile_for, spawn_session,
};
use crate::settings::Settings;
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};
use tokio::sync::{mpsc, watch};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Creates a transport backed by the real BLE stack.
///
/// # Errors
///
/// Returns an error when the BLE manager cannot be initialised.
pub async fn real_gear_transport() -> Result<Arc<dyn GearTransport>, InteractionError> {
    Ok(Arc::new(BtleplugTransport::new().await?))
}

/// Creates a transport backed by simulated gear fixtures.
#[must_use]
pub fn fake_gear_transport(fake_args: FakeArgs) -> Arc<dyn GearTransport> {
    Arc::new(FakeGearTransport::new(fake_args.into_transport_config()))
}

/// Filters scan results down to supported gear, optionally to devices
/// matched by id or advertised name.
pub(crate) fn select_gear(
    found: Vec<FoundGear>,
    selector: Option<&str>,
) -> Result<Vec<FoundGear>, InteractionError> {
    let matching: Vec<FoundGear> = found
        .into_iter()
        .filter(|device| device.model().is_some())
        .filter(|device| {
            selector.is_none_or(|wanted| {
                device.device_id() == wanted || device.local_name() == wanted
            })
        })
        .collect();
    if matching.is_empty() {
        return Err(InteractionError::NoMatchingDevice {
            name: selector.unwrap_or("any supported gear").to_string(),
        });
    }
    Ok(matching)
}

/// Builds and spawns a session for one discovered device, loading the
/// command file the settings enable for it (or the model's builtin).
pub(crate) fn start_session(
    transport: Arc<dyn GearTransport>,
    found: &FoundGear,
    settings: &Settings,
    catalog_events: mpsc::Sender<CatalogEvent>,
) -> Result<GearHandle, GearError> {
    let model = found
        .model()
        .ok_or_else(|| InteractionError::UnknownModel {
            name: found.local_name().to_string(),
        })?;
    let profile = profile_for(model);
    let file_name = settings
        .enabled_command_files
        .get(found.device_id())
        .and_then(|files| files.first())
        .map_or(profile.default_command_file(), String::as_str);
    let file = crumpet::load_builtin(file_name)?;
    let core = SessionCore::new(
        profile,
        found.device_id().to_string(),
        file.commands(),
        file.shorthands(),
        settings.auto_reconnect,
    );
    Ok(spawn_session(
        transport,
        core,
        found.local_name().to_string(),
        catalog_events,
    ))
}

/// Every session spawned for one CLI invocation, plus the shared
/// aggregation outputs.
pub(crate) struct GearFleet {
    handles: Vec<GearHandle>,
    aggregate: watch::Receiver<Vec<AggregateEntry>>,
    connected: watch::Receiver<usize>,
}

impl GearFleet {
    pub(crate) fn handles(&self) -> &[GearHandle] {
        &self.handles
    }

    pub(crate) fn handle_for(&self, device_id: &str) -> Option<&GearHandle> {
        self.handles
            .iter()
            .find(|handle| handle.device_id() == device_id)
    }

    pub(crate) fn aggregate(&self) -> watch::Receiver<Vec<AggregateEntry>> {
        self.aggregate.clone()
    }

    pub(crate) fn connected(&self) -> watch::Receiver<usize> {
        self.connected.clone()
    }

    pub(crate) async fn disconnect_all(&self) {
        for handle in &self.handles {
            handle.disconnect().await;
        }
    }
}

/// Scans, connects to every matching device, and waits for the sessions
/// to come up.
#[instrument(skip(transport, settings), level = "info", fields(?selector))]
pub(crate) async fn assemble_fleet(
    transport: Arc<dyn GearTransport>,
    selector: Option<&str>,
    settings: &Settings,
    scan_timeout: Duration,
) -> Result<GearFleet> {
    let found = transport.scan(scan_timeout).await?;
    let selected = select_gear(found, selector)?;

    let (catalog_events, aggregate, connected) = spawn_aggregator();
    let mut handles = Vec::with_capacity(selected.len());
    for device in &selected {
        let handle = start_session(
            Arc::clone(&transport),
            device,
            settings,
            catalog_events.clone(),
        )?;
        handle.connect().await;
        handles.push(handle);
    }
    for handle in &handles {
        let mut status = handle.status();
        timeout(CONNECT_TIMEOUT, status.wait_for(GearStatus::is_connected))
            .await
            .with_context(|| format!("timed out connecting to `{}`", handle.device_id()))??;
    }

    Ok(GearFleet {
        handles,
        aggregate,
        connected,
    })
}

/// Runs the CLI command against the given transport.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = gearlink::Args::try_parse_from([
///     "gearlink",
///     "--fake",
///     "--fake-scan",
///     "hci0|AA:BB|mitail|-43",
///     "scan",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let transport = match maybe_fake_args {
///     Some(fake_args) => gearlink::fake_gear_transport(fake_args),
///     None => gearlink::real_gear_transport().await?,
/// };
/// let mut out = Vec::new();
/// gearlink::run(command, &mut out, transport).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction
/// fails, or output writing fails.
pub async fn run<W>(command: Command, out: &mut W, transport: Arc<dyn GearTransport>) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, out, transport, None).await
}

/// Runs the CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction
/// fails, or output writing fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    transport: Arc<dyn GearTransport>,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(command, out, &SystemTerminalClient, transport, log_level).await
}

/// Runs the CLI command with injected clients.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction
/// fails, or output writing fails.
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    transport: Arc<dyn GearTransport>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(command, out, terminal_client, transport, None).await
}

/// Runs the CLI command with injected clients and explicit telemetry settings.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl gearlink::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = gearlink::Args::try_parse_from([
///     "gearlink",
///     "--log-level",
///     "trace",
///     "--fake",
///     "--fake-scan",
///     "hci0|AA:BB|mitail|-43",
///     "scan",
/// ])?;
/// let log_level = args.log_level();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let transport = match maybe_fake_args {
///     Some(fake_args) => gearlink::fake_gear_transport(fake_args),
///     None => gearlink::real_gear_transport().await?,
/// };
/// let mut out = Vec::new();
/// gearlink::run_with_clients_and_log_level(
///     command,
///     &mut out,
///     &FakeTerminal,
///     transport,
///     log_level,
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction
/// fails, or output writing fails.
#[instrument(
    skip(out, terminal_client, transport),
    level = "info",
    fields(command = %command_name(&command), ?log_level)
)]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    transport: Arc<dyn GearTransport>,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "gearlink",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    match command {
        Command::Scan(args) => crate::cli::scan::run(transport, &args, out, terminal_client).await,
        Command::Listen(args) => {
            crate::cli::listen::run(transport, &args, out, terminal_client).await
        }
        Command::Send(args) => crate::cli::send::run(transport, &args, out, terminal_client).await,
        Command::Catalog(args) => {
            crate::cli::catalog::run(transport, &args, out, terminal_client).await
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Scan(_args) => "scan",
        Command::Listen(_args) => "listen",
        Command::Send(_args) => "send",
        Command::Catalog(_args) => "catalog",
    }
}
