use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::time::timeout;

use crate::gear::GearTransport;
use crate::settings::SettingsStore;
use crate::terminal::TerminalClient;

use super::command::parse_duration;
use super::ui::{CatalogView, Painter, Spinner};

const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments for the `catalog` command.
#[derive(Debug, Args)]
pub struct CatalogArgs {
    /// Only include the device with this id or advertised name.
    #[arg(long)]
    device: Option<String>,
    /// How long to scan for gear before connecting.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    scan_timeout: Duration,
}

impl CatalogArgs {
    /// Creates catalog arguments, optionally scoped to one device.
    #[must_use]
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            scan_timeout: Duration::from_secs(5),
        }
    }
}

/// Executes the `catalog` command.
pub(crate) async fn run<W>(
    transport: Arc<dyn GearTransport>,
    args: &CatalogArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let spinner = Spinner::new(terminal_client.stdout_is_terminal());
    let settings = SettingsStore::load()?.get();

    let fleet = spinner
        .show_while("Scanning and connecting...", || {
            crate::app::assemble_fleet(
                Arc::clone(&transport),
                args.device.as_deref(),
                &settings,
                args.scan_timeout,
            )
        })
        .await?;

    let mut aggregate = fleet.aggregate();
    let entries = timeout(
        CATALOG_TIMEOUT,
        aggregate.wait_for(|entries| !entries.is_empty()),
    )
    .await
    .context("no command catalog appeared")??
    .clone();

    writeln!(out, "{}", painter.heading("Merged catalog:"))?;
    writeln!(out, "{}", CatalogView::new(&entries, &painter))?;

    fleet.disconnect_all().await;
    Ok(())
}
