use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;

use crate::gear::GearTransport;
use crate::terminal::TerminalClient;

use super::command::parse_duration;
use super::ui::{Painter, ScanResultsView, Spinner};

const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Arguments for the `scan` command.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// How long to scan before reporting (e.g. `5s`, `500ms`).
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    timeout: Duration,
}

impl ScanArgs {
    /// Creates scan arguments with an optional timeout override.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.unwrap_or(DEFAULT_SCAN_TIMEOUT),
        }
    }

    #[must_use]
    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Executes the `scan` command.
pub(crate) async fn run<W>(
    transport: Arc<dyn GearTransport>,
    args: &ScanArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let spinner = Spinner::new(terminal_client.stdout_is_terminal());

    let devices = spinner
        .show_while("Scanning for gear...", || transport.scan(args.timeout()))
        .await?;

    if devices.is_empty() {
        writeln!(out, "{}", painter.warning("No gear found."))?;
        return Ok(());
    }

    writeln!(out, "{}", painter.heading("Discovered gear:"))?;
    writeln!(out, "{}", ScanResultsView::new(&devices, &painter))?;
    Ok(())
}
