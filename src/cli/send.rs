use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::time::timeout;

use crate::gear::GearTransport;
use crate::scheduler::spawn_scheduler;
use crate::settings::SettingsStore;
use crate::terminal::TerminalClient;

use super::command::parse_duration;
use super::listen::forward_dispatch;
use super::ui::{Painter, QueueView, Spinner};

const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments for the `send` command.
#[derive(Debug, Args)]
pub struct SendArgs {
    /// Commands to queue, by name or wire string; `pause:<seconds>` inserts a wait.
    #[arg(required = true, num_args = 1..)]
    commands: Vec<String>,
    /// Only send to the device with this id or advertised name.
    #[arg(long)]
    device: Option<String>,
    /// How long to scan for gear before connecting.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    scan_timeout: Duration,
}

impl SendArgs {
    /// Creates send arguments for a batch of commands.
    #[must_use]
    pub fn new(commands: Vec<String>, device: Option<String>) -> Self {
        Self {
            commands,
            device,
            scan_timeout: Duration::from_secs(5),
        }
    }
}

/// Executes the `send` command: queue the batch, dispatch it, and wait
/// for the queue to drain.
pub(crate) async fn run<W>(
    transport: Arc<dyn GearTransport>,
    args: &SendArgs,
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

    // Batch entries resolve against the merged catalog, so it has to
    // exist before anything can be queued.
    let mut aggregate = fleet.aggregate();
    timeout(CATALOG_TIMEOUT, aggregate.wait_for(|entries| !entries.is_empty()))
        .await
        .context("no command catalog appeared")??;

    let (scheduler, mut dispatches) = spawn_scheduler(fleet.aggregate());
    let mut queue = scheduler.queue();
    scheduler.push_batch(args.commands.clone()).await;
    queue
        .changed()
        .await
        .context("scheduler stopped before accepting the batch")?;

    let snapshot = queue.borrow_and_update().clone();
    if snapshot.is_empty() && !snapshot.is_armed() {
        writeln!(
            out,
            "{}",
            painter.warning("Nothing queued; no entry matched the catalog.")
        )?;
        fleet.disconnect_all().await;
        return Ok(());
    }
    writeln!(out, "{}", painter.heading("Queued:"))?;
    writeln!(out, "{}", QueueView::new(&snapshot, &painter))?;

    let mut dispatched = 0usize;
    loop {
        tokio::select! {
            maybe = dispatches.recv() => {
                let Some(dispatch) = maybe else { break };
                forward_dispatch(&fleet, &dispatch).await;
                dispatched += 1;
                writeln!(
                    out,
                    "{} {} {}",
                    painter.success("sent"),
                    painter.value(&dispatch.command().name),
                    painter.muted(format!("to {}", dispatch.devices().join(", ")))
                )?;
            }
            changed = queue.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = queue.borrow_and_update().clone();
                if snapshot.is_empty() && !snapshot.is_armed() {
                    break;
                }
            }
        }
    }

    fleet.disconnect_all().await;
    writeln!(
        out,
        "\n{} {}",
        painter.heading("Done:"),
        painter.value(format!("{dispatched} command(s) dispatched"))
    )?;
    Ok(())
}
