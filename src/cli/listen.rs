use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio::sync::mpsc;

use crate::app::{GearFleet, assemble_fleet};
use crate::error::InteractionError;
use crate::gear::{GearHandle, GearStatus, GearTransport};
use crate::idle::spawn_idle_filler;
use crate::scheduler::{CommandDispatch, spawn_scheduler};
use crate::settings::SettingsStore;
use crate::terminal::TerminalClient;

use super::command::parse_duration;
use super::ui::{Painter, Spinner, StatusLineView};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Arguments for the `listen` command.
#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Only attach to the device with this id or advertised name.
    #[arg(long)]
    device: Option<String>,
    /// Stop after this many status events. If omitted, listen until Ctrl+C.
    #[arg(long)]
    max_events: Option<usize>,
    /// How long to scan for gear before connecting.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    scan_timeout: Duration,
}

impl ListenArgs {
    /// Creates listen arguments with an optional event limit.
    #[must_use]
    pub fn new(device: Option<String>, max_events: Option<usize>) -> Self {
        Self {
            device,
            max_events,
            scan_timeout: Duration::from_secs(5),
        }
    }
}

/// Executes the `listen` command.
pub(crate) async fn run<W>(
    transport: Arc<dyn GearTransport>,
    args: &ListenArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let settings = Arc::new(SettingsStore::load()?);
    run_with_store(transport, args, out, terminal_client, settings).await
}

/// Executes listen against an explicit settings store.
pub(crate) async fn run_with_store<W>(
    transport: Arc<dyn GearTransport>,
    args: &ListenArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    settings: Arc<SettingsStore>,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let spinner = Spinner::new(terminal_client.stdout_is_terminal());

    let snapshot = settings.get();
    let fleet = spinner
        .show_while("Scanning and connecting...", || {
            assemble_fleet(
                Arc::clone(&transport),
                args.device.as_deref(),
                &snapshot,
                args.scan_timeout,
            )
        })
        .await?;

    let (scheduler, mut dispatches) = spawn_scheduler(fleet.aggregate());
    spawn_idle_filler(
        Arc::clone(&settings),
        fleet.connected(),
        scheduler.clone(),
        fleet.aggregate(),
    );

    writeln!(
        out,
        "{} {}",
        painter.heading("Listening on"),
        painter.value(format!("{} device(s)", fleet.handles().len()))
    )?;

    let mut events = merge_status_streams(fleet.handles());
    let mut seen = 0usize;
    let stop_reason = loop {
        if args.max_events.is_some_and(|limit| seen >= limit) {
            break "reached event limit";
        }
        tokio::select! {
            status = events.recv() => {
                let Some(status) = status else {
                    break "all sessions ended";
                };
                writeln!(out, "{}", StatusLineView::new(seen, &status, &painter))?;
                seen += 1;
            }
            dispatch = dispatches.recv() => {
                if let Some(dispatch) = dispatch {
                    forward_dispatch(&fleet, &dispatch).await;
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.map_err(|source| InteractionError::CtrlC { source })?;
                break "interrupted";
            }
        }
    };

    fleet.disconnect_all().await;
    writeln!(
        out,
        "\n{} {} {}",
        painter.heading("Stopped:"),
        painter.warning(stop_reason),
        painter.value(format!("- {seen} status event(s)"))
    )?;
    Ok(())
}

/// Routes one scheduler dispatch to every session it names.
pub(crate) async fn forward_dispatch(fleet: &GearFleet, dispatch: &CommandDispatch) {
    for device_id in dispatch.devices() {
        if let Some(handle) = fleet.handle_for(device_id) {
            handle.send(dispatch.command().command.clone()).await;
        }
    }
}

/// Funnels every session's status watch into one event stream. The
/// current snapshot is emitted first so each device shows up at least
/// once even when nothing changes afterwards.
fn merge_status_streams(handles: &[GearHandle]) -> mpsc::Receiver<GearStatus> {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    for handle in handles {
        let mut status = handle.status();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let snapshot = status.borrow_and_update().clone();
            if event_tx.send(snapshot).await.is_err() {
                return;
            }
            while status.changed().await.is_ok() {
                let snapshot = status.borrow_and_update().clone();
                if event_tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        });
    }
    event_rx
}
