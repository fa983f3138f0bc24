//! Idle-mode filler.
//!
//! When nothing is queued and at least one device is connected, idle
//! mode keeps the gear alive by drawing a random command from the
//! configured categories and following it with a random pause. The
//! filler is purely reactive: it re-evaluates when settings change, when
//! the queue length changes, or when connectivity changes, and coalesces
//! whatever arrived in one loop turn into a single evaluation.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::aggregate::AggregateEntry;
use crate::catalog::CommandInfo;
use crate::scheduler::SchedulerHandle;
use crate::settings::{Settings, SettingsStore};

/// Whether the filler is allowed to inject right now.
#[must_use]
pub fn should_fill(settings: &Settings, connected_devices: usize, queue_len: usize) -> bool {
    settings.idle_mode
        && connected_devices > 0
        && queue_len == 0
        && !settings.idle_categories.is_empty()
}

/// Draws one command plus its follow-up pause from the merged catalog.
pub fn choose_fill<R: Rng>(
    entries: &[AggregateEntry],
    settings: &Settings,
    rng: &mut R,
) -> Option<(CommandInfo, Vec<String>, Duration)> {
    let candidates: Vec<&AggregateEntry> = entries
        .iter()
        .filter(|entry| {
            entry.command().is_available
                && settings.idle_categories.contains(&entry.command().category)
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let chosen = candidates[rng.gen_range(0..candidates.len())];
    let (min_pause_ms, max_pause_ms) = settings.idle_pause_range_ms();
    let pause = Duration::from_millis(rng.gen_range(min_pause_ms..=max_pause_ms));
    Some((
        chosen.command().clone(),
        chosen.devices().to_vec(),
        pause,
    ))
}

/// Spawns the idle filler task.
///
/// Connecting a device forces idle mode off, so gear never starts moving
/// unprompted the moment it comes in range. Turning idle mode off clears
/// whatever the filler had queued.
pub fn spawn_idle_filler(
    settings: Arc<SettingsStore>,
    mut connected: watch::Receiver<usize>,
    scheduler: SchedulerHandle,
    aggregate: watch::Receiver<Vec<AggregateEntry>>,
) {
    tokio::spawn(async move {
        let mut settings_rx = settings.subscribe();
        let mut queue_rx = scheduler.queue();
        let mut previous_idle = settings_rx.borrow().idle_mode;
        let mut previous_connected = *connected.borrow();

        loop {
            tokio::select! {
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = queue_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            // Coalesce everything that arrived this turn into one pass.
            let current_settings = settings_rx.borrow_and_update().clone();
            let connected_devices = *connected.borrow_and_update();
            let queue_len = queue_rx.borrow_and_update().len();

            if connected_devices > previous_connected && current_settings.idle_mode {
                debug!("device connected, forcing idle mode off");
                if let Err(error) = settings.update(|value| value.idle_mode = false) {
                    warn!(?error, "failed to persist idle mode change");
                }
                previous_connected = connected_devices;
                continue;
            }
            previous_connected = connected_devices;

            if previous_idle && !current_settings.idle_mode {
                scheduler.clear(None).await;
            }
            previous_idle = current_settings.idle_mode;

            if !should_fill(&current_settings, connected_devices, queue_len) {
                continue;
            }

            // The rng is not Send; keep it out of the awaits below.
            let fill = {
                let entries = aggregate.borrow().clone();
                let mut rng = rand::thread_rng();
                choose_fill(&entries, &current_settings, &mut rng)
            };
            let Some((command, devices, pause)) = fill else {
                debug!("idle mode is on but no command is available to fill with");
                continue;
            };

            debug!(command = %command.name, pause_ms = pause.as_millis(), "idle filler injecting");
            scheduler.push_command(command, devices).await;
            scheduler.push_pause(pause).await;
        }
    });
}
