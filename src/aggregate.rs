//! Cross-device command aggregation.
//!
//! Each connected device publishes its own catalog; the aggregation model
//! folds them into one list of logical commands for presentation and for
//! the idle filler. Two catalog entries from different devices merge when
//! they are equivalent (same name, wire command, category and group), even
//! if their durations differ.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::catalog::CommandInfo;

/// Catalog changes reported by device sessions.
#[derive(Debug)]
pub enum CatalogEvent {
    Connected {
        device_id: String,
    },
    Disconnected {
        device_id: String,
    },
    /// The device (re)loaded its command definitions.
    CommandsReplaced {
        device_id: String,
        commands: Vec<CommandInfo>,
    },
    CommandsCleared {
        device_id: String,
    },
    /// Run/availability flags changed on the named commands.
    StateChanged {
        device_id: String,
        changed: Vec<CommandInfo>,
    },
}

/// One logical command merged across devices.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    command: CommandInfo,
    devices: Vec<String>,
}

impl AggregateEntry {
    /// The merged command. Duration is the longest any contributing
    /// device reports, and the cooldown follows that same device.
    #[must_use]
    pub fn command(&self) -> &CommandInfo {
        &self.command
    }

    /// Devices contributing this command, in first-seen order.
    #[must_use]
    pub fn devices(&self) -> &[String] {
        &self.devices
    }
}

/// The merged view over every device's catalog.
#[derive(Debug, Default)]
pub struct AggregationModel {
    mirrors: HashMap<String, Vec<CommandInfo>>,
    connected: HashSet<String>,
    entries: Vec<AggregateEntry>,
}

impl AggregationModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current merged entries in stable order.
    #[must_use]
    pub fn entries(&self) -> &[AggregateEntry] {
        &self.entries
    }

    /// How many devices are currently connected.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Applies one catalog event and refreshes the affected entries.
    pub fn apply(&mut self, event: CatalogEvent) {
        match event {
            CatalogEvent::Connected { device_id } => {
                self.connected.insert(device_id);
                self.refresh_all();
            }
            CatalogEvent::Disconnected { device_id } => {
                self.connected.remove(&device_id);
                self.mirrors.remove(&device_id);
                self.refresh_all();
            }
            CatalogEvent::CommandsReplaced {
                device_id,
                commands,
            } => {
                self.mirrors.insert(device_id, commands);
                self.refresh_all();
            }
            CatalogEvent::CommandsCleared { device_id } => {
                self.mirrors.remove(&device_id);
                self.refresh_all();
            }
            CatalogEvent::StateChanged { device_id, changed } => {
                if let Some(mirror) = self.mirrors.get_mut(&device_id) {
                    for info in &changed {
                        if let Some(existing) = mirror
                            .iter_mut()
                            .find(|candidate| candidate.is_equivalent_to(info))
                        {
                            *existing = info.clone();
                        }
                    }
                } else {
                    debug!(%device_id, "state change for a device with no catalog");
                }
                // Run-state flips are the hot path; only the named
                // equivalence classes are re-merged.
                self.refresh_changed(&changed);
            }
        }
    }

    /// Picks a uniformly random available command from the given
    /// categories. An empty category set draws from the whole catalog.
    pub fn get_random<R: Rng>(&self, categories: &[String], rng: &mut R) -> Option<CommandInfo> {
        let candidates: Vec<&AggregateEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.command.is_available
                    && (categories.is_empty() || categories.contains(&entry.command.category))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..candidates.len());
        Some(candidates[index].command.clone())
    }

    fn refresh_all(&mut self) {
        let mut entries: Vec<AggregateEntry> = Vec::new();
        for (device_id, info) in self.contributions() {
            match entries
                .iter_mut()
                .find(|entry| entry.command.is_equivalent_to(info))
            {
                Some(entry) => Self::absorb(entry, device_id, info, &self.connected),
                None => entries.push(Self::seed(device_id, info, &self.connected)),
            }
        }
        self.entries = entries;
    }

    /// Re-merges only the equivalence classes named in `changed`,
    /// leaving every other entry (and the overall order) untouched.
    fn refresh_changed(&mut self, changed: &[CommandInfo]) {
        for sample in changed {
            let Some(index) = self
                .entries
                .iter()
                .position(|entry| entry.command.is_equivalent_to(sample))
            else {
                continue;
            };
            let mut merged: Option<AggregateEntry> = None;
            for (device_id, info) in self.contributions() {
                if !info.is_equivalent_to(sample) {
                    continue;
                }
                match &mut merged {
                    Some(entry) => Self::absorb(entry, device_id, info, &self.connected),
                    None => merged = Some(Self::seed(device_id, info, &self.connected)),
                }
            }
            match merged {
                Some(entry) => self.entries[index] = entry,
                None => {
                    self.entries.remove(index);
                }
            }
        }
    }

    /// Every (device, command) pair in stable device order.
    fn contributions(&self) -> impl Iterator<Item = (&String, &CommandInfo)> {
        let mut device_ids: Vec<&String> = self.mirrors.keys().collect();
        device_ids.sort();
        device_ids
            .into_iter()
            .flat_map(|device_id| self.mirrors[device_id].iter().map(move |info| (device_id, info)))
    }

    fn seed(device_id: &str, info: &CommandInfo, connected: &HashSet<String>) -> AggregateEntry {
        let mut command = info.clone();
        command.is_available = connected.contains(device_id) && info.is_available;
        AggregateEntry {
            command,
            devices: vec![device_id.to_string()],
        }
    }

    fn absorb(
        entry: &mut AggregateEntry,
        device_id: &str,
        info: &CommandInfo,
        connected: &HashSet<String>,
    ) {
        if !entry.devices.iter().any(|existing| existing == device_id) {
            entry.devices.push(device_id.to_string());
        }
        // The longest duration wins, and its cooldown travels with it.
        if info.duration > entry.command.duration {
            entry.command.duration = info.duration;
            entry.command.minimum_cooldown = info.minimum_cooldown;
        }
        entry.command.is_running |= info.is_running;
        if connected.contains(device_id) {
            entry.command.is_available |= info.is_available;
        }
    }
}

/// Spawns the single-writer aggregation task. Sessions feed it catalog
/// events; consumers watch the merged snapshot and the connected count.
#[must_use]
pub fn spawn_aggregator() -> (
    mpsc::Sender<CatalogEvent>,
    watch::Receiver<Vec<AggregateEntry>>,
    watch::Receiver<usize>,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<CatalogEvent>(64);
    let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
    let (connected_tx, connected_rx) = watch::channel(0usize);
    tokio::spawn(async move {
        let mut model = AggregationModel::new();
        while let Some(event) = event_rx.recv().await {
            model.apply(event);
            connected_tx.send_replace(model.connected_count());
            if snapshot_tx.send(model.entries().to_vec()).is_err() {
                break;
            }
        }
    });
    (event_tx, snapshot_rx, connected_rx)
}
