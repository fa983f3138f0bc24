//! Persisted runtime policy.
//!
//! Settings live as one JSON document under the platform config
//! directory. Every mutation goes through [`SettingsStore::update`],
//! which persists first and then publishes the new value on a watch
//! channel so reactive components (reconnect policy, idle filler) pick
//! it up without polling.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::InteractionError;

const SETTINGS_FILE_NAME: &str = "settings.json";

const DEFAULT_IDLE_MIN_PAUSE_MS: u64 = 15_000;
const DEFAULT_IDLE_MAX_PAUSE_MS: u64 = 300_000;

/// User-adjustable behaviour shared across the whole application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether sessions reconnect on their own after a link drop.
    pub auto_reconnect: bool,
    /// Whether the idle filler may inject commands.
    pub idle_mode: bool,
    /// Categories the idle filler draws from.
    pub idle_categories: Vec<String>,
    /// Shortest pause the idle filler schedules after a command.
    pub idle_min_pause_ms: u64,
    /// Longest pause the idle filler schedules after a command.
    pub idle_max_pause_ms: u64,
    /// Extra command files enabled per device id, beyond the builtin one.
    pub enabled_command_files: HashMap<String, Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            idle_mode: false,
            idle_categories: Vec::new(),
            idle_min_pause_ms: DEFAULT_IDLE_MIN_PAUSE_MS,
            idle_max_pause_ms: DEFAULT_IDLE_MAX_PAUSE_MS,
            enabled_command_files: HashMap::new(),
        }
    }
}

impl Settings {
    /// The idle pause range with the bounds put back in order, so a
    /// hand-edited file cannot produce an empty sampling range.
    #[must_use]
    pub fn idle_pause_range_ms(&self) -> (u64, u64) {
        if self.idle_min_pause_ms <= self.idle_max_pause_ms {
            (self.idle_min_pause_ms, self.idle_max_pause_ms)
        } else {
            (self.idle_max_pause_ms, self.idle_min_pause_ms)
        }
    }
}

/// Persistent settings store with change notification.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: watch::Sender<Settings>,
}

impl SettingsStore {
    /// Loads settings from the default platform location, falling back
    /// to defaults when no file exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be read or parsed.
    pub fn load() -> Result<Self, InteractionError> {
        Self::load_from_path(default_settings_path())
    }

    /// Loads settings from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be read or parsed.
    pub fn load_from_path(path: PathBuf) -> Result<Self, InteractionError> {
        let settings = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|source| InteractionError::SettingsIo { source })?;
            serde_json::from_str(&raw)
                .map_err(|source| InteractionError::SettingsParse { source })?
        } else {
            debug!(path = %path.display(), "no settings file yet, using defaults");
            Settings::default()
        };

        let (current, _) = watch::channel(settings);
        Ok(Self { path, current })
    }

    /// The current settings value.
    #[must_use]
    pub fn get(&self) -> Settings {
        self.current.borrow().clone()
    }

    /// A receiver that observes every settings change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.current.subscribe()
    }

    /// Applies a mutation, persists the result, and notifies watchers.
    /// Nothing is published when persisting fails.
    ///
    /// # Errors
    ///
    /// Returns an error when the settings file cannot be written.
    pub fn update(
        &self,
        mutate: impl FnOnce(&mut Settings),
    ) -> Result<Settings, InteractionError> {
        let mut next = self.get();
        mutate(&mut next);
        self.save(&next)?;
        self.current.send_replace(next.clone());
        Ok(next)
    }

    fn save(&self, settings: &Settings) -> Result<(), InteractionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| InteractionError::SettingsIo { source })?;
        }
        let serialised = serde_json::to_string_pretty(settings)
            .map_err(|source| InteractionError::SettingsParse { source })?;
        fs::write(&self.path, serialised)
            .map_err(|source| InteractionError::SettingsIo { source })
    }
}

/// Where settings live for this platform and user.
#[must_use]
pub fn default_settings_path() -> PathBuf {
    let project_dirs = ProjectDirs::from("org", "TheTailCompany", "gearlink");
    let Some(project_dirs) = project_dirs else {
        return std::env::temp_dir().join("gearlink").join(SETTINGS_FILE_NAME);
    };
    project_dirs.config_dir().join(SETTINGS_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn unique_temp_path(file_name: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("gearlink-{file_name}-{suffix}.json"))
    }

    fn remove_if_exists(path: &Path) {
        if path.exists() {
            fs::remove_file(path).expect("temporary fixture file should be removable");
        }
    }

    #[test]
    fn a_missing_file_loads_as_defaults() {
        let path = unique_temp_path("settings-missing");
        remove_if_exists(&path);

        let store = SettingsStore::load_from_path(path).expect("defaults should load");

        assert_eq!(Settings::default(), store.get());
        assert!(store.get().auto_reconnect);
        assert!(!store.get().idle_mode);
    }

    #[test]
    fn updates_persist_and_reload() {
        let path = unique_temp_path("settings-roundtrip");
        remove_if_exists(&path);
        let store = SettingsStore::load_from_path(path.clone()).expect("defaults should load");

        store
            .update(|settings| {
                settings.idle_mode = true;
                settings.idle_categories = vec!["relaxed".to_string()];
            })
            .expect("update should persist");

        let reloaded =
            SettingsStore::load_from_path(path.clone()).expect("stored file should reload");
        assert!(reloaded.get().idle_mode);
        assert_eq!(vec!["relaxed".to_string()], reloaded.get().idle_categories);

        remove_if_exists(&path);
    }

    #[test]
    fn updates_notify_watchers() {
        let path = unique_temp_path("settings-watch");
        remove_if_exists(&path);
        let store = SettingsStore::load_from_path(path.clone()).expect("defaults should load");
        let mut watcher = store.subscribe();

        store
            .update(|settings| settings.auto_reconnect = false)
            .expect("update should persist");

        assert!(watcher.has_changed().expect("sender is alive"));
        assert!(!watcher.borrow_and_update().auto_reconnect);

        remove_if_exists(&path);
    }

    #[test]
    fn a_broken_file_is_reported_not_replaced() {
        let path = unique_temp_path("settings-broken");
        fs::write(&path, "not json").expect("fixture should write");

        let loaded = SettingsStore::load_from_path(path.clone());

        assert_matches!(loaded, Err(InteractionError::SettingsParse { .. }));
        remove_if_exists(&path);
    }

    #[test]
    fn inverted_pause_bounds_are_reordered() {
        let settings = Settings {
            idle_min_pause_ms: 60_000,
            idle_max_pause_ms: 10_000,
            ..Settings::default()
        };

        assert_eq!((10_000, 60_000), settings.idle_pause_range_ms());
    }
}
