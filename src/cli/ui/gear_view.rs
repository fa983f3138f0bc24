use std::fmt::{self, Display, Formatter};

use crate::gear::{FoundGear, GearStatus};

use super::painter::Painter;
use super::table::Table;

/// Renders scan results as one row per discovered device.
pub(crate) struct ScanResultsView<'a> {
    devices: &'a [FoundGear],
    painter: &'a Painter,
}

impl<'a> ScanResultsView<'a> {
    pub(crate) fn new(devices: &'a [FoundGear], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for ScanResultsView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows = self
            .devices
            .iter()
            .map(|device| {
                let model = match device.model() {
                    Some(model) => self.painter.success(model.to_string()),
                    None => self.painter.muted("unsupported"),
                };
                vec![
                    device.adapter().to_string(),
                    self.painter.value(device.device_id()),
                    device.local_name().to_string(),
                    model,
                    format_rssi(device.rssi()),
                ]
            })
            .collect();
        let table = Table::grid(["adapter", "device_id", "name", "model", "rssi"], rows);
        write!(f, "{table}")
    }
}

/// Renders one session status snapshot as a single event line.
pub(crate) struct StatusLineView<'a> {
    index: usize,
    status: &'a GearStatus,
    painter: &'a Painter,
}

impl<'a> StatusLineView<'a> {
    pub(crate) fn new(index: usize, status: &'a GearStatus, painter: &'a Painter) -> Self {
        Self {
            index,
            status,
            painter,
        }
    }
}

impl Display for StatusLineView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let index_label = self.painter.muted(format!("[{:04}]", self.index));
        let state = self.status.state().to_string();
        let state_label = if self.status.is_connected() {
            self.painter.success(&state)
        } else {
            self.painter.warning(&state)
        };
        write!(
            f,
            "{index_label} {} {state_label}",
            self.painter.value(self.status.local_name()),
        )?;
        if let Some(version) = self.status.version() {
            write!(f, " {}", self.painter.muted(format!("version={version}")))?;
        }
        if let Some(battery) = self.status.battery() {
            write!(f, " {}", self.painter.muted(format!("battery={battery}")))?;
        }
        if let Some(charging) = self.status.charging() {
            write!(f, " {}", self.painter.muted(format!("charging={charging}")))?;
        }
        if let Some(progress) = self.status.ota_progress() {
            write!(f, " {}", self.painter.value(format!("ota={progress}%")))?;
        }
        if let Some(message) = self.status.last_message() {
            write!(f, " {}", self.painter.warning(format!("\"{message}\"")))?;
        }
        Ok(())
    }
}

fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "n/a".to_string(),
    }
}
