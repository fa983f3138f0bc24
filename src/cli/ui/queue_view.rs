use std::fmt::{self, Display, Formatter};

use crate::scheduler::{QueueEntry, QueueSnapshot};

use super::painter::Painter;
use super::table::Table;

/// Renders the scheduler queue with the armed head marked.
pub(crate) struct QueueView<'a> {
    snapshot: &'a QueueSnapshot,
    painter: &'a Painter,
}

impl<'a> QueueView<'a> {
    pub(crate) fn new(snapshot: &'a QueueSnapshot, painter: &'a Painter) -> Self {
        Self { snapshot, painter }
    }
}

impl Display for QueueView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.snapshot.is_empty() {
            return write!(f, "{}", self.painter.muted("queue is empty"));
        }

        let rows = self
            .snapshot
            .entries()
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let position = if index == 0 && self.snapshot.is_armed() {
                    let remaining = self
                        .snapshot
                        .head_remaining()
                        .map(|left| format!("{}s left", left.as_secs()))
                        .unwrap_or_default();
                    self.painter.success(format!("▶ {remaining}"))
                } else {
                    self.painter.muted(format!("{index}"))
                };
                let (what, hold) = match entry {
                    QueueEntry::Command { info, devices } => (
                        format!("{} → {}", info.name, devices.join(", ")),
                        humantime::format_duration(entry.hold_time()).to_string(),
                    ),
                    QueueEntry::Pause(pause) => (
                        self.painter.muted("pause"),
                        humantime::format_duration(*pause).to_string(),
                    ),
                };
                vec![position, what, hold]
            })
            .collect();
        let table = Table::grid(["#", "entry", "hold"], rows);
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_renders_a_placeholder() {
        let snapshot = QueueSnapshot::default();
        let painter = Painter::new(false);

        assert_eq!("queue is empty", QueueView::new(&snapshot, &painter).to_string());
    }
}
