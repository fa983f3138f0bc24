use std::fmt::{self, Display, Formatter};

use crate::aggregate::AggregateEntry;

use super::painter::Painter;
use super::table::Table;

/// Renders the merged cross-device catalog, one row per logical command.
pub(crate) struct CatalogView<'a> {
    entries: &'a [AggregateEntry],
    painter: &'a Painter,
}

impl<'a> CatalogView<'a> {
    pub(crate) fn new(entries: &'a [AggregateEntry], painter: &'a Painter) -> Self {
        Self { entries, painter }
    }
}

impl Display for CatalogView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows = self
            .entries
            .iter()
            .map(|entry| {
                let command = entry.command();
                let state = if command.is_running {
                    self.painter.warning("running")
                } else if command.is_available {
                    self.painter.success("available")
                } else {
                    self.painter.muted("blocked")
                };
                vec![
                    self.painter.value(&command.name),
                    command.command.clone(),
                    command.category.clone(),
                    humantime::format_duration(command.duration).to_string(),
                    humantime::format_duration(command.minimum_cooldown).to_string(),
                    state,
                    entry.devices().join(", "),
                ]
            })
            .collect();
        let table = Table::grid(
            [
                "name", "command", "category", "duration", "cooldown", "state", "devices",
            ],
            rows,
        );
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::aggregate::{AggregationModel, CatalogEvent};
    use crate::catalog::CommandInfo;

    use super::*;

    fn merged_entries() -> Vec<AggregateEntry> {
        let mut model = AggregationModel::new();
        model.apply(CatalogEvent::Connected {
            device_id: "AA:BB".to_string(),
        });
        model.apply(CatalogEvent::CommandsReplaced {
            device_id: "AA:BB".to_string(),
            commands: vec![CommandInfo {
                name: "Slow Wag".to_string(),
                command: "TAILS1".to_string(),
                category: "relaxed".to_string(),
                duration: Duration::from_millis(11_530),
                minimum_cooldown: Duration::from_millis(1000),
                ..CommandInfo::default()
            }],
        });
        model.entries().to_vec()
    }

    #[test]
    fn catalog_rows_carry_timing_and_contributing_devices() {
        let entries = merged_entries();
        let painter = Painter::new(false);

        let rendered = CatalogView::new(&entries, &painter).to_string();

        assert!(rendered.contains("Slow Wag"));
        assert!(rendered.contains("TAILS1"));
        assert!(rendered.contains("11s 530ms"));
        assert!(rendered.contains("AA:BB"));
        assert!(rendered.contains("available"));
    }
}
