use std::time::Duration;

/// One move or pose a piece of gear knows how to perform.
///
/// `is_running` and `is_available` are transient presentation state and do
/// not participate in equality.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Human-readable name, e.g. "Slow Wag".
    pub name: String,
    /// The wire command sent to the device, e.g. "TAILS1".
    pub command: String,
    /// Grouping category, e.g. "relaxed".
    pub category: String,
    /// How long the move takes to play out.
    pub duration: Duration,
    /// Extra quiet time required after the move completes.
    pub minimum_cooldown: Duration,
    /// Exclusion-group tag; commands sharing a group block each other.
    pub group: u32,
    pub is_running: bool,
    pub is_available: bool,
}

impl Default for CommandInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            category: String::new(),
            duration: Duration::ZERO,
            minimum_cooldown: Duration::ZERO,
            group: 0,
            is_running: false,
            is_available: true,
        }
    }
}

impl PartialEq for CommandInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.command == other.command
            && self.category == other.category
            && self.duration == other.duration
            && self.minimum_cooldown == other.minimum_cooldown
            && self.group == other.group
    }
}

impl Eq for CommandInfo {}

impl CommandInfo {
    /// A command is valid once it has a name, a wire command, a category and
    /// a non-zero duration.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && !self.command.is_empty()
            && !self.category.is_empty()
            && self.duration >= Duration::from_millis(1)
    }

    /// Whether two definitions describe the same logical command, ignoring
    /// timing. Used when merging catalogs from several devices that may
    /// carry different durations for the same move.
    #[must_use]
    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        self.name == other.name
            && self.command == other.command
            && self.category == other.category
            && self.group == other.group
    }
}

/// The set of commands one connected device currently understands.
#[derive(Debug, Clone, Default)]
pub struct GearCatalog {
    commands: Vec<CommandInfo>,
}

impl GearCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All commands in definition order.
    #[must_use]
    pub fn all(&self) -> &[CommandInfo] {
        &self.commands
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Appends a command. Invalid definitions are ignored.
    pub fn add(&mut self, info: CommandInfo) {
        if info.is_valid() {
            self.commands.push(info);
        }
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Looks up a command by its wire string.
    #[must_use]
    pub fn find(&self, command: &str) -> Option<&CommandInfo> {
        self.commands.iter().find(|info| info.command == command)
    }

    /// Whether the wire string names a known command.
    #[must_use]
    pub fn is_known(&self, command: &str) -> bool {
        self.find(command).is_some()
    }

    /// Marks a command as running or stopped and updates availability for
    /// the command itself and every peer in its exclusion group. Returns
    /// the commands whose state changed.
    pub fn set_running(&mut self, command: &str, running: bool) -> Vec<CommandInfo> {
        let Some(group) = self.find(command).map(|info| info.group) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for info in &mut self.commands {
            if info.command == command {
                if info.is_running != running || info.is_available == running {
                    info.is_running = running;
                    info.is_available = !running;
                    changed.push(info.clone());
                }
            } else if info.group == group && info.is_available == running {
                info.is_available = !running;
                changed.push(info.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn command(name: &str, wire: &str, category: &str, group: u32) -> CommandInfo {
        CommandInfo {
            name: name.to_string(),
            command: wire.to_string(),
            category: category.to_string(),
            duration: Duration::from_millis(1500),
            minimum_cooldown: Duration::from_millis(200),
            group,
            ..CommandInfo::default()
        }
    }

    #[rstest]
    #[case::missing_name("", "TAILS1", "relaxed", 1500, false)]
    #[case::missing_wire_command("Slow Wag", "", "relaxed", 1500, false)]
    #[case::missing_category("Slow Wag", "TAILS1", "", 1500, false)]
    #[case::zero_duration("Slow Wag", "TAILS1", "relaxed", 0, false)]
    #[case::complete("Slow Wag", "TAILS1", "relaxed", 1500, true)]
    fn validity_requires_all_descriptive_fields(
        #[case] name: &str,
        #[case] wire: &str,
        #[case] category: &str,
        #[case] duration_ms: u64,
        #[case] expected: bool,
    ) {
        let info = CommandInfo {
            name: name.to_string(),
            command: wire.to_string(),
            category: category.to_string(),
            duration: Duration::from_millis(duration_ms),
            ..CommandInfo::default()
        };

        assert_eq!(expected, info.is_valid());
    }

    #[test]
    fn equality_ignores_transient_flags() {
        let mut left = command("Slow Wag", "TAILS1", "relaxed", 0);
        let mut right = left.clone();
        left.is_running = true;
        right.is_available = false;

        assert_eq!(left, right);
    }

    #[test]
    fn equality_distinguishes_durations_while_equivalence_does_not() {
        let left = command("Slow Wag", "TAILS1", "relaxed", 0);
        let mut right = left.clone();
        right.duration = Duration::from_millis(3000);

        assert_ne!(left, right);
        assert!(left.is_equivalent_to(&right));
    }

    #[test]
    fn set_running_blocks_exclusion_group_peers() {
        let mut catalog = GearCatalog::new();
        catalog.add(command("Slow Wag", "TAILS1", "relaxed", 1));
        catalog.add(command("Fast Wag", "TAILS2", "excited", 1));
        catalog.add(command("Ear Twitch", "EARS1", "relaxed", 2));

        let changed = catalog.set_running("TAILS1", true);

        assert_eq!(2, changed.len());
        let running = catalog.find("TAILS1").unwrap();
        assert!(running.is_running);
        assert!(!running.is_available);
        let peer = catalog.find("TAILS2").unwrap();
        assert!(!peer.is_running);
        assert!(!peer.is_available);
        let unrelated = catalog.find("EARS1").unwrap();
        assert!(unrelated.is_available);
    }

    #[test]
    fn set_running_false_releases_the_group() {
        let mut catalog = GearCatalog::new();
        catalog.add(command("Slow Wag", "TAILS1", "relaxed", 1));
        catalog.add(command("Fast Wag", "TAILS2", "excited", 1));
        catalog.set_running("TAILS1", true);

        let changed = catalog.set_running("TAILS1", false);

        assert_eq!(2, changed.len());
        assert!(catalog.all().iter().all(|info| info.is_available));
        assert!(catalog.all().iter().all(|info| !info.is_running));
    }

    #[test]
    fn set_running_for_unknown_command_changes_nothing() {
        let mut catalog = GearCatalog::new();
        catalog.add(command("Slow Wag", "TAILS1", "relaxed", 1));

        assert!(catalog.set_running("NOPE", true).is_empty());
    }

    #[test]
    fn invalid_commands_are_not_added() {
        let mut catalog = GearCatalog::new();
        catalog.add(CommandInfo::default());

        assert!(catalog.is_empty());
    }
}
