//! Loader for "crumpet" command definition files.
//!
//! A crumpet file is a JSON document describing the moves a gear model
//! understands plus optional shorthands that expand to chained calls:
//!
//! ```json
//! {
//!     "Title": "MiTail builtins",
//!     "Description": "Moves shipped with every MiTail",
//!     "Commands": [
//!         {
//!             "Name": "Slow Wag",
//!             "Command": "TAILS1",
//!             "Category": "relaxed",
//!             "Duration": 11530,
//!             "MinimumCooldown": 1000,
//!             "Group": 1
//!         }
//!     ],
//!     "Shorthands": [
//!         { "Command": "TAILHA", "Expansion": ["TAILS1", "PAUSE 200", "TAILFA"] }
//!     ]
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::CommandInfo;

/// Errors returned when loading a command definition file.
#[derive(Debug, Error)]
pub enum CommandFileError {
    #[error("failed to parse command file as JSON")]
    Parse(#[from] serde_json::Error),
    #[error("command definition `{name}` is incomplete")]
    IncompleteDefinition { name: String },
    #[error("shorthand `{command}` has an empty expansion")]
    EmptyShorthand { command: String },
    #[error("no builtin command file named `{file_name}` exists")]
    UnknownBuiltin { file_name: String },
}

/// Loads one of the crumpet documents compiled into the binary.
///
/// # Errors
///
/// Returns an error when no builtin goes by that name. The builtins
/// themselves are covered by tests, so parse failures mean a broken
/// build rather than bad user input.
pub fn load_builtin(file_name: &str) -> Result<CommandFile, CommandFileError> {
    let source = match file_name {
        "digitail-builtin.crumpet" => include_str!("../assets/digitail-builtin.crumpet"),
        "mitail-builtin.crumpet" => include_str!("../assets/mitail-builtin.crumpet"),
        "eargear-builtin.crumpet" => include_str!("../assets/eargear-builtin.crumpet"),
        _ => {
            return Err(CommandFileError::UnknownBuiltin {
                file_name: file_name.to_string(),
            });
        }
    };
    CommandFile::parse(source)
}

/// A parsed command definition file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandFile {
    title: String,
    #[serde(default)]
    description: String,
    commands: Vec<CommandDefinition>,
    #[serde(default)]
    shorthands: Vec<ShorthandDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandDefinition {
    name: String,
    command: String,
    category: String,
    duration: u64,
    #[serde(default)]
    minimum_cooldown: u64,
    #[serde(default)]
    group: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShorthandDefinition {
    command: String,
    expansion: Vec<String>,
}

impl CommandFile {
    /// Parses a crumpet document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or definitions that would never
    /// produce a valid command.
    pub fn parse(source: &str) -> Result<Self, CommandFileError> {
        let file: Self = serde_json::from_str(source)?;
        for definition in &file.commands {
            if definition.name.is_empty()
                || definition.command.is_empty()
                || definition.category.is_empty()
                || definition.duration == 0
            {
                return Err(CommandFileError::IncompleteDefinition {
                    name: definition.name.clone(),
                });
            }
        }
        for shorthand in &file.shorthands {
            if shorthand.expansion.is_empty() {
                return Err(CommandFileError::EmptyShorthand {
                    command: shorthand.command.clone(),
                });
            }
        }
        Ok(file)
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The command definitions as catalog entries.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandInfo> {
        self.commands
            .iter()
            .map(|definition| CommandInfo {
                name: definition.name.clone(),
                command: definition.command.clone(),
                category: definition.category.clone(),
                duration: Duration::from_millis(definition.duration),
                minimum_cooldown: Duration::from_millis(definition.minimum_cooldown),
                group: definition.group,
                ..CommandInfo::default()
            })
            .collect()
    }

    /// Shorthand wire strings mapped to their `;`-joined expansions.
    #[must_use]
    pub fn shorthands(&self) -> HashMap<String, String> {
        self.shorthands
            .iter()
            .map(|shorthand| (shorthand.command.clone(), shorthand.expansion.join(";")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"{
        "Title": "Test moves",
        "Description": "A couple of wags",
        "Commands": [
            {
                "Name": "Slow Wag",
                "Command": "TAILS1",
                "Category": "relaxed",
                "Duration": 11530,
                "MinimumCooldown": 1000,
                "Group": 1
            },
            {
                "Name": "Fast Wag",
                "Command": "TAILFA",
                "Category": "excited",
                "Duration": 9000
            }
        ],
        "Shorthands": [
            { "Command": "TAILHA", "Expansion": ["TAILS1", "PAUSE 200", "TAILFA"] }
        ]
    }"#;

    #[test]
    fn parses_commands_with_optional_fields_defaulted() {
        let file = CommandFile::parse(SAMPLE).unwrap();
        let commands = file.commands();

        assert_eq!("Test moves", file.title());
        assert_eq!(2, commands.len());
        assert_eq!("TAILS1", commands[0].command);
        assert_eq!(Duration::from_millis(11530), commands[0].duration);
        assert_eq!(Duration::from_millis(1000), commands[0].minimum_cooldown);
        assert_eq!(1, commands[0].group);
        assert_eq!(Duration::ZERO, commands[1].minimum_cooldown);
        assert_eq!(0, commands[1].group);
        assert!(commands.iter().all(CommandInfo::is_valid));
    }

    #[test]
    fn expands_shorthands_to_semicolon_chains() {
        let file = CommandFile::parse(SAMPLE).unwrap();
        let shorthands = file.shorthands();

        assert_eq!(
            Some(&"TAILS1;PAUSE 200;TAILFA".to_string()),
            shorthands.get("TAILHA")
        );
    }

    #[test]
    fn malformed_json_is_reported_not_panicked() {
        assert_matches!(
            CommandFile::parse("{ not json"),
            Err(CommandFileError::Parse(_))
        );
    }

    #[test]
    fn every_builtin_parses_and_validates() {
        for file_name in [
            "digitail-builtin.crumpet",
            "mitail-builtin.crumpet",
            "eargear-builtin.crumpet",
        ] {
            let file = load_builtin(file_name)
                .unwrap_or_else(|error| panic!("builtin {file_name} should parse: {error}"));
            assert!(!file.commands().is_empty());
            assert!(file.commands().iter().all(CommandInfo::is_valid));
        }
    }

    #[test]
    fn unknown_builtin_is_reported() {
        assert_matches!(
            load_builtin("missing.crumpet"),
            Err(CommandFileError::UnknownBuiltin { .. })
        );
    }

    #[test]
    fn zero_duration_definition_is_rejected() {
        let source = r#"{
            "Title": "Bad",
            "Commands": [
                { "Name": "Broken", "Command": "X", "Category": "c", "Duration": 0 }
            ]
        }"#;

        assert_matches!(
            CommandFile::parse(source),
            Err(CommandFileError::IncompleteDefinition { name }) if name == "Broken"
        );
    }
}
