//! Notification grammar shared by the gear session state machines.
//!
//! Two message dialects exist in the wild. The original tail hardware
//! prefixes run-state markers (`BEGIN TAILS1`) and reports battery as a
//! bare `BAT<n>`; newer gear suffixes the marker (`... BEGIN`) and talks
//! in full sentences for everything else. The older firmware also squashes
//! two notifications into one when commands interrupt each other, and the
//! characteristic length limit then splits the squashed text at an
//! arbitrary point, so leading-marker parsing is stateful.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use strum_macros::Display;

/// Which end of a message the run-state marker sits on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum Dialect {
    /// `BEGIN <command>` / `END <command>`, battery as `BAT<n>`.
    #[strum(to_string = "leading_marker")]
    LeadingMarker,
    /// `<anything> BEGIN` / `<anything> END`, sentence replies otherwise.
    #[strum(to_string = "trailing_marker")]
    TrailingMarker,
}

/// A decoded reply in the leading-marker dialect.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MarkerReply {
    /// A command started or stopped on the device.
    Running { command: String, running: bool },
    /// Battery charge in bars, 0 through 4.
    BatteryBars { level: u8 },
    Unrecognised { message: String },
}

/// A decoded reply in the trailing-marker dialect.
///
/// `Begin`/`End` carry no command name; they refer to whatever call is
/// currently outstanding on the session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChainReply {
    /// The device cannot accept the call right now; retry shortly.
    Busy,
    /// Firmware version report.
    Version { version: String },
    /// Keepalive response.
    Pong,
    /// Connection greeting, e.g. "MiTail started".
    Started,
    Begin,
    End,
    Unrecognised { message: String },
}

const MARKER_BEGIN: &str = "BEGIN";
const MARKER_END: &str = "END";
const BUSY_SENTENCE: &str = "System is busy now";

/// Parses one trailing-marker notification.
#[must_use]
pub fn parse_chain_reply(message: &str) -> ChainReply {
    if message == BUSY_SENTENCE {
        return ChainReply::Busy;
    }
    let tokens: Vec<&str> = message.split(' ').collect();
    match tokens.first() {
        Some(&"VER") => {
            return ChainReply::Version {
                version: message.to_string(),
            };
        }
        Some(&"PONG") => return ChainReply::Pong,
        _ => {}
    }
    match tokens.last() {
        Some(&"started") => ChainReply::Started,
        Some(&"BEGIN") => ChainReply::Begin,
        Some(&"END") => ChainReply::End,
        _ => ChainReply::Unrecognised {
            message: message.to_string(),
        },
    }
}

/// Stateful decoder for the leading-marker dialect.
///
/// When a command interrupts another, the firmware emits the `END` of the
/// old command and the `BEGIN` of the new one concatenated, split across
/// notifications wherever the characteristic ran out of room. A three-token
/// notification such as `END TAILS1BEGIN TAIL` therefore decodes into one
/// complete reply plus a remainder that is prepended to the next
/// single-token notification.
#[derive(Debug, Default)]
pub struct MarkerReassembler {
    remainder: Option<String>,
}

impl MarkerReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one notification, possibly completing a buffered remainder.
    ///
    /// `is_known_command` resolves whether a trailing fragment is already a
    /// complete command or still awaits its tail end.
    pub fn feed(
        &mut self,
        message: &str,
        is_known_command: &dyn Fn(&str) -> bool,
    ) -> Vec<MarkerReply> {
        if message.starts_with("BAT") {
            let level = message
                .chars()
                .last()
                .and_then(|digit| digit.to_digit(10))
                .unwrap_or(0);
            return vec![MarkerReply::BatteryBars { level: level as u8 }];
        }

        let tokens: Vec<&str> = message.split(' ').collect();
        match tokens.as_slice() {
            [fragment] => {
                let Some(buffered) = self.remainder.take() else {
                    return vec![MarkerReply::Unrecognised {
                        message: message.to_string(),
                    }];
                };
                let merged = format!("{buffered}{fragment}");
                match merged.split_once(' ') {
                    Some((marker, command)) => vec![MarkerReply::Running {
                        command: command.to_string(),
                        running: marker == MARKER_BEGIN,
                    }],
                    None => vec![MarkerReply::Unrecognised { message: merged }],
                }
            }
            [marker @ ("BEGIN" | "END"), command] => vec![MarkerReply::Running {
                command: (*command).to_string(),
                running: *marker == MARKER_BEGIN,
            }],
            [marker @ ("BEGIN" | "END"), squashed, trailing] => {
                let (command, inner_marker) = if let Some(head) = squashed.strip_suffix(MARKER_BEGIN)
                {
                    (head, MARKER_BEGIN)
                } else if let Some(head) = squashed.strip_suffix(MARKER_END) {
                    (head, MARKER_END)
                } else {
                    return vec![MarkerReply::Unrecognised {
                        message: message.to_string(),
                    }];
                };
                let mut replies = vec![MarkerReply::Running {
                    command: command.to_string(),
                    running: *marker == MARKER_BEGIN,
                }];
                if is_known_command(trailing) {
                    replies.push(MarkerReply::Running {
                        command: (*trailing).to_string(),
                        running: inner_marker == MARKER_BEGIN,
                    });
                } else {
                    self.remainder = Some(format!("{inner_marker} {trailing}"));
                }
                replies
            }
            _ => vec![MarkerReply::Unrecognised {
                message: message.to_string(),
            }],
        }
    }
}

/// A call after shorthand expansion: the first wire message to send plus
/// any chained steps still queued.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExpandedCall {
    /// The message as the caller phrased it.
    pub logical: String,
    /// The first sub-call to put on the wire.
    pub first: String,
    /// Remaining sub-calls, dispensed one per `END` acknowledgement.
    pub rest: VecDeque<String>,
    /// Whether expansion rewrote the message at all.
    pub expanded: bool,
}

/// Applies shorthand expansion and splits `;`-chained calls.
#[must_use]
pub fn expand_call(message: &str, shorthands: &HashMap<String, String>) -> ExpandedCall {
    let actual = shorthands
        .get(message)
        .cloned()
        .unwrap_or_else(|| message.to_string());
    let expanded = actual != message;
    let mut parts = actual.split(';').map(str::to_string);
    let first = parts.next().unwrap_or_default();
    ExpandedCall {
        logical: message.to_string(),
        first,
        rest: parts.collect(),
        expanded,
    }
}

/// One step pulled off a call chain.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChainStep {
    pub message: String,
    /// Delay before the message goes out. Zero when no pause preceded it.
    pub delay: Duration,
}

/// Minimum wait once any pause appears in a chain, matching the firmware's
/// notion of a human moment.
const MINIMUM_CHAIN_PAUSE: Duration = Duration::from_millis(3000);

/// Pops the next sub-call, folding any leading `PAUSE <ms>` entries into a
/// single delay. Returns `None` once the chain is exhausted, including when
/// only pauses remain.
pub fn next_chain_step(queue: &mut VecDeque<String>) -> Option<ChainStep> {
    let mut pause = Duration::ZERO;
    loop {
        let message = queue.pop_front()?;
        if let Some(value) = message.strip_prefix("PAUSE") {
            let millis = value.trim().parse::<u64>().unwrap_or(0);
            pause += Duration::from_millis(millis);
            continue;
        }
        if message.is_empty() {
            return None;
        }
        let delay = if pause > Duration::ZERO {
            pause.max(MINIMUM_CHAIN_PAUSE)
        } else {
            Duration::ZERO
        };
        return Some(ChainStep { message, delay });
    }
}
