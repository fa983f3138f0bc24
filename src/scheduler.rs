//! Command scheduling.
//!
//! One FIFO of commands and pauses across all connected gear. A single
//! entry is armed at a time: commands dispatch immediately and then hold
//! the queue for their duration plus cooldown, pauses just hold it. The
//! armed head is in flight and is never reordered or time-shifted by the
//! editing operations.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::catalog::CommandInfo;

const OPS_CHANNEL_CAPACITY: usize = 32;
const DISPATCH_CHANNEL_CAPACITY: usize = 16;

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    /// A command bound for one or more devices.
    Command {
        info: CommandInfo,
        devices: Vec<String>,
    },
    /// A plain wait with no dispatch.
    Pause(Duration),
}

impl QueueEntry {
    /// How long this entry holds the queue once armed.
    #[must_use]
    pub fn hold_time(&self) -> Duration {
        match self {
            Self::Command { info, .. } => info.duration + info.minimum_cooldown,
            Self::Pause(pause) => *pause,
        }
    }
}

/// Instructions for the task driving the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEffect {
    /// Send the command to the named devices now.
    Dispatch {
        command: CommandInfo,
        devices: Vec<String>,
    },
    /// Hold the queue for this long before advancing.
    ArmTimer { after: Duration },
    CancelTimer,
}

/// The queue itself, free of timers and channels.
#[derive(Debug, Default)]
pub struct SchedulerCore {
    entries: VecDeque<QueueEntry>,
    armed: bool,
}

impl SchedulerCore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the head entry is currently in flight.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    #[must_use]
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Appends a command and starts it immediately if the queue was idle.
    pub fn push_command(
        &mut self,
        info: CommandInfo,
        devices: Vec<String>,
    ) -> Vec<SchedulerEffect> {
        self.entries.push_back(QueueEntry::Command { info, devices });
        self.arm_if_idle()
    }

    /// Appends a pause and starts it immediately if the queue was idle.
    pub fn push_pause(&mut self, pause: Duration) -> Vec<SchedulerEffect> {
        self.entries.push_back(QueueEntry::Pause(pause));
        self.arm_if_idle()
    }

    /// Appends a batch given in the string form `"<command name>"` or
    /// `"pause:<seconds>"`. Names that resolve to nothing are skipped.
    pub fn push_batch(
        &mut self,
        batch: &[String],
        lookup: &dyn Fn(&str) -> Option<(CommandInfo, Vec<String>)>,
    ) -> Vec<SchedulerEffect> {
        for entry in batch {
            if let Some(seconds) = entry
                .strip_prefix("pause:")
                .and_then(|value| value.trim().parse::<u64>().ok())
            {
                self.entries
                    .push_back(QueueEntry::Pause(Duration::from_secs(seconds)));
                continue;
            }

            match lookup(entry) {
                Some((info, devices)) => {
                    self.entries.push_back(QueueEntry::Command { info, devices });
                }
                None => debug!(entry, "skipping unresolvable batch entry"),
            }
        }
        self.arm_if_idle()
    }

    /// Advances past the armed head once its hold time has elapsed.
    pub fn timer_elapsed(&mut self) -> Vec<SchedulerEffect> {
        if !self.armed {
            return Vec::new();
        }
        self.entries.pop_front();
        self.armed = false;
        self.arm_if_idle()
    }

    /// Drops queued entries. With a device id, only entries bound
    /// exclusively for that device are removed and the in-flight head is
    /// left alone; without one the whole queue is dropped and the hold
    /// timer cancelled.
    pub fn clear(&mut self, device_id: Option<&str>) -> Vec<SchedulerEffect> {
        match device_id {
            Some(device_id) => {
                let first_editable = usize::from(self.armed);
                let mut index = first_editable;
                while index < self.entries.len() {
                    let exclusive = matches!(
                        &self.entries[index],
                        QueueEntry::Command { devices, .. }
                            if devices.len() == 1 && devices[0] == device_id
                    );
                    if exclusive {
                        self.entries.remove(index);
                    } else {
                        index += 1;
                    }
                }
                Vec::new()
            }
            None => {
                self.entries.clear();
                if self.armed {
                    self.armed = false;
                    vec![SchedulerEffect::CancelTimer]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Moves the entry at `index` one slot toward the head. Refused when
    /// it would displace the in-flight head.
    pub fn move_up(&mut self, index: usize) -> bool {
        let lowest = 1 + usize::from(self.armed);
        if index < lowest || index >= self.entries.len() {
            return false;
        }
        self.entries.swap(index, index - 1);
        true
    }

    /// Moves the entry at `index` one slot away from the head.
    pub fn move_down(&mut self, index: usize) -> bool {
        let lowest = usize::from(self.armed);
        if index < lowest || index + 1 >= self.entries.len() {
            return false;
        }
        self.entries.swap(index, index + 1);
        true
    }

    /// Swaps two queued entries. Refused when either is the in-flight
    /// head.
    pub fn swap(&mut self, first: usize, second: usize) -> bool {
        let lowest = usize::from(self.armed);
        if first == second
            || first < lowest
            || second < lowest
            || first >= self.entries.len()
            || second >= self.entries.len()
        {
            return false;
        }
        self.entries.swap(first, second);
        true
    }

    fn arm_if_idle(&mut self) -> Vec<SchedulerEffect> {
        if self.armed {
            return Vec::new();
        }
        let Some(head) = self.entries.front() else {
            return Vec::new();
        };

        self.armed = true;
        let mut effects = Vec::with_capacity(2);
        if let QueueEntry::Command { info, devices } = head {
            effects.push(SchedulerEffect::Dispatch {
                command: info.clone(),
                devices: devices.clone(),
            });
        }
        effects.push(SchedulerEffect::ArmTimer {
            after: head.hold_time(),
        });
        effects
    }
}

/// A command the scheduler wants sent right now.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDispatch {
    command: CommandInfo,
    devices: Vec<String>,
}

impl CommandDispatch {
    #[must_use]
    pub fn command(&self) -> &CommandInfo {
        &self.command
    }

    #[must_use]
    pub fn devices(&self) -> &[String] {
        &self.devices
    }
}

/// Point-in-time view of the queue for display.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    entries: Vec<QueueEntry>,
    armed_until: Option<Instant>,
}

impl QueueSnapshot {
    #[must_use]
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed_until.is_some()
    }

    /// Time left before the in-flight head entry releases the queue.
    #[must_use]
    pub fn head_remaining(&self) -> Option<Duration> {
        self.armed_until
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Edits accepted by the scheduler task.
#[derive(Debug)]
pub enum SchedulerOp {
    PushCommand {
        info: CommandInfo,
        devices: Vec<String>,
    },
    PushPause(Duration),
    PushBatch(Vec<String>),
    Clear { device_id: Option<String> },
    MoveUp(usize),
    MoveDown(usize),
    Swap(usize, usize),
}

/// Cloneable handle to the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    ops: mpsc::Sender<SchedulerOp>,
    queue: watch::Receiver<QueueSnapshot>,
}

impl SchedulerHandle {
    pub async fn push_command(&self, info: CommandInfo, devices: Vec<String>) {
        let _ = self.ops.send(SchedulerOp::PushCommand { info, devices }).await;
    }

    pub async fn push_pause(&self, pause: Duration) {
        let _ = self.ops.send(SchedulerOp::PushPause(pause)).await;
    }

    pub async fn push_batch(&self, batch: Vec<String>) {
        let _ = self.ops.send(SchedulerOp::PushBatch(batch)).await;
    }

    pub async fn clear(&self, device_id: Option<String>) {
        let _ = self.ops.send(SchedulerOp::Clear { device_id }).await;
    }

    pub async fn move_up(&self, index: usize) {
        let _ = self.ops.send(SchedulerOp::MoveUp(index)).await;
    }

    pub async fn move_down(&self, index: usize) {
        let _ = self.ops.send(SchedulerOp::MoveDown(index)).await;
    }

    pub async fn swap(&self, first: usize, second: usize) {
        let _ = self.ops.send(SchedulerOp::Swap(first, second)).await;
    }

    /// The live queue snapshot.
    #[must_use]
    pub fn queue(&self) -> watch::Receiver<QueueSnapshot> {
        self.queue.clone()
    }
}

enum Wakeup {
    Op(Option<SchedulerOp>),
    TimerTick,
}

/// Spawns the scheduler task. Batch entries are resolved against the
/// aggregated catalog at push time; dispatches come back to the caller
/// for routing to the right sessions.
#[must_use]
pub fn spawn_scheduler(
    aggregate: watch::Receiver<Vec<crate::aggregate::AggregateEntry>>,
) -> (SchedulerHandle, mpsc::Receiver<CommandDispatch>) {
    let (ops_tx, mut ops_rx) = mpsc::channel(OPS_CHANNEL_CAPACITY);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
    let (queue_tx, queue_rx) = watch::channel(QueueSnapshot::default());

    tokio::spawn(async move {
        let mut core = SchedulerCore::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let wakeup = tokio::select! {
                op = ops_rx.recv() => Wakeup::Op(op),
                () = sleep_until_or_pending(deadline) => Wakeup::TimerTick,
            };

            let effects = match wakeup {
                Wakeup::Op(None) => break,
                Wakeup::Op(Some(op)) => match op {
                    SchedulerOp::PushCommand { info, devices } => {
                        core.push_command(info, devices)
                    }
                    SchedulerOp::PushPause(pause) => core.push_pause(pause),
                    SchedulerOp::PushBatch(batch) => {
                        let entries = aggregate.borrow().clone();
                        core.push_batch(&batch, &|name| {
                            entries
                                .iter()
                                .find(|entry| {
                                    entry.command().name == name
                                        || entry.command().command == name
                                })
                                .map(|entry| {
                                    (entry.command().clone(), entry.devices().to_vec())
                                })
                        })
                    }
                    SchedulerOp::Clear { device_id } => core.clear(device_id.as_deref()),
                    SchedulerOp::MoveUp(index) => {
                        core.move_up(index);
                        Vec::new()
                    }
                    SchedulerOp::MoveDown(index) => {
                        core.move_down(index);
                        Vec::new()
                    }
                    SchedulerOp::Swap(first, second) => {
                        core.swap(first, second);
                        Vec::new()
                    }
                },
                Wakeup::TimerTick => {
                    deadline = None;
                    core.timer_elapsed()
                }
            };

            for effect in effects {
                match effect {
                    SchedulerEffect::Dispatch { command, devices } => {
                        if dispatch_tx
                            .send(CommandDispatch { command, devices })
                            .await
                            .is_err()
                        {
                            warn!("dispatch consumer went away, dropping command");
                        }
                    }
                    SchedulerEffect::ArmTimer { after } => {
                        deadline = Some(Instant::now() + after);
                    }
                    SchedulerEffect::CancelTimer => deadline = None,
                }
            }

            let snapshot = QueueSnapshot {
                entries: core.entries(),
                armed_until: deadline.filter(|_| core.is_armed()),
            };
            if queue_tx.send(snapshot).is_err() {
                break;
            }
        }
    });

    (
        SchedulerHandle {
            ops: ops_tx,
            queue: queue_rx,
        },
        dispatch_rx,
    )
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn command(name: &str, duration_ms: u64, cooldown_ms: u64) -> CommandInfo {
        CommandInfo {
            name: name.to_string(),
            command: format!("WIRE_{name}"),
            category: "relaxed".to_string(),
            duration: Duration::from_millis(duration_ms),
            minimum_cooldown: Duration::from_millis(cooldown_ms),
            ..CommandInfo::default()
        }
    }

    fn devices(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn first_push_dispatches_immediately_and_holds_for_duration_plus_cooldown() {
        let mut core = SchedulerCore::new();

        let effects = core.push_command(command("wag", 2_000, 500), devices(&["tail"]));

        assert_eq!(2, effects.len());
        assert_matches!(
            &effects[0],
            SchedulerEffect::Dispatch { command, .. } if command.name == "wag"
        );
        assert_eq!(
            SchedulerEffect::ArmTimer {
                after: Duration::from_millis(2_500)
            },
            effects[1]
        );
        assert!(core.is_armed());
    }

    #[test]
    fn entries_queued_behind_an_armed_head_wait_their_turn() {
        let mut core = SchedulerCore::new();
        core.push_command(command("wag", 2_000, 500), devices(&["tail"]));

        let effects = core.push_command(command("flick", 1_000, 0), devices(&["tail"]));
        assert!(effects.is_empty());

        let effects = core.timer_elapsed();
        assert_matches!(
            &effects[0],
            SchedulerEffect::Dispatch { command, .. } if command.name == "flick"
        );
        assert_eq!(1, core.len());
    }

    #[test]
    fn a_pause_holds_the_queue_without_dispatching() {
        let mut core = SchedulerCore::new();

        let effects = core.push_pause(Duration::from_secs(3));

        assert_eq!(
            vec![SchedulerEffect::ArmTimer {
                after: Duration::from_secs(3)
            }],
            effects
        );
    }

    #[test]
    fn batch_form_mixes_lookups_and_pauses() {
        let mut core = SchedulerCore::new();
        let lookup = |name: &str| {
            (name == "wag").then(|| (command("wag", 1_000, 0), devices(&["tail"])))
        };

        core.push_batch(
            &[
                "wag".to_string(),
                "pause:3".to_string(),
                "no such thing".to_string(),
            ],
            &lookup,
        );

        let entries = core.entries();
        assert_eq!(2, entries.len());
        assert_matches!(&entries[0], QueueEntry::Command { info, .. } if info.name == "wag");
        assert_eq!(QueueEntry::Pause(Duration::from_secs(3)), entries[1]);
    }

    #[test]
    fn reordering_never_touches_the_armed_head() {
        let mut core = SchedulerCore::new();
        core.push_command(command("wag", 2_000, 500), devices(&["tail"]));
        core.push_command(command("flick", 1_000, 0), devices(&["tail"]));
        core.push_command(command("slow", 1_000, 0), devices(&["tail"]));

        assert!(!core.move_up(1));
        assert!(!core.move_down(0));
        assert!(!core.swap(0, 2));
        assert!(core.move_up(2));

        let entries = core.entries();
        assert_matches!(&entries[0], QueueEntry::Command { info, .. } if info.name == "wag");
        assert_matches!(&entries[1], QueueEntry::Command { info, .. } if info.name == "slow");
    }

    #[test]
    fn device_scoped_clear_removes_only_exclusive_entries_and_spares_the_head() {
        let mut core = SchedulerCore::new();
        core.push_command(command("wag", 2_000, 500), devices(&["tail"]));
        core.push_command(command("flick", 1_000, 0), devices(&["tail"]));
        core.push_command(command("both", 1_000, 0), devices(&["tail", "wings"]));
        core.push_command(command("perk", 1_000, 0), devices(&["ears"]));

        let effects = core.clear(Some("tail"));

        assert!(effects.is_empty());
        let entries = core.entries();
        assert_eq!(3, entries.len());
        assert_matches!(&entries[0], QueueEntry::Command { info, .. } if info.name == "wag");
        assert_matches!(&entries[1], QueueEntry::Command { info, .. } if info.name == "both");
        assert_matches!(&entries[2], QueueEntry::Command { info, .. } if info.name == "perk");
    }

    #[test]
    fn full_clear_drops_everything_and_cancels_the_hold_timer() {
        let mut core = SchedulerCore::new();
        core.push_command(command("wag", 2_000, 500), devices(&["tail"]));
        core.push_pause(Duration::from_secs(3));

        let effects = core.clear(None);

        assert_eq!(vec![SchedulerEffect::CancelTimer], effects);
        assert!(core.is_empty());
        assert!(!core.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_spaced_by_duration_plus_cooldown() {
        let (_aggregate_tx, aggregate_rx) = watch::channel(Vec::new());
        let (handle, mut dispatches) = spawn_scheduler(aggregate_rx);

        let started = Instant::now();
        handle
            .push_command(command("wag", 2_000, 500), devices(&["tail"]))
            .await;
        handle
            .push_command(command("flick", 1_000, 0), devices(&["tail"]))
            .await;

        let first = dispatches.recv().await.expect("first dispatch");
        assert_eq!("wag", first.command().name);
        assert!(started.elapsed() < Duration::from_millis(100));

        let second = dispatches.recv().await.expect("second dispatch");
        assert_eq!("flick", second.command().name);
        assert!(started.elapsed() >= Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_snapshot_reports_head_remaining_time() {
        let (_aggregate_tx, aggregate_rx) = watch::channel(Vec::new());
        let (handle, mut dispatches) = spawn_scheduler(aggregate_rx);

        handle
            .push_command(command("wag", 2_000, 500), devices(&["tail"]))
            .await;
        let _ = dispatches.recv().await;

        let mut queue = handle.queue();
        let snapshot = queue
            .wait_for(QueueSnapshot::is_armed)
            .await
            .expect("snapshot published")
            .clone();
        let remaining = snapshot.head_remaining().expect("armed head");
        assert!(remaining <= Duration::from_millis(2_500));
        assert!(remaining > Duration::from_millis(2_000));
    }
}
