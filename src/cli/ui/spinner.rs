use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const TICK_INTERVAL: Duration = Duration::from_millis(80);
const TICK_FRAMES: &str = "⣾⣽⣻⢿⡿⣟⣯⣷";

/// Indeterminate activity indicator for slow BLE operations.
///
/// Stays silent on non-interactive outputs so piped runs produce clean
/// text.
#[derive(Debug)]
pub(crate) struct Spinner {
    interactive: bool,
}

impl Spinner {
    pub(crate) fn new(interactive: bool) -> Self {
        Self { interactive }
    }

    /// Runs `operation` to completion, spinning alongside it when the
    /// output is a terminal. The spinner line is erased before the
    /// result is returned.
    pub(crate) async fn show_while<F, Fut, T>(&self, message: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.interactive {
            return operation().await;
        }

        let bar = ProgressBar::new_spinner().with_message(message.to_string());
        bar.set_style(frame_style());
        bar.enable_steady_tick(TICK_INTERVAL);
        let result = operation().await;
        bar.finish_and_clear();
        result
    }
}

fn frame_style() -> ProgressStyle {
    match ProgressStyle::with_template("{spinner:.green.bold} {msg}") {
        Ok(style) => style.tick_chars(TICK_FRAMES),
        Err(_) => ProgressStyle::default_spinner(),
    }
}
