use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colored::Colorize;

use crate::core::cancel::CancelToken;

const SPINNER: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
const PREVIEW_WIDTH: usize = 40;
const TAIL_WIDTH: usize = 15;

/// One line per live inline command or executable fence: spinner, truncated
/// command preview, and the tail of its stdout.
///
/// A presentation concern only: when stderr is not a terminal the surface is
/// inert, and it never alters directive ordering, output capture, or exit
/// codes. Lines render only while more than one directive is in flight.
#[derive(Debug, Clone)]
pub struct Dashboard {
    inner: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<u64, Entry>,
    lines_drawn: usize,
    spinner_phase: usize,
    enabled: bool,
}

#[derive(Debug)]
struct Entry {
    preview: String,
    tail: String,
}

impl Dashboard {
    pub fn new() -> Self {
        let enabled = std::io::stderr().is_terminal();
        Dashboard {
            inner: Arc::new(Mutex::new(State {
                enabled,
                ..State::default()
            })),
        }
    }

    /// A dashboard that never draws, for tests and non-TTY runs.
    pub fn disabled() -> Self {
        Dashboard {
            inner: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn register(&self, id: u64, command: &str) {
        let mut state = self.inner.lock().expect("dashboard lock");
        let preview: String = command
            .replace(['\n', '\r'], " ")
            .chars()
            .take(PREVIEW_WIDTH)
            .collect();
        state.entries.insert(
            id,
            Entry {
                preview,
                tail: String::new(),
            },
        );
    }

    /// Feed a chunk of stdout; only the last few characters are kept.
    pub fn update(&self, id: u64, chunk: &str) {
        let mut state = self.inner.lock().expect("dashboard lock");
        if let Some(entry) = state.entries.get_mut(&id) {
            let clean = chunk.replace(['\n', '\r'], " ");
            entry.tail.push_str(&clean);
            if entry.tail.chars().count() > TAIL_WIDTH {
                entry.tail = entry
                    .tail
                    .chars()
                    .rev()
                    .take(TAIL_WIDTH)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
            }
        }
    }

    /// Terminated directives disappear from the list.
    pub fn finish(&self, id: u64) {
        let mut state = self.inner.lock().expect("dashboard lock");
        state.entries.remove(&id);
    }

    /// Start the redraw loop (~12 Hz). Stops on cancellation; the caller
    /// should also call `clear` when resolution ends.
    pub fn spawn_ticker(&self, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let dash = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(80));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => dash.draw(),
                }
            }
            dash.clear();
        })
    }

    /// Erase any drawn lines.
    pub fn clear(&self) {
        let mut state = self.inner.lock().expect("dashboard lock");
        if state.lines_drawn > 0 {
            eprint!("\x1b[{}A\x1b[J", state.lines_drawn);
            let _ = std::io::stderr().flush();
            state.lines_drawn = 0;
        }
    }

    fn draw(&self) {
        let mut state = self.inner.lock().expect("dashboard lock");
        if !state.enabled {
            return;
        }

        // Rewrite the previously drawn block in place
        let mut frame = String::new();
        if state.lines_drawn > 0 {
            frame.push_str(&format!("\x1b[{}A\x1b[J", state.lines_drawn));
        }

        // Only a concurrent batch gets a surface
        if state.entries.len() < 2 {
            if !frame.is_empty() {
                eprint!("{frame}");
                let _ = std::io::stderr().flush();
            }
            state.lines_drawn = 0;
            return;
        }

        state.spinner_phase = (state.spinner_phase + 1) % SPINNER.len();
        let spinner = SPINNER[state.spinner_phase];
        for entry in state.entries.values() {
            frame.push_str(&format!(
                "{} {} {}\n",
                spinner.to_string().cyan(),
                entry.preview.bold(),
                entry.tail.dimmed()
            ));
        }
        state.lines_drawn = state.entries.len();
        eprint!("{frame}");
        let _ = std::io::stderr().flush();
    }
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}
