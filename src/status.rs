use log::{error, info};

/// Severity / category tag carried by every relay status line.
///
/// The numeric codes are part of the event stream contract with external
/// viewers (terminal UI, log shippers); they map statuses to glyphs or
/// colors without the relay knowing which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Info = 2,
    Connect = 3,
    Progress = 4,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Sink for the relay's user-facing event stream.
///
/// `log` appends an entry; `replace` swaps out the tail entry when it
/// carries the same status, so a viewer can render a live counter without
/// accumulating lines. Implementations must never block the caller: the
/// packet path emits into this from its hot loop.
pub trait StatusSink: Send + Sync {
    fn log(&self, status: Status, message: &str);

    fn replace(&self, status: Status, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: Status,
    pub message: String,
}

/// In-memory log with tail-replace semantics, for sinks that keep a
/// scrollback (a terminal UI keeps one of these per view).
#[derive(Debug, Default)]
pub struct LogBuffer {
    entries: Vec<StatusEntry>,
}

impl LogBuffer {
    pub fn push(&mut self, status: Status, message: impl Into<String>) {
        self.entries.push(StatusEntry {
            status,
            message: message.into(),
        });
    }

    /// Replace the tail entry if it has the same status, otherwise append.
    pub fn replace(&mut self, status: Status, message: impl Into<String>) {
        if self.entries.last().map(|e| e.status) == Some(status) {
            self.entries.pop();
        }
        self.push(status, message);
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }
}

/// Plain sink writing through the `log` facade. A line printer cannot
/// rewrite its tail, so `replace` degrades to `log`.
#[derive(Debug, Default)]
pub struct TextSink;

impl StatusSink for TextSink {
    fn log(&self, status: Status, message: &str) {
        match status {
            Status::Error => error!("{message}"),
            _ => info!("{message}"),
        }
    }

    fn replace(&self, status: Status, message: &str) {
        self.log(status, message);
    }
}
