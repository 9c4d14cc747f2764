//! Device session log and the reporting context shared by all operations.

use crate::events::{HmiEvent, LogLevel, Observer, Phase};

/// Ordered, append-only trace of one logical operation.
///
/// Kept on success and failure alike so it can be attached to bug reports.
#[derive(Debug, Default, Clone)]
pub struct DeviceLog {
    entries: Vec<String>,
}

impl DeviceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        self.entries.push(match level {
            LogLevel::Warn | LogLevel::Error => format!("{}: {}", level, message),
            _ => message,
        });
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Starts a new operation. Only called between operations.
    pub(crate) fn begin(&mut self, operation: &str) {
        self.entries.clear();
        self.entries.push(format!("Starting {}", operation));
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// Routes log lines into the device log and every event to the observer.
pub struct Reporter<'a> {
    observer: &'a dyn Observer,
    log: &'a mut DeviceLog,
    phase: Phase,
}

impl<'a> Reporter<'a> {
    pub fn new(observer: &'a dyn Observer, log: &'a mut DeviceLog) -> Self {
        Self {
            observer,
            log,
            phase: Phase::Idle,
        }
    }

    pub fn emit(&self, event: HmiEvent) {
        self.observer.on_event(&event);
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        self.log.push(level, message.clone());
        self.emit(HmiEvent::Log { level, message });
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn progress(&self, description: &str, total: u64, current: u64) {
        self.emit(HmiEvent::Progress {
            description: description.to_string(),
            unit: "bytes",
            total,
            current,
        });
    }

    pub fn phase(&mut self, to: Phase) {
        if self.phase != to {
            self.emit(HmiEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    pub fn current_phase(&self) -> Phase {
        self.phase
    }
}
