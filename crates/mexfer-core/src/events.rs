//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to subscribe to transfer progress and log lines
//! without tight coupling to the protocol logic.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Phases of one terminal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Opening the transport.
    Connecting,
    /// Reading identity, versions and paths.
    Identify,
    /// Checking the terminal against the allow-lists.
    Validate,
    /// File transfer in progress.
    Transfer,
    /// Firmware upgrade in progress.
    Upgrade,
    /// Terminal is rebooting.
    Rebooting,
    /// Operation finished.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Connecting => write!(f, "Connecting"),
            Phase::Identify => write!(f, "Identify"),
            Phase::Validate => write!(f, "Validate"),
            Phase::Transfer => write!(f, "Transfer"),
            Phase::Upgrade => write!(f, "Upgrade"),
            Phase::Rebooting => write!(f, "Rebooting"),
            Phase::Complete => write!(f, "Complete"),
            Phase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted while talking to a terminal.
#[derive(Debug, Clone)]
pub enum HmiEvent {
    /// Transport opened.
    Connected { path: String },
    /// Phase changed.
    PhaseChanged { from: Phase, to: Phase },
    /// Progress of the current transfer. `total` may be zero.
    Progress {
        description: String,
        unit: &'static str,
        total: u64,
        current: u64,
    },
    /// Log message (also recorded in the device log).
    Log { level: LogLevel, message: String },
    /// Operation completed successfully.
    Complete,
}

/// Observer trait for receiving terminal events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait Observer: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &HmiEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: &HmiEvent) {}
}

/// Adapts a closure into an observer.
pub struct FnObserver<F>(pub F);

impl<F> Observer for FnObserver<F>
where
    F: Fn(&HmiEvent) + Send + Sync,
{
    fn on_event(&self, event: &HmiEvent) {
        (self.0)(event)
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &HmiEvent) {
        match event {
            HmiEvent::Connected { path } => {
                tracing::info!(path = %path, "Terminal connected");
            }
            HmiEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            HmiEvent::Progress {
                description,
                unit,
                total,
                current,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(
                    operation = %description,
                    progress = %format!("{}%", pct),
                    "{}/{} {}",
                    current,
                    total,
                    unit
                );
            }
            HmiEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            HmiEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fn_observer_receives_events() {
        let seen = Mutex::new(Vec::new());
        let observer = FnObserver(|e: &HmiEvent| {
            if let HmiEvent::Progress { current, .. } = e {
                seen.lock().unwrap().push(*current);
            }
        });
        for current in [0, 10, 20] {
            observer.on_event(&HmiEvent::Progress {
                description: "x".into(),
                unit: "bytes",
                total: 20,
                current,
            });
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 20]);
    }

    #[test]
    fn test_tracing_observer_tolerates_zero_total() {
        TracingObserver.on_event(&HmiEvent::Progress {
            description: "empty".into(),
            unit: "bytes",
            total: 0,
            current: 0,
        });
    }
}
