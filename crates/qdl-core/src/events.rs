//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to subscribe to engine events without
//! tight coupling to the core logic.

use std::fmt;
use std::sync::Arc;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading and validating scripts.
    Parsing,
    /// Resolving and opening the device.
    Connecting,
    /// Uploading the programmer over Sahara.
    Sahara,
    /// Negotiating the Firehose configuration.
    Configure,
    /// Executing script operations.
    Transfer,
    /// Resetting the device after a successful run.
    Reset,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Parsing => write!(f, "Parsing"),
            Phase::Connecting => write!(f, "Connecting"),
            Phase::Sahara => write!(f, "Sahara"),
            Phase::Configure => write!(f, "Configure"),
            Phase::Transfer => write!(f, "Transfer"),
            Phase::Reset => write!(f, "Reset"),
            Phase::Complete => write!(f, "Complete"),
            Phase::Error => write!(f, "Error"),
        }
    }
}

/// One progress report: `value` of `total` units of `task` are done.
///
/// `value == total == 0` marks an advisory event (a device log line or a
/// skipped directive) rather than a progress fraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task: String,
    pub value: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(task: impl Into<String>, value: u64, total: u64) -> Self {
        Self {
            task: task.into(),
            value,
            total,
        }
    }

    /// Advisory event carrying only a message.
    pub fn advisory(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0)
    }

    pub fn is_advisory(&self) -> bool {
        self.value == 0 && self.total == 0
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone)]
pub enum QdlEvent {
    /// Device channel opened.
    DeviceOpened { serial: String, product: String },
    /// Phase changed.
    PhaseChanged { from: Phase, to: Phase },
    /// Progress (or advisory) report.
    Progress(ProgressEvent),
    /// Host-side log message.
    Log { level: LogLevel, message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving session events.
///
/// Events are delivered synchronously on the thread running the session;
/// implementations should return promptly.
pub trait QdlObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &QdlEvent);
}

impl<O: QdlObserver + ?Sized> QdlObserver for Arc<O> {
    fn on_event(&self, event: &QdlEvent) {
        (**self).on_event(event)
    }
}

impl<O: QdlObserver + ?Sized> QdlObserver for &O {
    fn on_event(&self, event: &QdlEvent) {
        (**self).on_event(event)
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl QdlObserver for TracingObserver {
    fn on_event(&self, event: &QdlEvent) {
        match event {
            QdlEvent::DeviceOpened { serial, product } => {
                tracing::info!(serial = %serial, product = %product, "Device opened");
            }
            QdlEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            QdlEvent::Progress(p) if p.is_advisory() => {
                tracing::info!("{}", p.task);
            }
            QdlEvent::Progress(p) => {
                let pct = if p.total > 0 {
                    (p.value * 100) / p.total
                } else {
                    0
                };
                tracing::debug!(task = %p.task, progress = %format!("{}%", pct), "Progress");
            }
            QdlEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            QdlEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Observer that records every event, for tests and scripted front-ends.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<QdlEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<QdlEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded progress events, advisory ones included.
    pub fn progress(&self) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                QdlEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Progress events for one task, advisory ones excluded.
    pub fn progress_for(&self, task: &str) -> Vec<ProgressEvent> {
        self.progress()
            .into_iter()
            .filter(|p| p.task == task && !p.is_advisory())
            .collect()
    }
}

impl QdlObserver for RecordingObserver {
    fn on_event(&self, event: &QdlEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_progress() {
        assert!(ProgressEvent::advisory("skip boot.img").is_advisory());
        assert!(!ProgressEvent::new("boot", 0, 10).is_advisory());
    }

    #[test]
    fn test_recording_observer_filters_by_task() {
        let obs = RecordingObserver::new();
        obs.on_event(&QdlEvent::Progress(ProgressEvent::new("boot", 1, 2)));
        obs.on_event(&QdlEvent::Progress(ProgressEvent::advisory("boot")));
        obs.on_event(&QdlEvent::Progress(ProgressEvent::new("system", 1, 2)));
        obs.on_event(&QdlEvent::Complete);

        assert_eq!(obs.events().len(), 4);
        assert_eq!(obs.progress().len(), 3);
        assert_eq!(obs.progress_for("boot"), vec![ProgressEvent::new("boot", 1, 2)]);
    }
}
