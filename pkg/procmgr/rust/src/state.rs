// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessState {
    /// No process, either never started or already finished.
    #[default]
    NotRunning,
    /// Spawned, waiting to be considered ready.
    Starting,
    /// Process is alive and ready.
    Running,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        self != ProcessState::NotRunning
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (NotRunning, Starting)
                | (Starting, Running)
                | (Starting, NotRunning)
                | (Running, NotRunning)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotRunning => write!(f, "not running"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    NormalExit,
    /// Killed by a signal, including a stop issued by this crate.
    CrashExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessError {
    FailedToStart,
    Crashed,
    Timedout,
    WriteError,
    ReadError,
    UnknownError,
}

impl ProcessError {
    pub fn description(self) -> &'static str {
        match self {
            ProcessError::FailedToStart => "process failed to start",
            ProcessError::Crashed => "process crashed",
            ProcessError::Timedout => "operation timed out",
            ProcessError::WriteError => "error writing to process",
            ProcessError::ReadError => "error reading from process",
            ProcessError::UnknownError => "unknown error",
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Lifecycle and I/O notifications produced by a backend.
///
/// For one backend, `Finished` is always the last event of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Started { pid: u32 },
    StateChanged(ProcessState),
    StandardOutput(Vec<u8>),
    StandardError(Vec<u8>),
    Finished { exit_code: i32, exit_status: ExitStatus },
    Error { error: ProcessError, message: String },
}

impl BackendEvent {
    pub fn error(error: ProcessError) -> Self {
        BackendEvent::Error {
            error,
            message: error.description().to_string(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, BackendEvent::Finished { .. })
    }
}

/// Follows one backend's event stream to tell where each run ends.
///
/// A run ends with `Finished`, or with `NotRunning` when no pid was ever
/// reported (the process never existed, so no `Finished` follows).
#[derive(Debug, Default)]
pub struct RunTracker {
    spawned: bool,
}

impl RunTracker {
    /// Feed the next event; true when it is the last one of the run.
    pub fn ends_run(&mut self, event: &BackendEvent) -> bool {
        match event {
            BackendEvent::StateChanged(ProcessState::Starting) => {
                self.spawned = false;
                false
            }
            BackendEvent::Started { .. } => {
                self.spawned = true;
                false
            }
            BackendEvent::StateChanged(ProcessState::NotRunning) => !self.spawned,
            BackendEvent::Finished { .. } => {
                self.spawned = false;
                true
            }
            _ => false,
        }
    }

    /// Whether the current run reported a pid.
    pub fn spawned(&self) -> bool {
        self.spawned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ProcessState::*;
        assert!(NotRunning.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(NotRunning));
        assert!(Running.can_transition_to(NotRunning));
        assert!(!NotRunning.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn test_is_alive() {
        assert!(!ProcessState::NotRunning.is_alive());
        assert!(ProcessState::Starting.is_alive());
        assert!(ProcessState::Running.is_alive());
    }

    #[test]
    fn test_run_ends_on_finished_once_spawned() {
        let mut run = RunTracker::default();
        assert!(!run.ends_run(&BackendEvent::StateChanged(ProcessState::Starting)));
        assert!(!run.ends_run(&BackendEvent::Started { pid: 12 }));
        assert!(run.spawned());
        assert!(!run.ends_run(&BackendEvent::StateChanged(ProcessState::Running)));
        assert!(!run.ends_run(&BackendEvent::error(ProcessError::Crashed)));
        assert!(!run.ends_run(&BackendEvent::StateChanged(ProcessState::NotRunning)));
        assert!(run.ends_run(&BackendEvent::Finished {
            exit_code: 9,
            exit_status: ExitStatus::CrashExit
        }));
        assert!(!run.spawned());
    }

    #[test]
    fn test_run_ends_on_not_running_without_pid() {
        let mut run = RunTracker::default();
        run.ends_run(&BackendEvent::StateChanged(ProcessState::Starting));
        assert!(!run.ends_run(&BackendEvent::error(ProcessError::FailedToStart)));
        assert!(run.ends_run(&BackendEvent::StateChanged(ProcessState::NotRunning)));

        // A new run forgets the previous pid.
        run.ends_run(&BackendEvent::Started { pid: 3 });
        run.ends_run(&BackendEvent::StateChanged(ProcessState::Starting));
        assert!(run.ends_run(&BackendEvent::StateChanged(ProcessState::NotRunning)));
    }

    #[test]
    fn test_error_event_carries_description() {
        assert_eq!(
            BackendEvent::error(ProcessError::Crashed),
            BackendEvent::Error {
                error: ProcessError::Crashed,
                message: "process crashed".to_string()
            }
        );
    }
}
