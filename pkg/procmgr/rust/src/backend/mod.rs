// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process backends: the startable unit behind every managed process.
//!
//! A backend reports everything that happens to its process as
//! [`BackendEvent`]s. Its observable state (`state()`, `pid()`) follows the
//! events the owner has consumed with [`ProcessBackend::next_event`].

pub mod prelaunch;
pub mod remote;
pub mod unix;

pub use prelaunch::PrelaunchProcessBackend;
pub use remote::RemoteProcessBackend;
pub use unix::UnixProcessBackend;

use crate::info::ProcessInfo;
use crate::state::{BackendEvent, ProcessState};
use async_trait::async_trait;
use log::warn;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

pub type BackendId = u32;

static NEXT_BACKEND_ID: AtomicU32 = AtomicU32::new(1);

/// Process-local, monotonically increasing backend id.
pub fn next_backend_id() -> BackendId {
    NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed)
}

#[async_trait]
pub trait ProcessBackend: Send {
    fn id(&self) -> BackendId;

    fn info(&self) -> &ProcessInfo;

    fn state(&self) -> ProcessState;

    fn pid(&self) -> Option<u32>;

    /// Start the process. Progress and failures arrive as events.
    fn start(&mut self);

    /// Ask the process to terminate, escalating to a kill after
    /// `timeout_ms`. A zero or negative timeout kills immediately.
    fn stop(&mut self, timeout_ms: i64);

    /// Forward `data` to the process's standard input. Returns the number of
    /// bytes accepted, or -1 when the process cannot take input.
    fn write(&mut self, data: &[u8]) -> i64;

    fn desired_priority(&self) -> Option<i32>;

    fn set_desired_priority(&mut self, priority: i32);

    fn actual_priority(&self) -> Option<i32>;

    fn desired_oom_adjustment(&self) -> Option<i32>;

    fn set_desired_oom_adjustment(&mut self, adjustment: i32);

    fn actual_oom_adjustment(&self) -> Option<i32>;

    /// Wait for the next event. Stays pending once the run has finished and
    /// nothing else is queued.
    async fn next_event(&mut self) -> Option<BackendEvent>;

    /// The next event if one is already queued.
    fn try_next_event(&mut self) -> Option<BackendEvent>;
}

/// Bookkeeping shared by every backend implementation.
pub(crate) struct BackendCore {
    id: BackendId,
    info: ProcessInfo,
    state: ProcessState,
    pid: Option<u32>,
    desired_priority: Option<i32>,
    desired_oom_adjustment: Option<i32>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl BackendCore {
    pub(crate) fn new(id: BackendId, info: ProcessInfo) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            desired_priority: info.priority(),
            desired_oom_adjustment: info.oom_adjustment(),
            info,
            state: ProcessState::NotRunning,
            pid: None,
            events_tx,
            events_rx,
        }
    }

    pub(crate) fn id(&self) -> BackendId {
        self.id
    }

    pub(crate) fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub(crate) fn set_info(&mut self, info: ProcessInfo) {
        self.desired_priority = info.priority();
        self.desired_oom_adjustment = info.oom_adjustment();
        self.info = info;
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn desired_priority(&self) -> Option<i32> {
        self.desired_priority
    }

    pub(crate) fn set_desired_priority(&mut self, priority: i32) -> i32 {
        let priority = priority.clamp(crate::info::MIN_PRIORITY, crate::info::MAX_PRIORITY);
        self.desired_priority = Some(priority);
        priority
    }

    pub(crate) fn desired_oom_adjustment(&self) -> Option<i32> {
        self.desired_oom_adjustment
    }

    pub(crate) fn set_desired_oom_adjustment(&mut self, adjustment: i32) -> i32 {
        let adjustment = adjustment.clamp(
            crate::info::MIN_OOM_ADJUSTMENT,
            crate::info::MAX_OOM_ADJUSTMENT,
        );
        self.desired_oom_adjustment = Some(adjustment);
        adjustment
    }

    /// Sender for producers outside the owner (supervisor tasks, transports).
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<BackendEvent> {
        self.events_tx.clone()
    }

    /// Queue an event produced by the owner itself.
    pub(crate) fn emit(&self, event: BackendEvent) {
        // The receiver lives in `self`, so this cannot fail.
        let _ = self.events_tx.send(event);
    }

    pub(crate) async fn next_event(&mut self) -> Option<BackendEvent> {
        let event = self.events_rx.recv().await?;
        self.apply(&event);
        Some(event)
    }

    pub(crate) fn try_next_event(&mut self) -> Option<BackendEvent> {
        let event = self.events_rx.try_recv().ok()?;
        self.apply(&event);
        Some(event)
    }

    /// Mirror an event into the observable state.
    pub(crate) fn apply(&mut self, event: &BackendEvent) {
        match event {
            BackendEvent::Started { pid } => self.pid = Some(*pid),
            BackendEvent::StateChanged(next) => {
                if *next != self.state && !self.state.can_transition_to(*next) {
                    warn!(
                        "[{}] unexpected transition {} -> {}",
                        self.info.label(),
                        self.state,
                        next
                    );
                }
                self.state = *next;
            }
            BackendEvent::Finished { .. } => {
                self.pid = None;
                self.state = ProcessState::NotRunning;
            }
            BackendEvent::StandardOutput(_)
            | BackendEvent::StandardError(_)
            | BackendEvent::Error { .. } => {}
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExitStatus, ProcessError};

    #[test]
    fn test_ids_are_increasing() {
        let a = next_backend_id();
        let b = next_backend_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_core_mirrors_delivered_events() {
        let mut core = BackendCore::new(next_backend_id(), ProcessInfo::new());
        let tx = core.sender();

        tx.send(BackendEvent::StateChanged(ProcessState::Starting))
            .unwrap();
        tx.send(BackendEvent::Started { pid: 77 }).unwrap();
        assert_eq!(core.state(), ProcessState::NotRunning);

        core.next_event().await;
        assert_eq!(core.state(), ProcessState::Starting);
        core.next_event().await;
        assert_eq!(core.pid(), Some(77));

        core.emit(BackendEvent::error(ProcessError::Crashed));
        core.emit(BackendEvent::Finished {
            exit_code: 0,
            exit_status: ExitStatus::CrashExit,
        });
        core.try_next_event();
        assert_eq!(core.pid(), Some(77));
        core.try_next_event();
        assert_eq!(core.pid(), None);
        assert_eq!(core.state(), ProcessState::NotRunning);
        assert!(core.try_next_event().is_none());
    }

    #[test]
    fn test_desired_values_are_clamped_and_kept() {
        let mut info = ProcessInfo::new();
        info.set_priority(3);
        let mut core = BackendCore::new(next_backend_id(), info);
        assert_eq!(core.desired_priority(), Some(3));
        assert_eq!(core.set_desired_priority(99), 19);
        assert_eq!(core.desired_priority(), Some(19));
        assert_eq!(core.set_desired_oom_adjustment(-4000), -1000);
        assert_eq!(core.desired_oom_adjustment(), Some(-1000));
    }
}
