// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Proxy for a process that lives behind a launcher connection.
//!
//! Nothing here touches the OS: state, pid and priorities come from what the
//! launcher reported, and every operation becomes a command on the wire.

use super::{BackendCore, BackendId, ProcessBackend};
use crate::info::ProcessInfo;
use crate::protocol::{Command, ControlKey};
use crate::remote::RemoteConnection;
use crate::state::{BackendEvent, ProcessError, ProcessState, RunTracker};
use async_trait::async_trait;
use log::{debug, warn};

pub struct RemoteProcessBackend {
    core: BackendCore,
    connection: RemoteConnection,
    registered: bool,
    run: RunTracker,
    actual_priority: Option<i32>,
    actual_oom_adjustment: Option<i32>,
}

impl RemoteProcessBackend {
    /// `id` must be unique on `connection`.
    pub fn new(id: BackendId, info: ProcessInfo, connection: RemoteConnection) -> Self {
        Self {
            core: BackendCore::new(id, info),
            connection,
            registered: false,
            run: RunTracker::default(),
            actual_priority: None,
            actual_oom_adjustment: None,
        }
    }

    fn fail_start(&mut self, message: &str) {
        warn!("[{}] {message}", self.core.info().label());
        self.core
            .emit(BackendEvent::StateChanged(ProcessState::Starting));
        self.core.emit(BackendEvent::Error {
            error: ProcessError::FailedToStart,
            message: message.to_string(),
        });
        self.core
            .emit(BackendEvent::StateChanged(ProcessState::NotRunning));
    }

    /// Specification with the current desired values folded in.
    fn start_spec(&self) -> ProcessInfo {
        let mut spec = self.core.info().clone();
        if let Some(priority) = self.core.desired_priority() {
            spec.set_priority(priority);
        }
        if let Some(adjustment) = self.core.desired_oom_adjustment() {
            spec.set_oom_adjustment(adjustment);
        }
        spec
    }

    fn send_set(&self, key: ControlKey, value: i32) -> bool {
        self.registered
            && self.connection.send(Command::Set {
                id: self.core.id(),
                key,
                value: i64::from(value),
            })
    }

    fn observe(&mut self, event: &BackendEvent) {
        if let BackendEvent::Started { .. } = event {
            self.actual_priority = self.core.desired_priority();
            self.actual_oom_adjustment = self.core.desired_oom_adjustment();
        }
        if self.run.ends_run(event) {
            // No route is left for this id.
            self.registered = false;
            self.actual_priority = None;
            self.actual_oom_adjustment = None;
        }
    }
}

#[async_trait]
impl ProcessBackend for RemoteProcessBackend {
    fn id(&self) -> BackendId {
        self.core.id()
    }

    fn info(&self) -> &ProcessInfo {
        self.core.info()
    }

    fn state(&self) -> ProcessState {
        self.core.state()
    }

    fn pid(&self) -> Option<u32> {
        self.core.pid()
    }

    fn start(&mut self) {
        if self.registered {
            warn!("[{}] already started", self.core.info().label());
            return;
        }
        if !self.connection.is_connected() {
            self.fail_start("launcher connection lost");
            return;
        }
        let id = self.core.id();
        if !self.connection.register(id, self.core.sender()) {
            self.fail_start("launcher connection closed");
            return;
        }
        self.registered = true;
        let spec = self.start_spec();
        if !self.connection.send(Command::Start { id, spec }) {
            self.connection.unregister(id);
            self.registered = false;
            self.fail_start("could not send start command");
        }
    }

    fn stop(&mut self, timeout_ms: i64) {
        if !self.registered {
            debug!("[{}] stop requested but not running", self.core.info().label());
            return;
        }
        self.connection.send(Command::Stop {
            id: self.core.id(),
            timeout: timeout_ms,
        });
    }

    fn write(&mut self, data: &[u8]) -> i64 {
        if self.registered && self.connection.send(Command::write(self.core.id(), data)) {
            return data.len() as i64;
        }
        warn!(
            "[{}] write of {} bytes to a process that is not running",
            self.core.info().label(),
            data.len()
        );
        -1
    }

    fn desired_priority(&self) -> Option<i32> {
        self.core.desired_priority()
    }

    fn set_desired_priority(&mut self, priority: i32) {
        let priority = self.core.set_desired_priority(priority);
        if self.send_set(ControlKey::Priority, priority) {
            self.actual_priority = Some(priority);
        }
    }

    fn actual_priority(&self) -> Option<i32> {
        self.actual_priority
    }

    fn desired_oom_adjustment(&self) -> Option<i32> {
        self.core.desired_oom_adjustment()
    }

    fn set_desired_oom_adjustment(&mut self, adjustment: i32) {
        let adjustment = self.core.set_desired_oom_adjustment(adjustment);
        if self.send_set(ControlKey::OomAdjustment, adjustment) {
            self.actual_oom_adjustment = Some(adjustment);
        }
    }

    fn actual_oom_adjustment(&self) -> Option<i32> {
        self.actual_oom_adjustment
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        let event = self.core.next_event().await?;
        self.observe(&event);
        Some(event)
    }

    fn try_next_event(&mut self) -> Option<BackendEvent> {
        let event = self.core.try_next_event()?;
        self.observe(&event);
        Some(event)
    }
}

impl Drop for RemoteProcessBackend {
    fn drop(&mut self) {
        if self.registered {
            let id = self.core.id();
            self.connection.send(Command::Stop { id, timeout: 0 });
            self.connection.unregister(id);
        }
    }
}
