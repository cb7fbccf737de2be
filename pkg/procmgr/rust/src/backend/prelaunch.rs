// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Warm backend: a process started from a generic template, later given its
//! real identity.
//!
//! Until the owner calls `start()`, events from the generic process are
//! queued instead of delivered. `start()` hands the real specification to the
//! process on its stdin (one protocol frame), then replays the queue in
//! order before passing live events through.

use super::{BackendCore, BackendId, ProcessBackend, UnixProcessBackend};
use crate::errors::{Error, Result};
use crate::info::ProcessInfo;
use crate::protocol::frame;
use crate::state::{BackendEvent, ProcessState};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;

pub struct PrelaunchProcessBackend {
    core: BackendCore,
    inner: UnixProcessBackend,
    queue: VecDeque<BackendEvent>,
    identified: bool,
    released: bool,
}

impl PrelaunchProcessBackend {
    /// Start a generic process from `template`.
    pub fn launch(template: ProcessInfo) -> Self {
        let mut inner = UnixProcessBackend::new(template.clone());
        inner.start();
        Self {
            core: BackendCore::new(inner.id(), template),
            inner,
            queue: VecDeque::new(),
            identified: false,
            released: false,
        }
    }

    /// Move events already produced by the generic process into the queue.
    pub fn pump(&mut self) {
        if self.released {
            return;
        }
        while let Some(event) = self.inner.try_next_event() {
            self.queue.push_back(event);
        }
    }

    /// Whether the generic process is still alive, as far as pumped events
    /// tell.
    pub fn is_alive(&self) -> bool {
        self.inner.state().is_alive()
    }

    /// Pid of the generic process while it runs.
    pub fn process_id(&self) -> Option<u32> {
        self.inner.live_pid()
    }

    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    /// Give the backend its real identity. Allowed once, before `start()`.
    pub fn set_info(&mut self, info: ProcessInfo) -> Result<()> {
        if self.identified || self.released {
            return Err(Error::AlreadyIdentified { id: self.core.id() });
        }
        debug!(
            "[{}] warm instance becomes {}",
            self.core.info().label(),
            info.label()
        );
        let priority = info.priority();
        let oom_adjustment = info.oom_adjustment();
        self.inner.set_info(info.clone());
        self.core.set_info(info);
        if let Some(priority) = priority {
            self.inner.set_desired_priority(priority);
        }
        if let Some(adjustment) = oom_adjustment {
            self.inner.set_desired_oom_adjustment(adjustment);
        }
        self.identified = true;
        Ok(())
    }

    fn hand_off(&mut self) {
        match frame::encode(self.core.info()) {
            Ok(handoff) => {
                if self.inner.write(&handoff) < 0 {
                    warn!(
                        "[{}] could not hand the specification to the warm process",
                        self.core.info().label()
                    );
                }
            }
            Err(e) => warn!(
                "[{}] could not encode the specification: {e}",
                self.core.info().label()
            ),
        }
    }
}

#[async_trait]
impl ProcessBackend for PrelaunchProcessBackend {
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
        if self.released {
            warn!("[{}] already started", self.core.info().label());
            return;
        }
        self.pump();
        self.released = true;
        if self.inner.state().is_alive() {
            self.hand_off();
        }
        for event in self.queue.drain(..) {
            self.core.emit(event);
        }
    }

    fn stop(&mut self, timeout_ms: i64) {
        self.inner.stop(timeout_ms);
    }

    fn write(&mut self, data: &[u8]) -> i64 {
        self.inner.write(data)
    }

    fn desired_priority(&self) -> Option<i32> {
        self.inner.desired_priority()
    }

    fn set_desired_priority(&mut self, priority: i32) {
        self.core.set_desired_priority(priority);
        self.inner.set_desired_priority(priority);
    }

    fn actual_priority(&self) -> Option<i32> {
        self.inner.actual_priority()
    }

    fn desired_oom_adjustment(&self) -> Option<i32> {
        self.inner.desired_oom_adjustment()
    }

    fn set_desired_oom_adjustment(&mut self, adjustment: i32) {
        self.core.set_desired_oom_adjustment(adjustment);
        self.inner.set_desired_oom_adjustment(adjustment);
    }

    fn actual_oom_adjustment(&self) -> Option<i32> {
        self.inner.actual_oom_adjustment()
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        if !self.released {
            // Nothing is visible before the owner starts us.
            return std::future::pending().await;
        }
        if let Some(event) = self.core.try_next_event() {
            return Some(event);
        }
        let event = self.inner.next_event().await?;
        self.core.apply(&event);
        Some(event)
    }

    fn try_next_event(&mut self) -> Option<BackendEvent> {
        if !self.released {
            return None;
        }
        if let Some(event) = self.core.try_next_event() {
            return Some(event);
        }
        let event = self.inner.try_next_event()?;
        self.core.apply(&event);
        Some(event)
    }
}
