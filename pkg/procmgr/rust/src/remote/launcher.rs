// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::backend::ProcessBackend;
use crate::errors::Result;
use crate::idle::{IdleDelegate, IdleEvent, IdleGate};
use crate::info::ProcessInfo;
use crate::manager::BackendManager;
use crate::protocol::{Command, ControlKey, Event, FramedReader, decode_data, write_message};
use crate::state::{BackendEvent, ProcessError, ProcessState, RunTracker};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep_until};

/// How long a halting launcher waits for its processes to finish.
pub const HALT_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle delegate of a launcher's own manager: the controller decides when
/// idle time is available.
///
/// Request edges go out as `idlecpurequested`; `idlecpuavailable` from the
/// controller comes in through the channel returned by [`new`](Self::new).
pub struct RemoteIdleDelegate {
    gate: IdleGate,
    outgoing: mpsc::UnboundedSender<Event>,
    available: mpsc::UnboundedReceiver<()>,
}

impl RemoteIdleDelegate {
    pub fn new(outgoing: mpsc::UnboundedSender<Event>) -> (Self, mpsc::UnboundedSender<()>) {
        let (available_tx, available_rx) = mpsc::unbounded_channel();
        (
            Self {
                gate: IdleGate::default(),
                outgoing,
                available: available_rx,
            },
            available_tx,
        )
    }

    fn on_edge(&self, active: Option<bool>) {
        if let Some(request) = active {
            let _ = self.outgoing.send(Event::IdleCpuRequested { request });
        }
    }
}

#[async_trait]
impl IdleDelegate for RemoteIdleDelegate {
    fn set_enabled(&mut self, enabled: bool) {
        let edge = self.gate.set_enabled(enabled);
        self.on_edge(edge);
    }

    fn set_requested(&mut self, requested: bool) {
        let edge = self.gate.set_requested(requested);
        self.on_edge(edge);
    }

    fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    async fn next_event(&mut self) -> IdleEvent {
        loop {
            if self.available.recv().await.is_none() {
                return std::future::pending().await;
            }
            if self.gate.is_active() {
                return IdleEvent::Available;
            }
            debug!("idle time offered but not requested");
        }
    }
}

enum Control {
    Stop(i64),
    Write(Vec<u8>),
    Priority(i32),
    OomAdjustment(i32),
}

/// Serve one controller connection with `manager` until the controller
/// halts or goes away. Every backend is stopped before returning.
pub async fn serve<R, W>(mut manager: BackendManager, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_events(writer, outgoing_rx));

    let (idle, idle_available) = RemoteIdleDelegate::new(outgoing_tx.clone());
    manager.set_idle_delegate(Box::new(idle));

    let mut launcher = Launcher {
        manager,
        backends: HashMap::new(),
        tasks: JoinSet::new(),
        outgoing: outgoing_tx,
        idle_available,
        reported: None,
        halt_deadline: None,
    };
    launcher.run(FramedReader::new(reader)).await;

    launcher.tasks.shutdown().await;
    drop(launcher);
    if let Err(e) = writer_task.await {
        warn!("event writer failed: {e}");
    }
    Ok(())
}

async fn write_events<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        if let Err(e) = write_message(&mut writer, &event).await {
            warn!("failed to send event: {e}");
            return;
        }
    }
}

struct Launcher {
    manager: BackendManager,
    backends: HashMap<u32, mpsc::UnboundedSender<Control>>,
    tasks: JoinSet<()>,
    outgoing: mpsc::UnboundedSender<Event>,
    idle_available: mpsc::UnboundedSender<()>,
    reported: Option<std::result::Result<Vec<u32>, String>>,
    halt_deadline: Option<Instant>,
}

impl Launcher {
    async fn run<R: AsyncRead + Unpin>(&mut self, mut reader: FramedReader<R>) {
        loop {
            self.backends.retain(|_, control| !control.is_closed());
            if self.halt_deadline.is_some() && self.backends.is_empty() {
                info!("all processes finished, halting");
                return;
            }
            self.report_internal_processes();

            let halting = self.halt_deadline.is_some();
            let deadline = self
                .halt_deadline
                .unwrap_or_else(|| Instant::now() + HALT_TIMEOUT);
            tokio::select! {
                command = reader.next::<Command>(), if !halting => match command {
                    Ok(Some(command)) => self.handle(command),
                    Ok(None) => {
                        info!("controller closed the connection");
                        self.halt();
                    }
                    Err(e) => {
                        warn!("controller connection failed: {e}");
                        self.halt();
                    }
                },
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined {
                        error!("backend task failed: {e}");
                    }
                }
                _ = self.manager.next_idle() => {}
                _ = sleep_until(deadline), if halting => {
                    warn!(
                        "{} processes still running after {HALT_TIMEOUT:?}, halting anyway",
                        self.backends.len()
                    );
                    return;
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { id, spec } => self.start(id, spec),
            Command::Stop { id, timeout } => self.control(id, Control::Stop(timeout)),
            Command::Set { id, key, value } => {
                let value = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                let control = match key {
                    ControlKey::Priority => Control::Priority(value),
                    ControlKey::OomAdjustment => Control::OomAdjustment(value),
                };
                self.control(id, control);
            }
            Command::Write { id, data } => match decode_data(&data) {
                Ok(data) => self.control(id, Control::Write(data)),
                Err(e) => {
                    warn!("[{id}] dropping write: {e}");
                    self.send(Event::for_backend(
                        id,
                        BackendEvent::error(ProcessError::WriteError),
                    ));
                }
            },
            Command::Memory { restricted } => self.manager.set_memory_restricted(restricted),
            Command::IdleCpuAvailable => {
                let _ = self.idle_available.send(());
            }
            Command::Halt => {
                info!("halt requested");
                self.halt();
            }
        }
    }

    fn start(&mut self, id: u32, spec: ProcessInfo) {
        if self
            .backends
            .get(&id)
            .is_some_and(|control| !control.is_closed())
        {
            error!("[{id}] start for an id that is already running, ignored");
            return;
        }
        let Some(backend) = self.manager.create(&spec) else {
            warn!("[{id}] no factory for {}", spec.label());
            self.send(Event::StateChanged {
                id,
                state: ProcessState::Starting,
            });
            self.send(Event::for_backend(
                id,
                BackendEvent::error(ProcessError::FailedToStart),
            ));
            self.send(Event::StateChanged {
                id,
                state: ProcessState::NotRunning,
            });
            return;
        };
        debug!("[{id}] starting {}", spec.label());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.backends.insert(id, control_tx);
        self.tasks
            .spawn(pump(id, backend, control_rx, self.outgoing.clone()));
    }

    fn control(&mut self, id: u32, control: Control) {
        match self.backends.get(&id) {
            Some(backend) if backend.send(control).is_ok() => {}
            _ => debug!("[{id}] command for a process that is not running"),
        }
    }

    fn halt(&mut self) {
        if self.halt_deadline.is_some() {
            return;
        }
        for control in self.backends.values() {
            let _ = control.send(Control::Stop(0));
        }
        self.halt_deadline = Some(Instant::now() + HALT_TIMEOUT);
    }

    fn send(&self, event: Event) {
        let _ = self.outgoing.send(event);
    }

    fn report_internal_processes(&mut self) {
        let current = self
            .manager
            .internal_processes()
            .map_err(|e| e.to_string());
        if self.reported.as_ref() == Some(&current) {
            return;
        }
        match current {
            Ok(ref pids) => self.send(Event::InternalProcesses { pids: pids.clone() }),
            Err(ref error) => self.send(Event::InternalProcessError {
                error: error.clone(),
            }),
        }
        self.reported = Some(current);
    }
}

/// Drive one backend: apply controls, forward its events tagged with `id`.
/// Ends with the run (see [`RunTracker`]), or when the launcher drops the
/// control channel (which drops the backend and kills its process).
async fn pump(
    id: u32,
    mut backend: Box<dyn ProcessBackend>,
    mut controls: mpsc::UnboundedReceiver<Control>,
    outgoing: mpsc::UnboundedSender<Event>,
) {
    let mut run = RunTracker::default();
    backend.start();
    loop {
        tokio::select! {
            control = controls.recv() => match control {
                Some(Control::Stop(timeout)) => backend.stop(timeout),
                Some(Control::Write(data)) => {
                    if backend.write(&data) < 0 {
                        let _ = outgoing.send(Event::for_backend(
                            id,
                            BackendEvent::error(ProcessError::WriteError),
                        ));
                    }
                }
                Some(Control::Priority(priority)) => backend.set_desired_priority(priority),
                Some(Control::OomAdjustment(adjustment)) => {
                    backend.set_desired_oom_adjustment(adjustment)
                }
                None => {
                    debug!("[{id}] dropped by the launcher");
                    return;
                }
            },
            event = backend.next_event() => {
                let Some(event) = event else {
                    return;
                };
                let last = run.ends_run(&event);
                if last {
                    // The id is free again before the controller hears about it.
                    controls.close();
                }
                let _ = outgoing.send(Event::for_backend(id, event));
                if last {
                    return;
                }
            }
        }
    }
}
