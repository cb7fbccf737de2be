// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Local backend: spawns the process directly and supervises it from a
//! tokio task that owns the child.

use super::{BackendCore, BackendId, ProcessBackend, next_backend_id};
use crate::errors::{Error, Result};
use crate::info::ProcessInfo;
use crate::platform::{self, ChildIdentity};
use crate::state::{BackendEvent, ExitStatus, ProcessError, ProcessState};
use async_trait::async_trait;
use log::{debug, info, warn};
use memchr::memmem;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until, timeout};

const READ_CHUNK: usize = 8192;
/// How long output is still collected once the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

enum Control {
    Stop { timeout_ms: i64 },
}

pub struct UnixProcessBackend {
    core: BackendCore,
    control: Option<mpsc::UnboundedSender<Control>>,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    spawned_pid: Option<u32>,
}

impl UnixProcessBackend {
    pub fn new(info: ProcessInfo) -> Self {
        Self {
            core: BackendCore::new(next_backend_id(), info),
            control: None,
            input: None,
            spawned_pid: None,
        }
    }

    pub(crate) fn set_info(&mut self, info: ProcessInfo) {
        self.core.set_info(info);
    }

    /// Pid of the child while its supervisor is still running.
    pub(crate) fn live_pid(&self) -> Option<u32> {
        match self.control {
            Some(ref control) if !control.is_closed() => self.spawned_pid,
            _ => None,
        }
    }

    fn spawn(&self) -> Result<Child> {
        let info = self.core.info();
        let program = info.program().ok_or_else(|| Error::InvalidValue {
            key: crate::info::keys::PROGRAM.to_string(),
            context: "no program to run".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(info.arguments());
        if let Some(env) = info.environment() {
            cmd.env_clear();
            cmd.envs(env);
        }
        if let Some(dir) = info.working_directory() {
            if std::path::Path::new(dir).is_dir() {
                cmd.current_dir(dir);
            } else {
                warn!(
                    "[{}] working directory {dir} is not available, keeping the current one",
                    info.label()
                );
            }
        }
        if info.process_group() {
            cmd.process_group(0);
        }

        let identity = ChildIdentity::resolve(info)?;
        if !identity.is_empty() {
            // SAFETY: the closure only issues system calls on values
            // resolved before the fork.
            unsafe {
                cmd.pre_exec(move || identity.apply());
            }
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(cmd.spawn()?)
    }

    fn apply_resources(&self, pid: u32) {
        let label = self.core.info().label();
        if let Some(priority) = self.core.desired_priority()
            && let Err(e) = platform::set_priority(pid, priority)
        {
            warn!("[{label}] failed to set priority {priority}: {e}");
        }
        if let Some(adjustment) = self.core.desired_oom_adjustment()
            && let Err(e) = platform::set_oom_adjustment(pid, adjustment)
        {
            warn!("[{label}] failed to set OOM adjustment {adjustment}: {e}");
        }
    }
}

#[async_trait]
impl ProcessBackend for UnixProcessBackend {
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
        let label = self.core.info().label().to_string();
        if self.live_pid().is_some() {
            warn!("[{label}] already started");
            return;
        }

        self.core
            .emit(BackendEvent::StateChanged(ProcessState::Starting));

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("[{label}] failed to spawn: {e}");
                self.core.emit(BackendEvent::Error {
                    error: ProcessError::FailedToStart,
                    message: e.to_string(),
                });
                self.core
                    .emit(BackendEvent::StateChanged(ProcessState::NotRunning));
                return;
            }
        };

        let pid = child.id().unwrap_or(0);
        info!(
            "[{label}] spawned (pid={pid}, cmd={})",
            self.core.info().program().unwrap_or_default()
        );
        self.apply_resources(pid);

        self.core.emit(BackendEvent::Started { pid });
        let ready_pattern = self.core.info().start_output_pattern().map(<[u8]>::to_vec);
        if ready_pattern.is_none() {
            self.core
                .emit(BackendEvent::StateChanged(ProcessState::Running));
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (write_errors_tx, write_errors_rx) = mpsc::unbounded_channel();
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed_input(label.clone(), stdin, input_rx, write_errors_tx));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            label,
            pid,
            events: self.core.sender(),
            ready_pattern,
            seen: Vec::new(),
            stopping: false,
        };
        tokio::spawn(supervisor.run(child, control_rx, write_errors_rx));

        self.control = Some(control_tx);
        self.input = Some(input_tx);
        self.spawned_pid = Some(pid);
    }

    fn stop(&mut self, timeout_ms: i64) {
        match self.control {
            Some(ref control) if control.send(Control::Stop { timeout_ms }).is_ok() => {}
            _ => debug!("[{}] stop requested but not running", self.core.info().label()),
        }
    }

    fn write(&mut self, data: &[u8]) -> i64 {
        if self.live_pid().is_some()
            && let Some(ref input) = self.input
            && input.send(data.to_vec()).is_ok()
        {
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
        if let Some(pid) = self.live_pid()
            && let Err(e) = platform::set_priority(pid, priority)
        {
            warn!(
                "[{}] failed to set priority {priority}: {e}",
                self.core.info().label()
            );
        }
    }

    fn actual_priority(&self) -> Option<i32> {
        self.live_pid().and_then(platform::priority)
    }

    fn desired_oom_adjustment(&self) -> Option<i32> {
        self.core.desired_oom_adjustment()
    }

    fn set_desired_oom_adjustment(&mut self, adjustment: i32) {
        let adjustment = self.core.set_desired_oom_adjustment(adjustment);
        if let Some(pid) = self.live_pid()
            && let Err(e) = platform::set_oom_adjustment(pid, adjustment)
        {
            warn!(
                "[{}] failed to set OOM adjustment {adjustment}: {e}",
                self.core.info().label()
            );
        }
    }

    fn actual_oom_adjustment(&self) -> Option<i32> {
        self.live_pid().and_then(platform::oom_adjustment)
    }

    async fn next_event(&mut self) -> Option<BackendEvent> {
        self.core.next_event().await
    }

    fn try_next_event(&mut self) -> Option<BackendEvent> {
        self.core.try_next_event()
    }
}

async fn feed_input(
    label: String,
    mut stdin: ChildStdin,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    errors: mpsc::UnboundedSender<String>,
) {
    while let Some(data) = input.recv().await {
        let result = match stdin.write_all(&data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("[{label}] failed to write to stdin: {e}");
            let _ = errors.send(e.to_string());
            return;
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

struct Supervisor {
    label: String,
    pid: u32,
    events: mpsc::UnboundedSender<BackendEvent>,
    ready_pattern: Option<Vec<u8>>,
    /// Recent stdout kept for a ready pattern split across reads.
    seen: Vec<u8>,
    stopping: bool,
}

impl Supervisor {
    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        mut self,
        mut child: Child,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut write_errors: mpsc::UnboundedReceiver<String>,
    ) {
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];

        let kill_timer = sleep_until(Instant::now());
        tokio::pin!(kill_timer);
        let mut kill_armed = false;
        let mut owner_alive = true;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                n = read_chunk(&mut stdout, &mut out_buf) => match n {
                    Ok(n) if n > 0 => self.on_stdout(&out_buf[..n]),
                    _ => stdout = None,
                },
                n = read_chunk(&mut stderr, &mut err_buf) => match n {
                    Ok(n) if n > 0 => self.emit(BackendEvent::StandardError(err_buf[..n].to_vec())),
                    _ => stderr = None,
                },
                command = control.recv(), if owner_alive => match command {
                    Some(Control::Stop { timeout_ms }) => {
                        self.stopping = true;
                        if timeout_ms <= 0 {
                            info!("[{}] killing (pid={})", self.label, self.pid);
                            if let Err(e) = child.start_kill() {
                                warn!("[{}] failed to kill: {e}", self.label);
                            }
                        } else {
                            info!("[{}] sending SIGTERM (pid={})", self.label, self.pid);
                            if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                                warn!("[{}] failed to send SIGTERM: {e}", self.label);
                            }
                            kill_timer
                                .as_mut()
                                .reset(Instant::now() + Duration::from_millis(timeout_ms as u64));
                            kill_armed = true;
                        }
                    }
                    None => {
                        // The backend was dropped while its process lives.
                        owner_alive = false;
                        info!("[{}] backend released, killing (pid={})", self.label, self.pid);
                        let _ = child.start_kill();
                    }
                },
                Some(message) = write_errors.recv() => {
                    self.emit(BackendEvent::Error { error: ProcessError::WriteError, message });
                },
                _ = &mut kill_timer, if kill_armed => {
                    kill_armed = false;
                    warn!("[{}] stop timeout reached, sending SIGKILL", self.label);
                    if let Err(e) = child.start_kill() {
                        warn!("[{}] failed to kill: {e}", self.label);
                    }
                },
            }
        };

        self.drain(&mut stdout, &mut out_buf, true).await;
        self.drain(&mut stderr, &mut err_buf, false).await;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!("[{}] failed to wait for exit: {e}", self.label);
                self.emit(BackendEvent::Error {
                    error: ProcessError::UnknownError,
                    message: e.to_string(),
                });
                self.emit(BackendEvent::StateChanged(ProcessState::NotRunning));
                self.emit(BackendEvent::Finished {
                    exit_code: -1,
                    exit_status: ExitStatus::CrashExit,
                });
                return;
            }
        };
        info!("[{}] exited with {status}", self.label);

        let exit_code = status.code().or(status.signal()).unwrap_or(-1);
        // A stop we issued is reported as a crash even on a clean exit.
        let exit_status = if self.stopping || status.signal().is_some() {
            self.emit(BackendEvent::error(ProcessError::Crashed));
            ExitStatus::CrashExit
        } else {
            ExitStatus::NormalExit
        };
        self.emit(BackendEvent::StateChanged(ProcessState::NotRunning));
        self.emit(BackendEvent::Finished {
            exit_code,
            exit_status,
        });
    }

    fn on_stdout(&mut self, data: &[u8]) {
        self.emit(BackendEvent::StandardOutput(data.to_vec()));

        let Some(ref pattern) = self.ready_pattern else {
            return;
        };
        self.seen.extend_from_slice(data);
        if memmem::find(&self.seen, pattern).is_some() {
            debug!("[{}] ready output seen", self.label);
            self.ready_pattern = None;
            self.seen = Vec::new();
            self.emit(BackendEvent::StateChanged(ProcessState::Running));
        } else {
            let keep = pattern.len().saturating_sub(1);
            let cut = self.seen.len().saturating_sub(keep);
            self.seen.drain(..cut);
        }
    }

    async fn drain<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut Option<R>,
        buf: &mut [u8],
        is_stdout: bool,
    ) {
        let Some(reader) = stream.as_mut() else {
            return;
        };
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match timeout(deadline.saturating_duration_since(Instant::now()), reader.read(buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    if is_stdout {
                        self.on_stdout(&buf[..n]);
                    } else {
                        self.emit(BackendEvent::StandardError(buf[..n].to_vec()));
                    }
                }
                _ => break,
            }
        }
        *stream = None;
    }
}
