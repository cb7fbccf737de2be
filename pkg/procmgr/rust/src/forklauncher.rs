// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Forking launcher: serves the remote protocol from inside a target binary,
//! before that binary's own startup runs.
//!
//! On `start` the launcher forks. The child takes on the requested identity
//! (credentials, umask, priority, OOM score, working directory, environment)
//! and [`run`] returns [`LauncherExit::Child`] in it, so the binary goes on
//! with its normal startup as that process. The parent keeps serving and
//! relays the child's output and lifecycle.
//!
//! Single-threaded: one `poll` over the command input, every child's pipes
//! and a SIGCHLD self-pipe. The signal handler only writes a byte; reaping
//! happens in the loop.

use crate::env::EnvironmentDiff;
use crate::errors::Result;
use crate::info::ProcessInfo;
use crate::platform::{self, ChildIdentity};
use crate::prefork::become_program;
use crate::protocol::frame::{self, FrameBuffer};
use crate::protocol::{Command, ControlKey, Event, decode_data};
use crate::state::{BackendEvent, ExitStatus, ProcessError, ProcessState};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe};
use signal_hook::SigId;
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 64 * 1024;

/// A `start` this process has become.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildLaunch {
    pub id: u32,
    pub info: ProcessInfo,
}

impl ChildLaunch {
    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = self.info.program().map(str::to_string).into_iter().collect();
        argv.extend(self.info.arguments());
        argv
    }

    /// Replace this process with the requested program.
    pub fn exec(&self) -> Result<Infallible> {
        become_program(&self.argv())
    }
}

#[derive(Debug)]
pub enum LauncherExit {
    /// Returned in a forked child.
    Child(ChildLaunch),
    /// The controller halted or went away, every child is reaped.
    Halted,
}

/// Serve commands from `input`, write events to `output`.
///
/// Both descriptors are owned by the launcher and closed before a child
/// returns, so pass copies when they are the process's standard streams.
pub fn run(input: OwnedFd, output: OwnedFd) -> Result<LauncherExit> {
    let (signals, notifier) = UnixStream::pair()?;
    signals.set_nonblocking(true)?;
    let sigchld = signal_hook::low_level::pipe::register(signal_hook::consts::SIGCHLD, notifier)?;

    let mut launcher = ForkLauncher {
        input: File::from(input),
        output: File::from(output),
        buffer: FrameBuffer::new(),
        signals,
        sigchld,
        children: Vec::new(),
        halting: false,
    };
    let exit = launcher.serve();
    if !matches!(exit, Ok(LauncherExit::Child(_))) {
        signal_hook::low_level::unregister(sigchld);
    }
    exit
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildExit {
    Code(i32),
    Signal(i32),
}

/// Events closing a run, in order.
fn finish_events(exit: ChildExit, stopping: bool) -> Vec<BackendEvent> {
    let (exit_code, crashed) = match exit {
        ChildExit::Code(code) => (code, stopping),
        ChildExit::Signal(signal) => (signal, true),
    };
    let mut events = Vec::with_capacity(3);
    if crashed {
        events.push(BackendEvent::error(ProcessError::Crashed));
    }
    events.push(BackendEvent::StateChanged(ProcessState::NotRunning));
    events.push(BackendEvent::Finished {
        exit_code,
        exit_status: if crashed {
            ExitStatus::CrashExit
        } else {
            ExitStatus::NormalExit
        },
    });
    events
}

/// Time left until the earliest deadline, rounded up to whole milliseconds.
fn poll_timeout(now: Instant, deadlines: impl Iterator<Item = Instant>) -> PollTimeout {
    let Some(earliest) = deadlines.min() else {
        return PollTimeout::NONE;
    };
    let left = earliest.saturating_duration_since(now);
    let ms = left.as_millis() + u128::from(left.subsec_nanos() % 1_000_000 != 0);
    PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor this process owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

struct Child {
    id: u32,
    pid: Pid,
    label: String,
    stdin: Option<File>,
    /// Input the pipe has not taken yet, flushed when it becomes writable.
    pending: Vec<u8>,
    stdout: Option<File>,
    stderr: Option<File>,
    stopping: bool,
    kill_at: Option<Instant>,
    exit: Option<ChildExit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Input,
    Signals,
    Stdin(u32),
    Stdout(u32),
    Stderr(u32),
}

struct ForkLauncher {
    input: File,
    output: File,
    buffer: FrameBuffer,
    signals: UnixStream,
    sigchld: SigId,
    children: Vec<Child>,
    halting: bool,
}

impl ForkLauncher {
    fn serve(&mut self) -> Result<LauncherExit> {
        loop {
            if self.halting && self.children.is_empty() {
                info!("[forklauncher] halted");
                return Ok(LauncherExit::Halted);
            }
            self.expire_deadlines();

            let mut ready = self.wait()?;
            // Output first so it is relayed before the exit it precedes.
            ready.sort_by_key(|source| match source {
                Source::Stdout(_) | Source::Stderr(_) => 0,
                Source::Stdin(_) | Source::Signals => 1,
                Source::Input => 2,
            });
            for source in ready {
                match source {
                    Source::Stdout(id) => self.relay(id, false),
                    Source::Stderr(id) => self.relay(id, true),
                    Source::Stdin(id) => self.flush_input(id),
                    Source::Signals => self.reap()?,
                    Source::Input => {
                        if let Some(launch) = self.read_commands()? {
                            return Ok(LauncherExit::Child(launch));
                        }
                    }
                }
            }
            self.finish_exited();
        }
    }

    fn wait(&self) -> Result<Vec<Source>> {
        let mut sources = Vec::new();
        let mut fds = Vec::new();
        if !self.halting {
            sources.push(Source::Input);
            fds.push(PollFd::new(self.input.as_fd(), PollFlags::POLLIN));
        }
        sources.push(Source::Signals);
        fds.push(PollFd::new(self.signals.as_fd(), PollFlags::POLLIN));
        for child in &self.children {
            if let Some(ref stdin) = child.stdin
                && !child.pending.is_empty()
            {
                sources.push(Source::Stdin(child.id));
                fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLOUT));
            }
            if let Some(ref stdout) = child.stdout {
                sources.push(Source::Stdout(child.id));
                fds.push(PollFd::new(stdout.as_fd(), PollFlags::POLLIN));
            }
            if let Some(ref stderr) = child.stderr {
                sources.push(Source::Stderr(child.id));
                fds.push(PollFd::new(stderr.as_fd(), PollFlags::POLLIN));
            }
        }

        let timeout = poll_timeout(
            Instant::now(),
            self.children.iter().filter_map(|c| c.kill_at),
        );
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        let ready =
            PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(fds
            .iter()
            .zip(sources)
            .filter(|(fd, _)| fd.revents().is_some_and(|r| r.intersects(ready)))
            .map(|(_, source)| source)
            .collect())
    }

    fn send(&mut self, event: Event) {
        let result = frame::encode(&event).and_then(|frame| {
            self.output.write_all(&frame)?;
            Ok(())
        });
        if let Err(e) = result {
            error!("[forklauncher] failed to send event: {e}");
            self.halt();
        }
    }

    fn send_backend(&mut self, id: u32, event: BackendEvent) {
        self.send(Event::for_backend(id, event));
    }

    fn read_commands(&mut self) -> Result<Option<ChildLaunch>> {
        let mut chunk = vec![0; READ_CHUNK];
        let n = match self.input.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => {
                warn!("[forklauncher] failed to read commands: {e}");
                0
            }
        };
        if n == 0 {
            info!("[forklauncher] controller went away");
            self.halt();
            return Ok(None);
        }
        self.buffer.extend(&chunk[..n]);

        loop {
            let command = match self.buffer.next_frame() {
                Ok(Some(frame)) => frame::decode::<Command>(&frame),
                Ok(None) => return Ok(None),
                Err(e) => Err(e),
            };
            match command {
                Ok(command) => {
                    if let Some(launch) = self.handle(command)? {
                        return Ok(Some(launch));
                    }
                }
                Err(e) => {
                    error!("[forklauncher] bad command stream: {e}");
                    self.buffer.clear();
                    self.halt();
                    return Ok(None);
                }
            }
        }
    }

    fn handle(&mut self, command: Command) -> Result<Option<ChildLaunch>> {
        match command {
            Command::Start { id, spec } => return self.start(id, spec),
            Command::Stop { id, timeout } => self.stop(id, timeout),
            Command::Set { id, key, value } => {
                let Some(child) = self.children.iter().find(|c| c.id == id) else {
                    debug!("[{id}] set for a process that is not running");
                    return Ok(None);
                };
                let pid = child.pid.as_raw() as u32;
                let value = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                let result = match key {
                    ControlKey::Priority => platform::set_priority(
                        pid,
                        value.clamp(crate::info::MIN_PRIORITY, crate::info::MAX_PRIORITY),
                    ),
                    ControlKey::OomAdjustment => platform::set_oom_adjustment(
                        pid,
                        value.clamp(
                            crate::info::MIN_OOM_ADJUSTMENT,
                            crate::info::MAX_OOM_ADJUSTMENT,
                        ),
                    ),
                };
                if let Err(e) = result {
                    warn!("[{}] failed to set {key:?}: {e}", child.label);
                }
            }
            Command::Write { id, data } => self.write(id, &data),
            Command::Memory { restricted } => {
                debug!("[forklauncher] memory restriction {restricted} has nothing to shed");
            }
            Command::IdleCpuAvailable => {}
            Command::Halt => {
                info!("[forklauncher] halt requested");
                self.halt();
            }
        }
        Ok(None)
    }

    fn fail_start(&mut self, id: u32, message: String) {
        warn!("[{id}] failed to start: {message}");
        self.send_backend(
            id,
            BackendEvent::Error {
                error: ProcessError::FailedToStart,
                message,
            },
        );
        self.send_backend(id, BackendEvent::StateChanged(ProcessState::NotRunning));
    }

    fn start(&mut self, id: u32, spec: ProcessInfo) -> Result<Option<ChildLaunch>> {
        if self.halting {
            debug!("[{id}] start while halting, ignored");
            return Ok(None);
        }
        if self.children.iter().any(|c| c.id == id) {
            error!("[{id}] start for an id that is already running, ignored");
            return Ok(None);
        }
        self.send_backend(id, BackendEvent::StateChanged(ProcessState::Starting));

        let identity = match ChildIdentity::resolve(&spec) {
            Ok(identity) => identity,
            Err(e) => {
                self.fail_start(id, e.to_string());
                return Ok(None);
            }
        };
        let environment = spec.environment().map(|declared| EnvironmentDiff::from_current(&declared));

        let (stdin_read, stdin_write) = pipe()?;
        let (stdout_read, stdout_write) = pipe()?;
        let (stderr_read, stderr_write) = pipe()?;

        // SAFETY: the launcher is single-threaded.
        match unsafe { fork() }? {
            ForkResult::Child => {
                signal_hook::low_level::unregister(self.sigchld);
                // SAFETY: plain descriptor syscalls on descriptors this
                // process owns.
                unsafe {
                    if libc::dup2(stdin_read.as_raw_fd(), libc::STDIN_FILENO) < 0
                        || libc::dup2(stdout_write.as_raw_fd(), libc::STDOUT_FILENO) < 0
                        || libc::dup2(stderr_write.as_raw_fd(), libc::STDERR_FILENO) < 0
                    {
                        libc::_exit(127);
                    }
                }
                drop((
                    stdin_read,
                    stdin_write,
                    stdout_read,
                    stdout_write,
                    stderr_read,
                    stderr_write,
                ));
                become_identity(&spec, &identity, environment.as_ref());
                Ok(Some(ChildLaunch { id, info: spec }))
            }
            ForkResult::Parent { child } => {
                drop((stdin_read, stdout_write, stderr_write));
                set_nonblocking(stdin_write.as_raw_fd())?;
                set_nonblocking(stdout_read.as_raw_fd())?;
                set_nonblocking(stderr_read.as_raw_fd())?;

                let label = spec.identifier().map_or_else(|| id.to_string(), str::to_string);
                info!("[{label}] forked (pid={child})");
                self.send_backend(
                    id,
                    BackendEvent::Started {
                        pid: child.as_raw() as u32,
                    },
                );
                self.send_backend(id, BackendEvent::StateChanged(ProcessState::Running));
                self.children.push(Child {
                    id,
                    pid: child,
                    label,
                    stdin: Some(File::from(stdin_write)),
                    pending: Vec::new(),
                    stdout: Some(File::from(stdout_read)),
                    stderr: Some(File::from(stderr_read)),
                    stopping: false,
                    kill_at: None,
                    exit: None,
                });
                Ok(None)
            }
        }
    }

    fn stop(&mut self, id: u32, timeout_ms: i64) {
        let Some(child) = self.children.iter_mut().find(|c| c.id == id) else {
            debug!("[{id}] stop for a process that is not running");
            return;
        };
        if child.exit.is_some() {
            return;
        }
        child.stopping = true;
        if timeout_ms <= 0 {
            debug!("[{}] killing (pid={})", child.label, child.pid);
            let _ = kill(child.pid, Signal::SIGKILL);
            child.kill_at = None;
            return;
        }
        debug!(
            "[{}] sending SIGTERM (pid={}), kill in {timeout_ms}ms",
            child.label, child.pid
        );
        if let Err(e) = kill(child.pid, Signal::SIGTERM) {
            warn!("[{}] failed to send SIGTERM: {e}", child.label);
        }
        child.kill_at = Some(Instant::now() + Duration::from_millis(timeout_ms as u64));
    }

    fn write(&mut self, id: u32, data: &str) {
        let Some(child) = self.children.iter_mut().find(|c| c.id == id) else {
            debug!("[{id}] write for a process that is not running");
            return;
        };
        let bytes = match decode_data(data) {
            Ok(bytes) if child.stdin.is_some() => bytes,
            Ok(_) => {
                warn!("[{}] write to a closed input", child.label);
                self.send_backend(id, BackendEvent::error(ProcessError::WriteError));
                return;
            }
            Err(e) => {
                warn!("[{}] dropping write: {e}", child.label);
                self.send_backend(id, BackendEvent::error(ProcessError::WriteError));
                return;
            }
        };
        child.pending.extend_from_slice(&bytes);
        self.flush_input(id);
    }

    /// Push pending input into the child's pipe until it would block.
    fn flush_input(&mut self, id: u32) {
        let Some(child) = self.children.iter_mut().find(|c| c.id == id) else {
            return;
        };
        let Some(ref mut stdin) = child.stdin else {
            child.pending.clear();
            return;
        };
        while !child.pending.is_empty() {
            match stdin.write(&child.pending) {
                Ok(n) => {
                    child.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(
                        "[{}] write failed, dropping {} bytes: {e}",
                        child.label,
                        child.pending.len()
                    );
                    child.stdin = None;
                    child.pending.clear();
                    self.send_backend(id, BackendEvent::error(ProcessError::WriteError));
                    return;
                }
            }
        }
    }

    fn halt(&mut self) {
        if self.halting {
            return;
        }
        self.halting = true;
        for child in &mut self.children {
            if child.exit.is_none() {
                child.stopping = true;
                let _ = kill(child.pid, Signal::SIGKILL);
            }
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        for child in &mut self.children {
            if child.kill_at.is_some_and(|at| at <= now) {
                info!(
                    "[{}] did not stop in time, sending SIGKILL (pid={})",
                    child.label, child.pid
                );
                child.kill_at = None;
                let _ = kill(child.pid, Signal::SIGKILL);
            }
        }
    }

    /// Forward whatever is readable on one of a child's output pipes.
    fn relay(&mut self, id: u32, stderr: bool) {
        let Some(child) = self.children.iter_mut().find(|c| c.id == id) else {
            return;
        };
        let pipe = if stderr {
            &mut child.stderr
        } else {
            &mut child.stdout
        };
        let Some(file) = pipe.as_mut() else {
            return;
        };
        let mut chunk = vec![0; READ_CHUNK];
        let data = match file.read(&mut chunk) {
            Ok(0) => {
                *pipe = None;
                return;
            }
            Ok(n) => chunk[..n].to_vec(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                warn!("[{}] read failed: {e}", child.label);
                *pipe = None;
                return;
            }
        };
        let event = if stderr {
            BackendEvent::StandardError(data)
        } else {
            BackendEvent::StandardOutput(data)
        };
        self.send_backend(id, event);
    }

    fn reap(&mut self) -> Result<()> {
        let mut byte = [0u8; 64];
        while let Ok(n) = (&self.signals).read(&mut byte) {
            if n == 0 {
                break;
            }
        }
        loop {
            let (pid, exit) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => (pid, ChildExit::Code(code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) => (pid, ChildExit::Signal(signal as i32)),
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(()),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };
            match self.children.iter_mut().find(|c| c.pid == pid) {
                Some(child) => {
                    debug!("[{}] exited: {exit:?}", child.label);
                    child.exit = Some(exit);
                    child.kill_at = None;
                }
                None => debug!("[forklauncher] reaped unknown pid {pid}"),
            }
        }
    }

    /// Drain and report children that have exited.
    fn finish_exited(&mut self) {
        let (exited, running): (Vec<Child>, Vec<Child>) = std::mem::take(&mut self.children)
            .into_iter()
            .partition(|c| c.exit.is_some());
        self.children = running;
        for mut child in exited {
            for (pipe, stderr) in [(child.stdout.take(), false), (child.stderr.take(), true)] {
                if let Some(file) = pipe {
                    for data in drain(file) {
                        let event = if stderr {
                            BackendEvent::StandardError(data)
                        } else {
                            BackendEvent::StandardOutput(data)
                        };
                        self.send_backend(child.id, event);
                    }
                }
            }
            if let Some(exit) = child.exit {
                info!("[{}] finished: {exit:?}", child.label);
                for event in finish_events(exit, child.stopping) {
                    self.send_backend(child.id, event);
                }
            }
        }
    }
}

/// Remaining buffered output of an exited child.
fn drain(mut file: File) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut chunk = vec![0; READ_CHUNK];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => chunks.push(chunk[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    chunks
}

/// Take on the requested identity in a freshly forked child. Credential
/// failures end the child, the rest is best effort.
fn become_identity(
    spec: &ProcessInfo,
    identity: &ChildIdentity,
    environment: Option<&EnvironmentDiff>,
) {
    let label = spec.label();
    if let Err(e) = identity.apply() {
        error!("[{label}] failed to apply credentials: {e}");
        // SAFETY: leave without running the launcher's exit handlers.
        unsafe { libc::_exit(127) };
    }
    let pid = std::process::id();
    if let Some(priority) = spec.priority()
        && let Err(e) = platform::set_priority(pid, priority)
    {
        warn!("[{label}] failed to set priority {priority}: {e}");
    }
    if let Some(adjustment) = spec.oom_adjustment()
        && let Err(e) = platform::set_oom_adjustment(pid, adjustment)
    {
        warn!("[{label}] failed to set OOM adjustment {adjustment}: {e}");
    }
    if let Some(dir) = spec.working_directory()
        && let Err(e) = std::env::set_current_dir(dir)
    {
        warn!("[{label}] failed to change directory to {dir}: {e}");
    }
    if let Some(diff) = environment {
        // SAFETY: a forked child has a single thread.
        unsafe { diff.apply() };
    }
}
