// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use dd_procmgr::protocol::{Command, Event, FramedReader, write_message};
use dd_procmgr::{BackendEvent, ExitStatus, ProcessBackend, ProcessInfo, ProcessState};
use nix::sys::signal;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keeps spawned binaries away from any installed configuration.
pub const NO_CONFIG: &str = "/nonexistent/procmgr.yaml";

/// Reads lines until `stop`, echoing everything else, then exits 0.
pub const ECHO_CLIENT: &str =
    r#"while read -r line; do [ "$line" = stop ] && exit 0; echo "$line"; done"#;

pub fn sh(script: &str) -> ProcessInfo {
    ProcessInfo::with_program("/bin/sh", &["-c", script])
}

/// Events from `backend` up to and including the first one `done` accepts.
pub async fn events_until(
    backend: &mut dyn ProcessBackend,
    done: impl Fn(&BackendEvent) -> bool,
) -> Vec<BackendEvent> {
    let collect = async move {
        let mut events = Vec::new();
        while let Some(event) = backend.next_event().await {
            let last = done(&event);
            events.push(event);
            if last {
                break;
            }
        }
        events
    };
    timeout(DEFAULT_TIMEOUT, collect)
        .await
        .expect("timed out waiting for backend events")
}

pub async fn events_until_running(backend: &mut dyn ProcessBackend) -> Vec<BackendEvent> {
    events_until(backend, |e| {
        *e == BackendEvent::StateChanged(ProcessState::Running)
    })
    .await
}

pub async fn events_until_finished(backend: &mut dyn ProcessBackend) -> Vec<BackendEvent> {
    events_until(backend, BackendEvent::is_finished).await
}

pub fn states(events: &[BackendEvent]) -> Vec<ProcessState> {
    events
        .iter()
        .filter_map(|e| match e {
            BackendEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

pub fn stdout(events: &[BackendEvent]) -> String {
    let bytes: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            BackendEvent::StandardOutput(data) => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn finished(events: &[BackendEvent]) -> Option<(i32, ExitStatus)> {
    events.iter().find_map(|e| match e {
        BackendEvent::Finished {
            exit_code,
            exit_status,
        } => Some((*exit_code, *exit_status)),
        _ => None,
    })
}

/// A launcher binary driven over its stdin/stdout.
pub struct LauncherProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: FramedReader<ChildStdout>,
}

impl LauncherProcess {
    pub fn spawn(bin: &str, args: &[&str]) -> Self {
        let mut child = tokio::process::Command::new(bin)
            .args(args)
            .env("DD_PROCMGR_CONFIG", NO_CONFIG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .unwrap_or_else(|e| panic!("failed to start {bin}: {e}"));
        let stdin = child.stdin.take().expect("launcher stdin");
        let stdout = child.stdout.take().expect("launcher stdout");
        Self {
            child,
            stdin: Some(stdin),
            reader: FramedReader::new(stdout),
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id().expect("launcher already reaped")
    }

    pub async fn send(&mut self, command: &Command) {
        let stdin = self.stdin.as_mut().expect("launcher stdin closed");
        write_message(stdin, command).await.expect("send command");
    }

    /// Next event, `None` once the launcher closed its stdout.
    pub async fn recv(&mut self) -> Option<Event> {
        timeout(DEFAULT_TIMEOUT, self.reader.next::<Event>())
            .await
            .expect("timed out waiting for a launcher event")
            .expect("bad event stream")
    }

    /// Backend events until every id in `ids` has finished.
    pub async fn until_finished(&mut self, ids: &[u32]) -> Vec<Event> {
        let mut pending: HashSet<u32> = ids.iter().copied().collect();
        let mut events = Vec::new();
        while !pending.is_empty() {
            let event = self.recv().await.expect("launcher went away");
            let Some(id) = event.backend_id() else {
                continue;
            };
            assert!(
                ids.contains(&id),
                "event for unexpected id {id}: {event:?}"
            );
            assert!(
                pending.contains(&id),
                "event after finished for id {id}: {event:?}"
            );
            if matches!(event, Event::Finished { .. }) {
                pending.remove(&id);
            }
            events.push(event);
        }
        events
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub async fn wait(&mut self) -> std::process::ExitStatus {
        timeout(DEFAULT_TIMEOUT, self.child.wait())
            .await
            .expect("launcher did not exit")
            .expect("wait for launcher")
    }
}

/// Backend events the launcher reported for `id`, in order.
pub fn backend_events(events: &[Event], id: u32) -> Vec<BackendEvent> {
    events
        .iter()
        .filter(|e| e.backend_id() == Some(id))
        .flat_map(|e| e.clone().into_backend_events().expect("decode event"))
        .collect()
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
