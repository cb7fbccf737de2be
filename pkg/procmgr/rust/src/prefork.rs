// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Prefork group: start helper programs up front from one argument vector.
//!
//! ```text
//! dd-procmgr-prefork [controller args] -- primary args -- helper args [-- helper args]...
//! ```
//!
//! Every helper is forked first, wired to a pipe pair on its stdin/stdout and
//! killed if its parent dies. The original process then becomes the primary
//! program. Losing any helper is fatal to the whole group.
//!
//! A program ending in `.so` is loaded in place and its `main` called; any
//! other program replaces the process image with `execvp`. Because exec drops
//! in-process state, the helper table travels to the primary in
//! `DD_PREFORK_HELPERS` and is rebuilt with [`Prefork::from_env`].

use crate::errors::{Error, Result};
use log::{error, info};
use nix::unistd::{ForkResult, execvp, fork, pipe};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

pub const HELPERS_ENV: &str = "DD_PREFORK_HELPERS";

const SEPARATOR: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreforkLayout {
    pub controller: Vec<String>,
    pub primary: Vec<String>,
    pub helpers: Vec<Vec<String>>,
}

/// Split an argument vector on literal `--` separators. The primary segment
/// and at least one helper segment are required, none of them empty.
pub fn split_args(args: &[String]) -> Result<PreforkLayout> {
    let mut segments = args.split(|arg| arg == SEPARATOR);
    let controller = segments.next().unwrap_or_default().to_vec();
    let programs: Vec<Vec<String>> = segments.map(<[String]>::to_vec).collect();

    let Some((primary, helpers)) = programs.split_first() else {
        return Err(Error::PreforkLayout {
            context: "missing '--' before the primary program".to_string(),
        });
    };
    if helpers.is_empty() {
        return Err(Error::PreforkLayout {
            context: "at least one helper segment is required".to_string(),
        });
    }
    if let Some(position) = programs.iter().position(Vec::is_empty) {
        return Err(Error::PreforkLayout {
            context: format!("segment {} is empty", position + 1),
        });
    }
    Ok(PreforkLayout {
        controller,
        primary: primary.clone(),
        helpers: helpers.to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreforkHelper {
    /// Write end of the helper's standard input.
    pub input: RawFd,
    /// Read end of the helper's standard output.
    pub output: RawFd,
    pub pid: u32,
}

/// Helpers started by the group, in segment order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefork {
    helpers: Vec<PreforkHelper>,
}

impl Prefork {
    pub fn new(helpers: Vec<PreforkHelper>) -> Self {
        Self { helpers }
    }

    pub fn helpers(&self) -> &[PreforkHelper] {
        &self.helpers
    }

    pub fn helper(&self, index: usize) -> Option<&PreforkHelper> {
        self.helpers.get(index)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.helpers.iter().map(|h| h.pid).collect()
    }

    /// `in,out,pid` per helper, separated by `;`.
    pub fn encode(&self) -> String {
        self.helpers
            .iter()
            .map(|h| format!("{},{},{}", h.input, h.output, h.pid))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |context: String| Error::InvalidValue {
            key: HELPERS_ENV.to_string(),
            context,
        };
        let helpers = value
            .split(';')
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let fields: Vec<&str> = entry.split(',').collect();
                let [input, output, pid] = fields.as_slice() else {
                    return Err(invalid(format!("expected in,out,pid, got '{entry}'")));
                };
                Ok(PreforkHelper {
                    input: input.parse().map_err(|e| invalid(format!("{entry}: {e}")))?,
                    output: output.parse().map_err(|e| invalid(format!("{entry}: {e}")))?,
                    pid: pid.parse().map_err(|e| invalid(format!("{entry}: {e}")))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { helpers })
    }

    /// The group this process is the primary of, if any.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(HELPERS_ENV) {
            Ok(value) => Self::parse(&value).map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(Error::InvalidValue {
                key: HELPERS_ENV.to_string(),
                context: e.to_string(),
            }),
        }
    }
}

/// Exit the whole process as soon as any helper dies.
pub fn watch_helpers(prefork: &Prefork) -> Result<()> {
    let pids: Vec<libc::pid_t> = prefork
        .pids()
        .into_iter()
        .map(|pid| pid as libc::pid_t)
        .collect();
    let handler_pids = pids.clone();
    // SAFETY: the handler only calls waitpid and _exit, both async-signal
    // safe, and reads a Vec that is never mutated after registration.
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGCHLD, move || {
            if reap_any(&handler_pids) {
                libc::_exit(1);
            }
        })?;
    }
    // A helper may have died before the handler existed.
    if reap_any(&pids) {
        error!("[prefork] a helper exited before the group was watched");
        std::process::exit(1);
    }
    Ok(())
}

fn reap_any(pids: &[libc::pid_t]) -> bool {
    pids.iter().any(|&pid| {
        let mut status = 0;
        // SAFETY: waitpid on a pid with a valid status pointer.
        unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) == pid }
    })
}

/// Fork every helper, then become the primary program. Only returns on
/// failure. Must run before any thread is started.
pub fn launch(layout: &PreforkLayout) -> Result<Infallible> {
    let mut helpers: Vec<PreforkHelper> = Vec::with_capacity(layout.helpers.len());
    for segment in &layout.helpers {
        let helper = spawn_helper(segment, &helpers)?;
        info!(
            "[prefork] helper {} started (pid={})",
            segment.join(" "),
            helper.pid
        );
        helpers.push(helper);
    }

    let prefork = Prefork::new(helpers);
    // SAFETY: single-threaded, nothing else touches the environment.
    unsafe { std::env::set_var(HELPERS_ENV, prefork.encode()) };
    watch_helpers(&prefork)?;
    info!("[prefork] becoming {}", layout.primary.join(" "));
    become_program(&layout.primary)
}

fn spawn_helper(segment: &[String], siblings: &[PreforkHelper]) -> Result<PreforkHelper> {
    let (stdin_read, stdin_write) = pipe()?;
    let (stdout_read, stdout_write) = pipe()?;

    // SAFETY: the process is single-threaded while the group is set up.
    match unsafe { fork() }? {
        ForkResult::Child => {
            #[cfg(target_os = "linux")]
            let _ = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL);
            // SAFETY: plain descriptor syscalls on descriptors this process
            // owns.
            unsafe {
                for sibling in siblings {
                    libc::close(sibling.input);
                    libc::close(sibling.output);
                }
                if libc::dup2(stdin_read.as_raw_fd(), libc::STDIN_FILENO) < 0
                    || libc::dup2(stdout_write.as_raw_fd(), libc::STDOUT_FILENO) < 0
                {
                    libc::_exit(127);
                }
            }
            drop((stdin_read, stdin_write, stdout_read, stdout_write));
            let Err(e) = become_program(segment);
            error!("[prefork] helper {} failed: {e}", segment.join(" "));
            // SAFETY: leave without running the parent's exit handlers.
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => Ok(PreforkHelper {
            input: stdin_write.into_raw_fd(),
            output: stdout_read.into_raw_fd(),
            pid: child.as_raw() as u32,
        }),
    }
}

fn to_cstrings(segment: &[String]) -> Result<Vec<CString>> {
    segment
        .iter()
        .map(|arg| {
            CString::new(arg.as_str()).map_err(|e| Error::InvalidValue {
                key: "arguments".to_string(),
                context: e.to_string(),
            })
        })
        .collect()
}

/// Turn this process into the program `segment` names.
pub fn become_program(segment: &[String]) -> Result<Infallible> {
    let Some(program) = segment.first() else {
        return Err(Error::PreforkLayout {
            context: "empty program segment".to_string(),
        });
    };
    let argv = to_cstrings(segment)?;
    if program.ends_with(".so") {
        return run_library(program, &argv);
    }
    let Some(file) = argv.first() else {
        return Err(Error::PreforkLayout {
            context: "empty program segment".to_string(),
        });
    };
    let Err(e) = execvp(file, &argv);
    Err(e.into())
}

type EntryPoint = unsafe extern "C" fn(libc::c_int, *const *const libc::c_char) -> libc::c_int;

fn run_library(path: &str, argv: &[CString]) -> Result<Infallible> {
    let load_error = |e: libloading::Error| Error::DynamicLoad {
        path: path.to_string(),
        context: e.to_string(),
    };
    let mut pointers: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    pointers.push(std::ptr::null());

    // SAFETY: loading runs the library's initialisers, which is what
    // starting that program would do anyway.
    let library = unsafe { libloading::Library::new(path) }.map_err(load_error)?;
    // SAFETY: the entry point has the C `main` signature.
    let entry = unsafe { library.get::<EntryPoint>(b"main\0") }.map_err(load_error)?;
    // SAFETY: `pointers` is NULL-terminated and outlives the call.
    let rc = unsafe { entry(argv.len() as libc::c_int, pointers.as_ptr()) };
    std::process::exit(rc)
}
