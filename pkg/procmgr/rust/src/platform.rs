// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! OS helpers shared by the local backend and the forking launcher.

use crate::errors::{Error, Result};
use crate::info::ProcessInfo;
use log::debug;
use std::io;

/// Set the niceness of `pid`.
pub fn set_priority(pid: u32, priority: i32) -> io::Result<()> {
    // SAFETY: plain syscall wrapper, no pointers involved.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, priority) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Current niceness of `pid`, read from `/proc/<pid>/stat`.
pub fn priority(pid: u32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_nice(&stat)
}

fn parse_stat_nice(stat: &str) -> Option<i32> {
    // The command name may contain spaces, fields restart after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    // After the command: state(3) ... nice is field 19, i.e. index 16 here.
    rest.split_whitespace().nth(16)?.parse().ok()
}

pub fn set_oom_adjustment(pid: u32, adjustment: i32) -> io::Result<()> {
    std::fs::write(
        format!("/proc/{pid}/oom_score_adj"),
        format!("{adjustment}\n"),
    )
}

pub fn oom_adjustment(pid: u32) -> Option<i32> {
    std::fs::read_to_string(format!("/proc/{pid}/oom_score_adj"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Parse a capability name such as `CAP_NET_RAW` or `net_raw`.
#[cfg(target_os = "linux")]
pub fn parse_capability(name: &str) -> Result<caps::Capability> {
    let upper = name.trim().to_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };
    full.parse::<caps::Capability>()
        .map_err(|_| Error::UnknownCapability(name.to_string()))
}

/// Credentials and file-creation settings applied to a child before it runs
/// its program. Everything is resolved up front so that applying it after
/// fork only makes system calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildIdentity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// `Some(vec![])` clears the supplementary groups.
    pub groups: Option<Vec<libc::gid_t>>,
    pub umask: Option<u32>,
    #[cfg(target_os = "linux")]
    pub drop_capabilities: Vec<caps::Capability>,
}

impl ChildIdentity {
    pub fn resolve(info: &ProcessInfo) -> Result<Self> {
        let uid = info.uid();
        let gid = info.gid();

        // Supplementary groups only change together with the user.
        // SAFETY: geteuid never fails.
        let euid = unsafe { libc::geteuid() };
        let groups = match uid {
            Some(uid) if uid != euid => Some(
                supplementary_groups(uid)
                    .into_iter()
                    .map(|gid| gid as libc::gid_t)
                    .collect(),
            ),
            _ => None,
        };

        #[cfg(target_os = "linux")]
        let drop_capabilities = info
            .drop_capabilities()
            .iter()
            .map(|name| parse_capability(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            uid,
            gid,
            groups,
            umask: info.umask(),
            #[cfg(target_os = "linux")]
            drop_capabilities,
        })
    }

    pub fn is_empty(&self) -> bool {
        #[cfg(target_os = "linux")]
        if !self.drop_capabilities.is_empty() {
            return false;
        }
        self.uid.is_none() && self.gid.is_none() && self.groups.is_none() && self.umask.is_none()
    }

    /// Apply to the calling process. Runs in a freshly forked child, so it
    /// must not allocate: only system calls on values prepared by `resolve`.
    pub fn apply(&self) -> io::Result<()> {
        // Capabilities go first, dropping them needs CAP_SETPCAP.
        #[cfg(target_os = "linux")]
        for cap in &self.drop_capabilities {
            // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
            let dropped = unsafe {
                libc::prctl(
                    libc::PR_CAPBSET_DROP,
                    libc::c_ulong::from(cap.index()),
                    0,
                    0,
                    0,
                )
            };
            if dropped != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        // SAFETY: setgroups/setgid/setuid/umask take plain values or a
        // pointer into a live Vec.
        unsafe {
            if let Some(ref groups) = self.groups
                && libc::setgroups(groups.len() as _, groups.as_ptr()) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if let Some(gid) = self.gid
                && libc::setgid(gid as libc::gid_t) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if let Some(uid) = self.uid
                && libc::setuid(uid as libc::uid_t) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if let Some(mask) = self.umask {
                libc::umask(mask as libc::mode_t);
            }
        }
        Ok(())
    }
}

/// Groups of the account owning `uid`, empty when there is no such account.
pub fn supplementary_groups(uid: u32) -> Vec<u32> {
    let Some(user) = uzers::get_user_by_uid(uid) else {
        debug!("no account for uid {uid}, clearing supplementary groups");
        return Vec::new();
    };
    uzers::get_user_groups(user.name(), user.primary_group_id())
        .map(|groups| groups.iter().map(|g| g.gid()).collect())
        .unwrap_or_default()
}

#[allow(clippy::unwrap_used, clippy::undocumented_unsafe_blocks)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_nice_with_spaces_in_name() {
        let stat = "1234 (my proc (x)) S 1 1234 1234 0 -1 4194560 100 0 0 0 1 2 0 0 20 5 1 0 100 1000 10";
        assert_eq!(parse_stat_nice(stat), Some(5));
    }

    #[test]
    fn test_own_priority_is_readable() {
        assert!(priority(std::process::id()).is_some());
    }

    #[test]
    fn test_own_oom_adjustment_is_readable() {
        assert!(oom_adjustment(std::process::id()).is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_capability_names() {
        assert_eq!(
            parse_capability("CAP_NET_RAW").unwrap(),
            caps::Capability::CAP_NET_RAW
        );
        assert_eq!(
            parse_capability("sys_admin").unwrap(),
            caps::Capability::CAP_SYS_ADMIN
        );
        assert!(matches!(
            parse_capability("cap_flying"),
            Err(Error::UnknownCapability(_))
        ));
    }

    #[test]
    fn test_resolve_empty_identity() {
        let identity = ChildIdentity::resolve(&ProcessInfo::new()).unwrap();
        assert!(identity.is_empty());
    }

    #[test]
    fn test_resolve_same_uid_keeps_groups() {
        let mut info = ProcessInfo::new();
        // SAFETY: geteuid never fails.
        info.set_uid(unsafe { libc::geteuid() });
        info.set_umask(0o022);
        let identity = ChildIdentity::resolve(&info).unwrap();
        assert_eq!(identity.groups, None);
        assert_eq!(identity.umask, Some(0o022));
    }

    #[test]
    fn test_resolve_other_uid_prepares_groups() {
        // No account owns this uid, so the child drops every group.
        let mut info = ProcessInfo::new();
        info.set_uid(3_999_999);
        let identity = ChildIdentity::resolve(&info).unwrap();
        assert_eq!(identity.groups, Some(Vec::new()));
        assert!(!identity.is_empty());
    }

    #[test]
    fn test_apply_in_forked_child() {
        use std::os::unix::process::CommandExt;

        let mut info = ProcessInfo::new();
        info.set_umask(0o077);
        let identity = ChildIdentity::resolve(&info).unwrap();
        let mut command = std::process::Command::new("/bin/sh");
        command.args(["-c", "umask"]);
        // SAFETY: apply only makes system calls.
        unsafe {
            command.pre_exec(move || identity.apply());
        }
        let output = command.output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "0077");
    }
}
