// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::RewriteDelegate;
use crate::info::ProcessInfo;

pub const DEFAULT_DEBUGGER: &str = "gdb";

/// Runs the original program under a debugger:
/// `program args...` becomes `gdb -- program args...`.
#[derive(Debug, Clone)]
pub struct GdbRewriteDelegate {
    debugger: String,
}

impl GdbRewriteDelegate {
    pub fn new(debugger: &str) -> Self {
        Self {
            debugger: debugger.to_string(),
        }
    }
}

impl Default for GdbRewriteDelegate {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUGGER)
    }
}

impl RewriteDelegate for GdbRewriteDelegate {
    fn rewrite(&self, info: &mut ProcessInfo) {
        let mut arguments = vec!["--".to_string()];
        if let Some(program) = info.program() {
            arguments.push(program.to_string());
        }
        arguments.extend(info.arguments());
        info.set_program(&self.debugger);
        info.set_arguments(arguments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_program_and_arguments() {
        let mut info = ProcessInfo::with_program("/usr/bin/app", &["--port", "80"]);
        GdbRewriteDelegate::default().rewrite(&mut info);
        assert_eq!(info.program(), Some("gdb"));
        assert_eq!(info.arguments(), vec!["--", "/usr/bin/app", "--port", "80"]);
    }

    #[test]
    fn test_custom_debugger() {
        let mut info = ProcessInfo::with_program("/usr/bin/app", &[]);
        GdbRewriteDelegate::new("/opt/gdb/bin/gdb").rewrite(&mut info);
        assert_eq!(info.program(), Some("/opt/gdb/bin/gdb"));
        assert_eq!(info.arguments(), vec!["--", "/usr/bin/app"]);
    }
}
