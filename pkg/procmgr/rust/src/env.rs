// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Parse a systemd-style environment file into key-value pairs.
/// Supports `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, comments (#), and blank lines.
pub fn parse_environment_file(path: &str) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading environment file: {path}"))?;
    let mut vars = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, raw_val)) = trimmed.split_once('=') {
            let val = raw_val
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            vars.push((key.trim().to_string(), val));
        }
    }
    Ok(vars)
}

/// Changes that turn one process environment into a declared one.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnvironmentDiff {
    pub set: Vec<(String, String)>,
    pub unset: Vec<String>,
}

impl EnvironmentDiff {
    /// Declared keys whose value differs are set; current keys the
    /// declaration does not mention are removed.
    pub fn between<I>(current: I, declared: &BTreeMap<String, String>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let current: BTreeMap<String, String> = current.into_iter().collect();
        let set = declared
            .iter()
            .filter(|(key, value)| current.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let declared_keys: BTreeSet<&String> = declared.keys().collect();
        let unset = current
            .into_keys()
            .filter(|key| !declared_keys.contains(key))
            .collect();
        Self { set, unset }
    }

    /// Diff against this process's own environment.
    pub fn from_current(declared: &BTreeMap<String, String>) -> Self {
        let current = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        Self::between(current, declared)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply to this process's environment.
    ///
    /// # Safety
    ///
    /// No other thread may read or write the environment concurrently, which
    /// holds in a freshly forked child.
    pub unsafe fn apply(&self) {
        for key in &self.unset {
            // SAFETY: the caller guarantees the process is single-threaded.
            unsafe { std::env::remove_var(key) };
        }
        for (key, value) in &self.set {
            // SAFETY: as above.
            unsafe { std::env::set_var(key, value) };
        }
    }
}
