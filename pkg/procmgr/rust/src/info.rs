// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process specification: a key/value description of a process to run.
//!
//! Well-known keys have typed accessors; any other key is carried through
//! untouched so that match delegates and remote launchers can use it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod keys {
    pub const IDENTIFIER: &str = "identifier";
    pub const PROGRAM: &str = "program";
    pub const ARGUMENTS: &str = "arguments";
    pub const ENVIRONMENT: &str = "environment";
    pub const WORKING_DIRECTORY: &str = "workingDirectory";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const UMASK: &str = "umask";
    pub const DROP_CAPABILITIES: &str = "dropCapabilities";
    pub const PRIORITY: &str = "priority";
    pub const OOM_ADJUSTMENT: &str = "oomAdjustment";
    pub const START_OUTPUT_PATTERN: &str = "startOutputPattern";
    pub const PROCESS_GROUP: &str = "processGroup";
}

pub const MIN_PRIORITY: i32 = -20;
pub const MAX_PRIORITY: i32 = 19;
pub const MIN_OOM_ADJUSTMENT: i32 = -1000;
pub const MAX_OOM_ADJUSTMENT: i32 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessInfo {
    values: BTreeMap<String, Value>,
}

impl ProcessInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a specification with only a program and its arguments.
    pub fn with_program(program: &str, arguments: &[&str]) -> Self {
        let mut info = Self::new();
        info.set_program(program);
        info.set_arguments(arguments.iter().map(|s| s.to_string()).collect());
        info
    }

    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Set `key` to `value`. Returns true if the stored value changed.
    pub fn set_value(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        if self.values.get(key) == Some(&value) {
            return false;
        }
        self.values.insert(key.to_string(), value);
        true
    }

    pub fn remove_value(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys whose value differs between `self` and `other`, including keys
    /// present on only one side.
    pub fn changed_keys(&self, other: &ProcessInfo) -> Vec<String> {
        let mut changed: Vec<String> = self
            .values
            .iter()
            .filter(|(k, v)| other.values.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(
            other
                .values
                .keys()
                .filter(|k| !self.values.contains_key(*k))
                .cloned(),
        );
        changed.sort();
        changed
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    fn integer(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    fn id_value(&self, key: &str) -> Option<u32> {
        // Negative values are the "unset, inherit" sentinel.
        self.integer(key).and_then(|v| u32::try_from(v).ok())
    }

    pub fn identifier(&self) -> Option<&str> {
        self.string(keys::IDENTIFIER)
    }

    pub fn set_identifier(&mut self, identifier: &str) -> bool {
        self.set_value(keys::IDENTIFIER, identifier)
    }

    pub fn program(&self) -> Option<&str> {
        self.string(keys::PROGRAM)
    }

    pub fn set_program(&mut self, program: &str) -> bool {
        self.set_value(keys::PROGRAM, program)
    }

    pub fn arguments(&self) -> Vec<String> {
        match self.values.get(keys::ARGUMENTS) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_arguments(&mut self, arguments: Vec<String>) -> bool {
        self.set_value(keys::ARGUMENTS, arguments)
    }

    /// The declared environment, if any. `None` means inherit everything.
    pub fn environment(&self) -> Option<BTreeMap<String, String>> {
        match self.values.get(keys::ENVIRONMENT) {
            Some(Value::Object(map)) => Some(
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn set_environment(&mut self, environment: BTreeMap<String, String>) -> bool {
        let map: serde_json::Map<String, Value> = environment
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        self.set_value(keys::ENVIRONMENT, Value::Object(map))
    }

    pub fn insert_environment(&mut self, key: &str, value: &str) -> bool {
        let mut env = self.environment().unwrap_or_default();
        env.insert(key.to_string(), value.to_string());
        self.set_environment(env)
    }

    /// Resolve the environment a child should see given the current one.
    /// A declared environment replaces `current` entirely.
    pub fn resolved_environment(
        &self,
        current: impl IntoIterator<Item = (String, String)>,
    ) -> BTreeMap<String, String> {
        match self.environment() {
            Some(declared) => declared,
            None => current.into_iter().collect(),
        }
    }

    pub fn working_directory(&self) -> Option<&str> {
        self.string(keys::WORKING_DIRECTORY)
    }

    pub fn set_working_directory(&mut self, dir: &str) -> bool {
        self.set_value(keys::WORKING_DIRECTORY, dir)
    }

    pub fn uid(&self) -> Option<u32> {
        self.id_value(keys::UID)
    }

    pub fn set_uid(&mut self, uid: u32) -> bool {
        self.set_value(keys::UID, uid)
    }

    pub fn gid(&self) -> Option<u32> {
        self.id_value(keys::GID)
    }

    pub fn set_gid(&mut self, gid: u32) -> bool {
        self.set_value(keys::GID, gid)
    }

    pub fn umask(&self) -> Option<u32> {
        self.id_value(keys::UMASK)
    }

    pub fn set_umask(&mut self, umask: u32) -> bool {
        self.set_value(keys::UMASK, umask)
    }

    pub fn drop_capabilities(&self) -> Vec<String> {
        match self.values.get(keys::DROP_CAPABILITIES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_drop_capabilities(&mut self, caps: Vec<String>) -> bool {
        self.set_value(keys::DROP_CAPABILITIES, caps)
    }

    pub fn priority(&self) -> Option<i32> {
        self.integer(keys::PRIORITY)
            .map(|v| v.clamp(MIN_PRIORITY.into(), MAX_PRIORITY.into()) as i32)
    }

    pub fn set_priority(&mut self, priority: i32) -> bool {
        self.set_value(keys::PRIORITY, priority.clamp(MIN_PRIORITY, MAX_PRIORITY))
    }

    pub fn oom_adjustment(&self) -> Option<i32> {
        self.integer(keys::OOM_ADJUSTMENT)
            .map(|v| v.clamp(MIN_OOM_ADJUSTMENT.into(), MAX_OOM_ADJUSTMENT.into()) as i32)
    }

    pub fn set_oom_adjustment(&mut self, adjustment: i32) -> bool {
        self.set_value(
            keys::OOM_ADJUSTMENT,
            adjustment.clamp(MIN_OOM_ADJUSTMENT, MAX_OOM_ADJUSTMENT),
        )
    }

    pub fn start_output_pattern(&self) -> Option<&[u8]> {
        self.string(keys::START_OUTPUT_PATTERN)
            .filter(|p| !p.is_empty())
            .map(str::as_bytes)
    }

    pub fn set_start_output_pattern(&mut self, pattern: &str) -> bool {
        self.set_value(keys::START_OUTPUT_PATTERN, pattern)
    }

    pub fn process_group(&self) -> bool {
        self.values
            .get(keys::PROCESS_GROUP)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_process_group(&mut self, isolate: bool) -> bool {
        self.set_value(keys::PROCESS_GROUP, isolate)
    }

    /// Label used in log lines: the identifier, else the program.
    pub fn label(&self) -> &str {
        self.identifier()
            .or_else(|| self.program())
            .unwrap_or("unnamed")
    }
}

impl From<BTreeMap<String, Value>> for ProcessInfo {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self::from_map(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_then_get_returns_value() {
        let mut info = ProcessInfo::new();
        assert!(info.set_value("custom", json!({"nested": [1, 2, 3]})));
        assert_eq!(info.value("custom"), Some(&json!({"nested": [1, 2, 3]})));

        assert!(info.set_program("/bin/true"));
        assert_eq!(info.program(), Some("/bin/true"));
    }

    #[test]
    fn test_set_same_value_reports_unchanged() {
        let mut info = ProcessInfo::new();
        assert!(info.set_identifier("a"));
        assert!(!info.set_identifier("a"));
        assert!(info.set_identifier("b"));
    }

    #[test]
    fn test_changed_keys_is_per_key() {
        let mut a = ProcessInfo::with_program("/bin/sh", &["-c", "true"]);
        let mut b = a.clone();
        assert!(a.changed_keys(&b).is_empty());

        b.set_priority(5);
        a.set_identifier("x");
        assert_eq!(a.changed_keys(&b), vec!["identifier", "priority"]);
    }

    #[test]
    fn test_unset_uid_sentinel() {
        let mut info = ProcessInfo::new();
        assert_eq!(info.uid(), None);
        info.set_value(keys::UID, -1);
        assert_eq!(info.uid(), None);
        info.set_uid(1000);
        assert_eq!(info.uid(), Some(1000));
    }

    #[test]
    fn test_priority_and_oom_are_clamped() {
        let mut info = ProcessInfo::new();
        info.set_priority(42);
        assert_eq!(info.priority(), Some(19));
        info.set_value(keys::PRIORITY, -100);
        assert_eq!(info.priority(), Some(-20));
        info.set_oom_adjustment(5000);
        assert_eq!(info.oom_adjustment(), Some(1000));
    }

    #[test]
    fn test_environment_inherits_unless_declared() {
        let current = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];

        let info = ProcessInfo::new();
        let env = info.resolved_environment(current.clone());
        assert_eq!(env.len(), 2);

        let mut info = ProcessInfo::new();
        info.insert_environment("FOO", "bar");
        let env = info.resolved_environment(current);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_label_prefers_identifier() {
        let mut info = ProcessInfo::with_program("/bin/cat", &[]);
        assert_eq!(info.label(), "/bin/cat");
        info.set_identifier("reader");
        assert_eq!(info.label(), "reader");
        assert_eq!(ProcessInfo::new().label(), "unnamed");
    }
}
