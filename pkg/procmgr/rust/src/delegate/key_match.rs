// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::MatchDelegate;
use crate::info::ProcessInfo;
use serde_json::Value;

/// Matches specifications carrying `key`, optionally with exactly `value`.
#[derive(Debug, Clone)]
pub struct KeyMatchDelegate {
    key: String,
    value: Option<Value>,
}

impl KeyMatchDelegate {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
        }
    }

    pub fn with_value(key: &str, value: impl Into<Value>) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.into()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl MatchDelegate for KeyMatchDelegate {
    fn matches(&self, info: &ProcessInfo) -> bool {
        match (info.value(&self.key), &self.value) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
        }
    }
}
