// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::MatchDelegate;
use crate::info::{ProcessInfo, keys};

/// Matches when every key set on the template has the same value in the
/// candidate. The environment is compared variable by variable, so the
/// candidate may declare more variables than the template.
#[derive(Debug, Clone)]
pub struct InfoMatchDelegate {
    template: ProcessInfo,
}

impl InfoMatchDelegate {
    pub fn new(template: ProcessInfo) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &ProcessInfo {
        &self.template
    }
}

impl MatchDelegate for InfoMatchDelegate {
    fn matches(&self, info: &ProcessInfo) -> bool {
        self.template.keys().all(|key| {
            if key == keys::ENVIRONMENT {
                let wanted = self.template.environment().unwrap_or_default();
                let actual = info.environment().unwrap_or_default();
                wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
            } else {
                self.template.value(key) == info.value(key)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_template_matches_everything() {
        let delegate = InfoMatchDelegate::new(ProcessInfo::new());
        assert!(delegate.matches(&ProcessInfo::with_program("/bin/ls", &["-l"])));
    }

    #[test]
    fn test_every_template_key_must_match() {
        let mut template = ProcessInfo::new();
        template.set_program("/usr/bin/python3");
        template.set_uid(1000);
        let delegate = InfoMatchDelegate::new(template);

        let mut info = ProcessInfo::with_program("/usr/bin/python3", &["app.py"]);
        assert!(!delegate.matches(&info), "uid missing");
        info.set_uid(1000);
        assert!(delegate.matches(&info));
        info.set_program("/usr/bin/python2");
        assert!(!delegate.matches(&info));
    }

    #[test]
    fn test_environment_compared_per_variable() {
        let mut template = ProcessInfo::new();
        template.insert_environment("LANG", "C");
        let delegate = InfoMatchDelegate::new(template);

        let mut info = ProcessInfo::new();
        info.insert_environment("LANG", "C");
        info.insert_environment("HOME", "/root");
        assert!(delegate.matches(&info));

        info.insert_environment("LANG", "en_US.UTF-8");
        assert!(!delegate.matches(&info));
    }
}
