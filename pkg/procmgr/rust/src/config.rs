// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::delegate::{DEFAULT_DEBUGGER, InfoMatchDelegate, KeyMatchDelegate, MatchDelegate};
use crate::factory::{
    DebuggerFactory, PrelaunchFactory, PrelaunchPacer, ProcessBackendFactory, RemoteFactory,
    StandardFactory,
};
use crate::idle::{
    DEFAULT_INTERVAL, DEFAULT_THRESHOLD, IdleDelegate, LoadIdleDelegate, TimerIdleDelegate,
};
use crate::info::ProcessInfo;
use crate::manager::BackendManager;
use crate::prefork::Prefork;
use anyhow::{Context, Result, bail};
use log::{LevelFilter, debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/procmgr.yaml";
pub const CONFIG_ENV: &str = "DD_PROCMGR_CONFIG";
pub const LOG_LEVEL_ENV: &str = "DD_LOG_LEVEL";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: Option<String>,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub factories: Vec<FactoryConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleKind {
    #[default]
    Timer,
    Cpu,
    Io,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdleConfig {
    #[serde(rename = "type", default)]
    pub kind: IdleKind,
    pub interval_ms: Option<u64>,
    pub threshold: Option<f64>,
    pub device: Option<String>,
}

/// Which specifications a factory accepts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MatchConfig {
    Template {
        template: ProcessInfo,
    },
    Key {
        key: String,
        #[serde(default)]
        value: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
pub struct FactoryConfig {
    #[serde(rename = "match", default)]
    pub matcher: Option<MatchConfig>,
    #[serde(flatten)]
    pub kind: FactoryKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FactoryKind {
    Standard,
    Debugger {
        debugger: Option<String>,
    },
    Prelaunch {
        template: ProcessInfo,
        #[serde(default)]
        samples_required: u32,
        max_wait_ms: Option<u64>,
    },
    Pipe {
        program: String,
        #[serde(default)]
        arguments: Vec<String>,
    },
    Socket {
        path: PathBuf,
    },
    Prefork {
        #[serde(default)]
        index: usize,
    },
}

impl Config {
    /// `--config`, then `DD_PROCMGR_CONFIG`, then the packaged default.
    pub fn path(explicit: Option<&Path>) -> PathBuf {
        explicit.map(Path::to_path_buf).unwrap_or_else(|| {
            std::env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
        })
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no configuration at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// `DD_LOG_LEVEL` wins over `log_level`; unknown names fall back to info.
    pub fn log_level(&self) -> LevelFilter {
        let configured = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .or_else(|| self.log_level.clone());
        match configured {
            Some(name) => name.parse().unwrap_or(LevelFilter::Info),
            None => LevelFilter::Info,
        }
    }
}

impl IdleConfig {
    pub fn build(&self) -> Result<Box<dyn IdleDelegate>> {
        let interval = self
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INTERVAL);
        let threshold = self.threshold.unwrap_or(DEFAULT_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            bail!("idle threshold {threshold} is outside 0..=1");
        }
        let delegate: Box<dyn IdleDelegate> = match self.kind {
            IdleKind::Timer => Box::new(TimerIdleDelegate::new(interval)),
            IdleKind::Cpu => Box::new(LoadIdleDelegate::cpu(interval, threshold)),
            IdleKind::Io => {
                let Some(ref device) = self.device else {
                    bail!("idle type 'io' needs a device");
                };
                Box::new(LoadIdleDelegate::io(interval, threshold, device))
            }
        };
        Ok(delegate)
    }
}

impl MatchConfig {
    pub fn build(&self) -> Box<dyn MatchDelegate> {
        match self {
            MatchConfig::Template { template } => {
                Box::new(InfoMatchDelegate::new(template.clone()))
            }
            MatchConfig::Key {
                key,
                value: Some(value),
            } => Box::new(KeyMatchDelegate::with_value(key, value.clone())),
            MatchConfig::Key { key, value: None } => Box::new(KeyMatchDelegate::new(key)),
        }
    }
}

impl Config {
    /// Quiet samples only come from a load-sampling idle delegate.
    fn check_pacing(&self) -> Result<()> {
        if self.idle.kind != IdleKind::Timer {
            return Ok(());
        }
        for (position, entry) in self.factories.iter().enumerate() {
            if let FactoryKind::Prelaunch {
                samples_required, ..
            } = entry.kind
                && samples_required > 0
            {
                bail!(
                    "factory #{position}: samples_required needs a cpu or io idle delegate, \
                     the timer never samples load"
                );
            }
        }
        Ok(())
    }
}

impl FactoryConfig {
    pub async fn build(&self, prefork: Option<&Prefork>) -> Result<Box<dyn ProcessBackendFactory>> {
        let mut factory: Box<dyn ProcessBackendFactory> = match self.kind {
            FactoryKind::Standard => Box::new(StandardFactory::new()),
            FactoryKind::Debugger { ref debugger } => Box::new(DebuggerFactory::new(
                debugger.as_deref().unwrap_or(DEFAULT_DEBUGGER),
            )),
            FactoryKind::Prelaunch {
                ref template,
                samples_required,
                max_wait_ms,
            } => {
                if template.program().is_none() {
                    bail!("prelaunch factory template has no program");
                }
                let pacer =
                    PrelaunchPacer::new(samples_required, max_wait_ms.map(Duration::from_millis));
                Box::new(PrelaunchFactory::new(template.clone(), pacer))
            }
            FactoryKind::Pipe {
                ref program,
                ref arguments,
            } => Box::new(
                RemoteFactory::pipe(program, arguments)
                    .with_context(|| format!("starting launcher {program}"))?,
            ),
            FactoryKind::Socket { ref path } => Box::new(
                RemoteFactory::socket(path)
                    .await
                    .with_context(|| format!("connecting to launcher at {}", path.display()))?,
            ),
            FactoryKind::Prefork { index } => {
                let Some(prefork) = prefork else {
                    bail!("prefork factory configured outside of a prefork group");
                };
                Box::new(
                    RemoteFactory::prefork(prefork, index)
                        .with_context(|| format!("connecting to prefork helper {index}"))?,
                )
            }
        };
        if let Some(ref matcher) = self.matcher {
            factory.delegates_mut().set_match(matcher.build());
        }
        Ok(factory)
    }
}

/// Manager with one factory per configured entry, in file order. Without
/// any entry a single standard factory is used.
pub async fn build_manager(config: &Config, prefork: Option<&Prefork>) -> Result<BackendManager> {
    config.check_pacing()?;
    let mut manager = BackendManager::new(config.idle.build()?);
    if config.factories.is_empty() {
        manager.add_factory(Box::new(StandardFactory::new()));
        return Ok(manager);
    }
    for (position, entry) in config.factories.iter().enumerate() {
        let factory = entry
            .build(prefork)
            .await
            .with_context(|| format!("factory #{position}"))?;
        info!("[config] factory #{position}: {}", factory.name());
        manager.add_factory(factory);
    }
    if prefork.is_some_and(|p| !p.helpers().is_empty())
        && !config
            .factories
            .iter()
            .any(|f| matches!(f.kind, FactoryKind::Prefork { .. }))
    {
        warn!("[config] running in a prefork group but no factory uses its helpers");
    }
    Ok(manager)
}

#[allow(clippy::unwrap_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::keys;
    use std::fs;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse(
            r#"
log_level: debug
idle:
  type: cpu
  interval_ms: 250
  threshold: 0.3
factories:
  - type: debugger
    debugger: lldb
  - type: prelaunch
    match:
      template:
        program: /opt/datadog-agent/bin/agent/agent
    template:
      program: /opt/datadog-agent/bin/agent/agent
      arguments: [generic]
    samples_required: 3
    max_wait_ms: 60000
  - type: socket
    path: /run/dd-procmgr.sock
    match:
      key: remote
      value: true
  - type: standard
"#,
        );
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.idle.kind, IdleKind::Cpu);
        assert_eq!(config.idle.interval_ms, Some(250));
        assert_eq!(config.factories.len(), 4);

        assert!(matches!(
            config.factories[0].kind,
            FactoryKind::Debugger { debugger: Some(ref d) } if d == "lldb"
        ));
        let FactoryKind::Prelaunch {
            ref template,
            samples_required,
            max_wait_ms,
        } = config.factories[1].kind
        else {
            panic!("expected a prelaunch factory");
        };
        assert_eq!(template.arguments(), vec!["generic"]);
        assert_eq!(samples_required, 3);
        assert_eq!(max_wait_ms, Some(60000));
        assert!(matches!(
            config.factories[1].matcher,
            Some(MatchConfig::Template { .. })
        ));
        assert_eq!(
            config.factories[2].matcher,
            Some(MatchConfig::Key {
                key: "remote".to_string(),
                value: Some(Value::Bool(true)),
            })
        );
        assert!(matches!(config.factories[3].kind, FactoryKind::Standard));
    }

    #[test]
    fn test_unknown_factory_type_is_rejected() {
        assert!(serde_yaml::from_str::<Config>("factories:\n  - type: docker\n").is_err());
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config = Config::load(Path::new("/nonexistent/procmgr.yaml")).unwrap();
        assert!(config.factories.is_empty());
        assert_eq!(config.idle.kind, IdleKind::Timer);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procmgr.yaml");
        fs::write(&path, "factories:\n  - type: standard\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().factories.len(), 1);

        fs::write(&path, "").unwrap();
        assert!(Config::load(&path).unwrap().factories.is_empty());

        fs::write(&path, "factories: [").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_explicit_path_wins() {
        assert_eq!(
            Config::path(Some(Path::new("/tmp/x.yaml"))),
            PathBuf::from("/tmp/x.yaml")
        );
    }

    #[test]
    fn test_idle_config_validation() {
        let io = IdleConfig {
            kind: IdleKind::Io,
            ..IdleConfig::default()
        };
        assert!(io.build().is_err());

        let out_of_range = IdleConfig {
            threshold: Some(1.5),
            ..IdleConfig::default()
        };
        assert!(out_of_range.build().is_err());

        assert!(IdleConfig::default().build().is_ok());
    }

    #[test]
    fn test_match_config_builds_delegates() {
        let mut gdb = ProcessInfo::with_program("/bin/true", &[]);
        gdb.set_value("gdb", true);

        let by_key = MatchConfig::Key {
            key: "gdb".to_string(),
            value: None,
        }
        .build();
        assert!(by_key.matches(&gdb));
        assert!(!by_key.matches(&ProcessInfo::with_program("/bin/true", &[])));

        let mut template = ProcessInfo::new();
        template.set_value(keys::PROGRAM, "/bin/true");
        let by_template = MatchConfig::Template { template }.build();
        assert!(by_template.matches(&gdb));
        assert!(!by_template.matches(&ProcessInfo::with_program("/bin/false", &[])));
    }

    #[tokio::test]
    async fn test_quiet_samples_need_load_sampling() {
        let config = parse(
            r#"
factories:
  - type: prelaunch
    template:
      program: /bin/cat
    samples_required: 2
"#,
        );
        let err = build_manager(&config, None).await.err().unwrap();
        assert!(format!("{err:#}").contains("samples_required"));

        let mut config = config;
        config.idle.kind = IdleKind::Cpu;
        assert!(config.check_pacing().is_ok());
    }

    #[tokio::test]
    async fn test_build_manager_keeps_file_order() {
        let config = parse(
            r#"
factories:
  - type: debugger
  - type: prelaunch
    template:
      program: /bin/cat
  - type: standard
"#,
        );
        let manager = build_manager(&config, None).await.unwrap();
        let names: Vec<&str> = manager.factories().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["debugger", "prelaunch", "standard"]);
    }

    #[tokio::test]
    async fn test_build_manager_defaults_to_standard() {
        let manager = build_manager(&Config::default(), None).await.unwrap();
        assert_eq!(manager.factories().len(), 1);
        assert_eq!(manager.factories()[0].name(), "standard");
    }

    #[tokio::test]
    async fn test_prefork_factory_needs_a_group() {
        let config = parse("factories:\n  - type: prefork\n    index: 0\n");
        assert!(build_manager(&config, None).await.is_err());
    }

    #[tokio::test]
    async fn test_prelaunch_template_needs_program() {
        let config = parse("factories:\n  - type: prelaunch\n    template:\n      arguments: [x]\n");
        assert!(build_manager(&config, None).await.is_err());
    }
}
