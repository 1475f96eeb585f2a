//! Declarative session configuration.
//!
//! A session file names the timing parameters and lists every module with
//! its kind, free-form parameters and signal wiring. It is consumed once:
//! [`SessionConfig::plan`] checks the wiring and [`crate::registry`] turns the
//! module entries into running modules.

use crate::bus::{Backing, SignalKind, SignalSpec};
use crate::error::{ConstructionFault, Result, RuntimeError};
use crate::module::ModuleDecl;
use crate::runtime::SessionSettings;
use crate::scheduler::DagScheduler;
use crate::timer::TimerConfig;
use crate::types::DType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub name: String,
    pub period_ms: f64,
    pub late_tolerance_ms: f64,
    pub spin_window_ms: f64,
    pub max_ticks: Option<u64>,
    pub setup_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
    /// File-backed segments under `<shm_dir>/<name>` when set
    pub shm_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            period_ms: 50.0,
            late_tolerance_ms: 0.1,
            spin_window_ms: 2.0,
            max_ticks: None,
            setup_timeout_ms: 10_000,
            teardown_timeout_ms: 1_000,
            shm_dir: None,
            checkpoint_dir: None,
        }
    }
}

/// Built-in module variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Acquisition,
    Filter,
    Features,
    Clda,
    Task,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 5] = [
        ModuleKind::Acquisition,
        ModuleKind::Filter,
        ModuleKind::Features,
        ModuleKind::Clda,
        ModuleKind::Task,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Acquisition => "acquisition",
            ModuleKind::Filter => "filter",
            ModuleKind::Features => "features",
            ModuleKind::Clda => "clda",
            ModuleKind::Task => "task",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ModuleKind::Acquisition => "Polls a sample source and pushes samples into a stream signal",
            ModuleKind::Filter => "Cascaded notch/Butterworth filtering of a stream, per channel",
            ModuleKind::Features => "Log band power over a window, mapped through a linear model",
            ModuleKind::Clda => "Adaptive Kalman decoder with closed-loop decoder adaptation",
            ModuleKind::Task => "Center-out target sequence",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub kind: ModuleKind,
    #[serde(default)]
    pub params: serde_yaml::Value,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    #[serde(default)]
    pub stream: bool,
}

/// An input is either a bare signal name or a name with the shape and dtype
/// the reader expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputConfig {
    Name(String),
    Expect {
        name: String,
        #[serde(default)]
        shape: Option<Vec<usize>>,
        #[serde(default)]
        dtype: Option<DType>,
    },
}

impl InputConfig {
    pub fn name(&self) -> &str {
        match self {
            InputConfig::Name(name) => name,
            InputConfig::Expect { name, .. } => name,
        }
    }
}

/// Outcome of a successful [`SessionConfig::plan`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionPlan {
    pub session: String,
    pub period_ms: f64,
    pub order: Vec<String>,
    pub signals: Vec<SignalSpec>,
    /// Bytes of shared memory the bus will map
    pub mapped_bytes: usize,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
        log::info!(
            "Loaded session '{}' from {} ({} modules)",
            config.session.name,
            path.display(),
            config.modules.len()
        );
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Every output of every module as a bus declaration
    pub fn signals(&self) -> Vec<SignalSpec> {
        self.modules
            .iter()
            .flat_map(|module| {
                module.outputs.iter().map(move |out| SignalSpec {
                    name: out.name.clone(),
                    shape: out.shape.clone(),
                    dtype: out.dtype,
                    writer: module.name.clone(),
                    kind: if out.stream {
                        SignalKind::Stream
                    } else {
                        SignalKind::Snapshot
                    },
                })
            })
            .collect()
    }

    pub fn decl(module: &ModuleConfig) -> ModuleDecl {
        ModuleDecl {
            name: module.name.clone(),
            inputs: module.inputs.iter().map(|i| i.name().to_string()).collect(),
            outputs: module.outputs.iter().map(|o| o.name.clone()).collect(),
            depends_on: module.depends_on.clone(),
        }
    }

    pub fn settings(&self) -> SessionSettings {
        let s = &self.session;
        SessionSettings {
            name: s.name.clone(),
            timer: TimerConfig {
                period: millis(s.period_ms),
                late_tolerance: millis(s.late_tolerance_ms),
                spin_window: millis(s.spin_window_ms),
            },
            max_ticks: s.max_ticks,
            setup_timeout: Duration::from_millis(s.setup_timeout_ms),
            teardown_timeout: Duration::from_millis(s.teardown_timeout_ms),
            backing: match &s.shm_dir {
                Some(dir) => Backing::Directory(dir.join(&s.name)),
                None => Backing::Anonymous,
            },
            checkpoint_dir: s.checkpoint_dir.clone(),
        }
    }

    fn check_session(&self) -> std::result::Result<(), ConstructionFault> {
        let s = &self.session;
        if s.name.trim().is_empty() {
            return Err(ConstructionFault::InvalidConfig("session name is empty".to_string()));
        }
        if !(s.period_ms.is_finite() && s.period_ms > 0.0) {
            return Err(ConstructionFault::InvalidConfig(format!(
                "period_ms must be positive, got {}",
                s.period_ms
            )));
        }
        if !(s.late_tolerance_ms >= 0.0 && s.spin_window_ms >= 0.0) {
            return Err(ConstructionFault::InvalidConfig(
                "late_tolerance_ms and spin_window_ms must be non-negative".to_string(),
            ));
        }
        if self.modules.is_empty() {
            return Err(ConstructionFault::InvalidConfig("session declares no modules".to_string()));
        }
        Ok(())
    }

    /// Check the wiring without allocating or spawning anything: unique
    /// module names, one writer per signal, known inputs with matching
    /// shape and dtype, and an acyclic dependency graph.
    pub fn plan(&self) -> std::result::Result<SessionPlan, ConstructionFault> {
        self.check_session()?;

        let mut writers: HashMap<&str, (&str, &OutputConfig)> = HashMap::new();
        for module in &self.modules {
            for out in &module.outputs {
                if out.shape.is_empty() || out.shape.contains(&0) {
                    return Err(ConstructionFault::InvalidConfig(format!(
                        "signal '{}' has an empty dimension in {:?}",
                        out.name, out.shape
                    )));
                }
                if out.stream && out.shape.len() != 2 {
                    return Err(ConstructionFault::InvalidConfig(format!(
                        "stream signal '{}' must have shape [window, channels]",
                        out.name
                    )));
                }
                if let Some((first, _)) = writers.insert(out.name.as_str(), (module.name.as_str(), out)) {
                    return Err(ConstructionFault::DuplicateWriter {
                        signal: out.name.clone(),
                        first: first.to_string(),
                        second: module.name.clone(),
                    });
                }
            }
        }

        for module in &self.modules {
            for input in &module.inputs {
                let &(writer, out) = writers.get(input.name()).ok_or_else(|| ConstructionFault::UnknownSignal {
                    module: module.name.clone(),
                    signal: input.name().to_string(),
                })?;
                if let InputConfig::Expect { shape, dtype, .. } = input {
                    if let Some(shape) = shape {
                        if shape != &out.shape {
                            return Err(ConstructionFault::ShapeMismatch {
                                signal: out.name.clone(),
                                expected: shape.clone(),
                                found: out.shape.clone(),
                            });
                        }
                    }
                    if let Some(dtype) = dtype {
                        if *dtype != out.dtype {
                            return Err(ConstructionFault::DTypeMismatch {
                                signal: out.name.clone(),
                                expected: *dtype,
                                found: out.dtype,
                            });
                        }
                    }
                }
            }
        }

        let scheduler = DagScheduler::new(
            self.modules
                .iter()
                .map(|m| (m.name.as_str(), m.depends_on.as_slice())),
        )?;

        for module in &self.modules {
            let Some(reader) = scheduler.index_of(&module.name) else {
                continue;
            };
            let upstream = scheduler.ancestors(reader);
            for input in &module.inputs {
                let Some(&(writer, out)) = writers.get(input.name()) else {
                    continue;
                };
                let ordered = writer == module.name || scheduler.index_of(writer).is_some_and(|w| upstream.contains(&w));
                if !ordered && !out.stream {
                    log::debug!(
                        "Module '{}' reads '{}' from '{}' without depending on it; it sees the previous tick",
                        module.name,
                        out.name,
                        writer
                    );
                }
            }
        }

        let signals = self.signals();
        let mapped_bytes = signals.iter().map(|s| s.payload_bytes()).sum();
        Ok(SessionPlan {
            session: self.session.name.clone(),
            period_ms: self.session.period_ms,
            order: scheduler.order_names(),
            signals,
            mapped_bytes,
        })
    }
}
