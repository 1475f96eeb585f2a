//! Module registry: maps a config kind tag to a constructed module.

use crate::config::{ModuleConfig, ModuleKind, SessionConfig, SessionPlan};
use crate::error::{ConstructionFault, Result};
use crate::module::Module;
use crate::modules::{Acquisition, CenterOutTask, CldaDecoder, Features, Filter};
use crate::runtime::Pipeline;
use serde::Serialize;

/// What `raspy info` prints per module kind
#[derive(Debug, Clone, Serialize)]
pub struct KindMetadata {
    pub kind: &'static str,
    pub description: &'static str,
}

pub fn kinds() -> Vec<KindMetadata> {
    ModuleKind::ALL
        .iter()
        .map(|k| KindMetadata {
            kind: k.name(),
            description: k.description(),
        })
        .collect()
}

/// Build one module from its config block. No I/O happens here; sources,
/// models and priors are opened in `setup`.
pub fn build_module(config: &ModuleConfig) -> std::result::Result<Box<dyn Module>, ConstructionFault> {
    let module: Box<dyn Module> = match config.kind {
        ModuleKind::Acquisition => Box::new(Acquisition::from_config(config)?),
        ModuleKind::Filter => Box::new(Filter::from_config(config)?),
        ModuleKind::Features => Box::new(Features::from_config(config)?),
        ModuleKind::Clda => Box::new(CldaDecoder::from_config(config)?),
        ModuleKind::Task => Box::new(CenterOutTask::from_config(config)?),
    };
    log::debug!("Built module '{}' ({})", config.name, config.kind);
    Ok(module)
}

/// Validate a session and build every module, without allocating signals.
pub fn validate(config: &SessionConfig) -> std::result::Result<SessionPlan, ConstructionFault> {
    let plan = config.plan()?;
    for module in &config.modules {
        build_module(module)?;
    }
    Ok(plan)
}

impl Pipeline {
    /// Construct a runnable pipeline from a parsed session file.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let plan = config.plan()?;
        let modules = config
            .modules
            .iter()
            .map(|m| Ok((SessionConfig::decl(m), build_module(m)?)))
            .collect::<std::result::Result<Vec<_>, ConstructionFault>>()?;
        Pipeline::from_modules(config.settings(), plan.signals, modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    const SESSION: &str = r#"
session: { name: registry, period_ms: 5, max_ticks: 3 }
modules:
  - name: eeg
    kind: acquisition
    params: { source: { type: synthetic, channels: 2, pacing: { mode: per_poll, samples: 4 } } }
    outputs:
      - { name: raw, shape: [64, 2], dtype: f32, stream: true }
  - name: task
    kind: task
    outputs:
      - { name: target_pos, shape: [2], dtype: f32 }
"#;

    #[test]
    fn test_kinds_listed() {
        let kinds = kinds();
        assert_eq!(kinds.len(), ModuleKind::ALL.len());
        assert!(kinds.iter().any(|k| k.kind == "clda"));
    }

    #[test]
    fn test_validate_builds_every_module() {
        let config = SessionConfig::from_yaml_str(SESSION).unwrap();
        let plan = validate(&config).unwrap();
        assert_eq!(plan.order.len(), 2);
    }

    #[test]
    fn test_bad_params_rejected_before_spawn() {
        let config = SessionConfig::from_yaml_str(&SESSION.replace("channels: 2", "channels: 3")).unwrap();
        assert!(validate(&config).is_err());
        assert!(matches!(
            Pipeline::from_config(&config),
            Err(RuntimeError::Construction(_))
        ));
    }

    #[test]
    fn test_pipeline_from_config() {
        let config = SessionConfig::from_yaml_str(SESSION).unwrap();
        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.bus().len(), 2);
        let mut order = pipeline.scheduler().order_names();
        order.sort();
        assert_eq!(order, vec!["eeg", "task"]);
    }
}
