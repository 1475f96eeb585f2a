//! Closed-loop adaptive decoder module.
//!
//! Decodes the feature snapshot every tick, adapts the observation model
//! against the task target, and exports the estimator at setup and
//! teardown as `<session>-initial.json` / `<session>-final.json`.

use super::{input, output_len, parse_params};
use crate::bus::{SignalReader, SignalWriter};
use crate::config::{ModuleConfig, OutputConfig};
use crate::error::{ConstructionFault, ModuleError, ModuleResult};
use crate::estimator::{Adaptation, Estimator, EstimatorConfig, Prior, STATE_DIM};
use crate::module::{Module, ModuleIo, StepOutcome, TickContext};
use crate::types::FaultKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CldaParams {
    /// Feature snapshot input
    pub features: Option<String>,
    /// Optional `[x, y]` target input; adaptation needs it
    pub target: Option<String>,
    /// 7-element state output
    pub state_output: Option<String>,
    /// 2-element decoded position output
    pub position_output: Option<String>,
    /// JSON prior: `{c, q}` or `{r, s, t, ess}`
    pub prior: Option<PathBuf>,
    /// Decode only, never adapt
    pub frozen: bool,
    pub estimator: EstimatorConfig,
}

impl Default for CldaParams {
    fn default() -> Self {
        Self {
            features: None,
            target: None,
            state_output: None,
            position_output: None,
            prior: None,
            frozen: false,
            estimator: EstimatorConfig::default(),
        }
    }
}

/// The named output, or the first snapshot output holding `len` elements
fn sized_output<'a>(
    config: &'a ModuleConfig,
    name: Option<&str>,
    len: usize,
) -> Result<&'a OutputConfig, ConstructionFault> {
    let found = match name {
        Some(name) => config.outputs.iter().find(|o| o.name == name),
        None => config.outputs.iter().find(|o| !o.stream && output_len(o) == len),
    };
    let out = found.ok_or_else(|| {
        ConstructionFault::InvalidConfig(format!(
            "module '{}' needs a snapshot output of {} elements",
            config.name, len
        ))
    })?;
    if out.stream || output_len(out) != len {
        return Err(ConstructionFault::ShapeMismatch {
            signal: out.name.clone(),
            expected: vec![len],
            found: out.shape.clone(),
        });
    }
    Ok(out)
}

pub struct CldaDecoder {
    params: CldaParams,
    features: String,
    target: Option<String>,
    state_output: String,
    position_output: Option<String>,
    estimator: Option<Estimator>,
    features_reader: Option<SignalReader>,
    target_reader: Option<SignalReader>,
    state_writer: Option<SignalWriter>,
    position_writer: Option<SignalWriter>,
}

impl CldaDecoder {
    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConstructionFault> {
        let params: CldaParams = parse_params(config)?;
        params
            .estimator
            .validate()
            .map_err(|e| ConstructionFault::InvalidConfig(format!("module '{}': {}", config.name, e)))?;

        let target = match params.target.as_deref() {
            Some(name) => Some(input(config, Some(name))?),
            None => None,
        };
        let features = match params.features.as_deref() {
            Some(name) => input(config, Some(name))?,
            None => {
                let candidates: Vec<&str> = config
                    .inputs
                    .iter()
                    .map(|i| i.name())
                    .filter(|name| Some(*name) != target.as_deref())
                    .collect();
                match candidates.as_slice() {
                    [only] => only.to_string(),
                    _ => {
                        return Err(ConstructionFault::InvalidConfig(format!(
                            "module '{}': name the feature input in params.features",
                            config.name
                        )))
                    }
                }
            }
        };

        let state_output = sized_output(config, params.state_output.as_deref(), STATE_DIM)?.name.clone();
        let position_output = match params.position_output.as_deref() {
            Some(name) => Some(sized_output(config, Some(name), 2)?.name.clone()),
            None => config
                .outputs
                .iter()
                .find(|o| !o.stream && output_len(o) == 2)
                .map(|o| o.name.clone()),
        };

        Ok(Self {
            params,
            features,
            target,
            state_output,
            position_output,
            estimator: None,
            features_reader: None,
            target_reader: None,
            state_writer: None,
            position_writer: None,
        })
    }

    pub fn estimator(&self) -> Option<&Estimator> {
        self.estimator.as_ref()
    }

    fn export(&self, io: &ModuleIo, label: &str) -> ModuleResult<()> {
        let (Some(dir), Some(estimator)) = (io.session().checkpoint_dir.as_ref(), self.estimator.as_ref()) else {
            return Ok(());
        };
        estimator.checkpoint(&io.session().name, label).write(dir)?;
        Ok(())
    }
}

impl Module for CldaDecoder {
    fn kind(&self) -> &'static str {
        "clda"
    }

    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        let features = io.reader(&self.features)?;
        let obs_dim = features.spec().len();

        let prior = match &self.params.prior {
            Some(path) => Prior::load(path)?,
            None => {
                log::warn!(
                    "Decoder '{}' has no prior; starting from an uninformed model",
                    io.name()
                );
                Estimator::uninformed_prior(obs_dim)
            }
        };
        if prior.obs_dim() != obs_dim {
            return Err(ModuleError::Model(format!(
                "prior has {} observation rows, '{}' has {} features",
                prior.obs_dim(),
                self.features,
                obs_dim
            )));
        }
        self.estimator = Some(Estimator::new(self.params.estimator.clone(), &prior)?);

        if let Some(target) = &self.target {
            let reader = io.reader(target)?;
            if reader.spec().len() != 2 {
                return Err(ModuleError::InvalidParameter(format!(
                    "target '{}' must hold 2 elements, has {}",
                    target,
                    reader.spec().len()
                )));
            }
            self.target_reader = Some(reader);
        }
        self.features_reader = Some(features);
        self.state_writer = Some(io.writer(&self.state_output)?);
        if let Some(name) = &self.position_output {
            self.position_writer = Some(io.writer(name)?);
        }

        self.export(io, "initial")?;
        Ok(())
    }

    fn step(&mut self, io: &mut ModuleIo, _tick: &TickContext) -> ModuleResult<StepOutcome> {
        let (Some(estimator), Some(features)) = (self.estimator.as_mut(), self.features_reader.as_ref()) else {
            return Err(ModuleError::Other("decoder stepped before setup".to_string()));
        };
        let z = features.read_f64()?.values;

        if self.params.frozen {
            estimator.decode(&z)?;
        } else {
            let target = match &self.target_reader {
                Some(reader) => {
                    let t = reader.read_f64()?.values;
                    Some([t[0], t[1]])
                }
                None => None,
            };
            match estimator.step(&z, target)? {
                Adaptation::None => {}
                Adaptation::Committed(report) => {
                    if !report.converged {
                        io.report(FaultKind::GainNotConverged {
                            iterations: report.gain_iterations,
                            residual: report.residual,
                        });
                    }
                }
                Adaptation::Skipped(fault) => io.report(FaultKind::Numeric {
                    message: fault.to_string(),
                }),
            }
        }

        let state: Vec<f64> = estimator.state().iter().copied().collect();
        if let Some(writer) = self.state_writer.as_mut() {
            writer.write_f64(&state)?;
        }
        if let Some(writer) = self.position_writer.as_mut() {
            writer.write_f64(&state[..2])?;
        }
        Ok(StepOutcome::Continue)
    }

    fn teardown(&mut self, io: &mut ModuleIo) {
        if let Some(estimator) = &self.estimator {
            log::info!(
                "Decoder '{}' stopped after {} ticks: {} adaptations, {} skipped",
                io.name(),
                estimator.ticks(),
                estimator.adaptations(),
                estimator.skipped()
            );
        }
        if let Err(e) = self.export(io, "final") {
            log::error!("Decoder '{}' failed to write final checkpoint: {}", io.name(), e);
        }
    }
}
