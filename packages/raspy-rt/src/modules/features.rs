//! Log band power over a sliding window, mapped through a fixed linear model.

use super::{input, output, output_len, parse_params};
use crate::bus::SignalWriter;
use crate::circular::StreamReader;
use crate::config::ModuleConfig;
use crate::error::{ConstructionFault, ModuleError, ModuleResult};
use crate::module::{Module, ModuleIo, StepOutcome, TickContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub input: Option<String>,
    pub output: Option<String>,
    /// Samples per power estimate
    pub window: usize,
    /// JSON `{ "weights": [[..]], "bias": [..] }`; identity when unset
    pub model: Option<PathBuf>,
    pub log_floor: f64,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            window: 125,
            model: None,
            log_floor: 1e-12,
        }
    }
}

/// `y = W p + b`, with `W` row-major `outputs × inputs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureModel {
    pub weights: Vec<Vec<f64>>,
    #[serde(default)]
    pub bias: Vec<f64>,
}

impl FeatureModel {
    pub fn identity(n: usize) -> Self {
        Self {
            weights: (0..n).map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect(),
            bias: vec![0.0; n],
        }
    }

    pub fn load(path: &Path) -> ModuleResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut model: FeatureModel = serde_json::from_str(&text)
            .map_err(|e| ModuleError::Model(format!("{}: {}", path.display(), e)))?;
        if model.bias.is_empty() {
            model.bias = vec![0.0; model.outputs()];
        }
        model.check().map_err(|e| ModuleError::Model(format!("{}: {}", path.display(), e)))?;
        log::info!(
            "Loaded feature model {} ({} -> {})",
            path.display(),
            model.inputs(),
            model.outputs()
        );
        Ok(model)
    }

    fn check(&self) -> Result<(), String> {
        let width = self.inputs();
        if self.weights.is_empty() || width == 0 {
            return Err("empty weight matrix".to_string());
        }
        if self.weights.iter().any(|r| r.len() != width) {
            return Err("ragged weight matrix".to_string());
        }
        if self.bias.len() != self.outputs() {
            return Err(format!("bias has {} entries for {} outputs", self.bias.len(), self.outputs()));
        }
        Ok(())
    }

    pub fn inputs(&self) -> usize {
        self.weights.first().map_or(0, |r| r.len())
    }

    pub fn outputs(&self) -> usize {
        self.weights.len()
    }

    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect()
    }
}

/// `ln(mean(x²) + floor)` per channel of a row-major block
pub fn log_power(samples: &[f64], channels: usize, floor: f64) -> Vec<f64> {
    let rows = if channels == 0 { 0 } else { samples.len() / channels };
    let mut power = vec![0.0; channels];
    for row in samples.chunks_exact(channels.max(1)) {
        for (p, v) in power.iter_mut().zip(row) {
            *p += v * v;
        }
    }
    power
        .into_iter()
        .map(|p| (p / rows.max(1) as f64 + floor).ln())
        .collect()
}

pub struct Features {
    params: FeatureParams,
    input: String,
    output: String,
    output_len: usize,
    channels: usize,
    model: Option<FeatureModel>,
    reader: Option<StreamReader>,
    writer: Option<SignalWriter>,
}

impl Features {
    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConstructionFault> {
        let params: FeatureParams = parse_params(config)?;
        if params.window == 0 {
            return Err(ConstructionFault::InvalidConfig(format!(
                "module '{}': window must be at least 1",
                config.name
            )));
        }
        let out = output(config, params.output.as_deref(), false)?;
        Ok(Self {
            input: input(config, params.input.as_deref())?,
            output: out.name.clone(),
            output_len: output_len(out),
            channels: 0,
            params,
            model: None,
            reader: None,
            writer: None,
        })
    }
}

impl Module for Features {
    fn kind(&self) -> &'static str {
        "features"
    }

    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        let reader = io.stream_reader(&self.input)?;
        let spec = reader.spec();
        if self.params.window > spec.window() {
            return Err(ModuleError::InvalidParameter(format!(
                "window {} exceeds the {} samples '{}' holds",
                self.params.window,
                spec.window(),
                self.input
            )));
        }
        self.channels = spec.channels();

        let model = match &self.params.model {
            Some(path) => FeatureModel::load(path)?,
            None => FeatureModel::identity(self.channels),
        };
        if model.inputs() != self.channels || model.outputs() != self.output_len {
            return Err(ModuleError::Model(format!(
                "model maps {} -> {}, wiring needs {} -> {}",
                model.inputs(),
                model.outputs(),
                self.channels,
                self.output_len
            )));
        }
        self.model = Some(model);
        self.reader = Some(reader);
        self.writer = Some(io.writer(&self.output)?);
        Ok(())
    }

    fn step(&mut self, _io: &mut ModuleIo, _tick: &TickContext) -> ModuleResult<StepOutcome> {
        let (Some(reader), Some(writer), Some(model)) = (self.reader.as_ref(), self.writer.as_mut(), self.model.as_ref())
        else {
            return Err(ModuleError::Other("features stepped before setup".to_string()));
        };
        // Not enough history yet; the output keeps its previous value
        if reader.position() < self.params.window as u64 {
            return Ok(StepOutcome::Continue);
        }
        let block = reader.read_contiguous_f64(self.params.window)?;
        let power = log_power(&block.samples, self.channels, self.params.log_floor);
        writer.write_f64(&model.apply(&power))?;
        Ok(StepOutcome::Continue)
    }
}
