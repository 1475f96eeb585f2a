//! Per-channel IIR filtering from one stream signal into another.

use super::{input, output, parse_params};
use crate::circular::{StreamReader, StreamWriter};
use crate::config::ModuleConfig;
use crate::error::{ConstructionFault, ModuleError, ModuleResult};
use crate::filters::{default_chain, design_chain, FilterStage, SosFilter};
use crate::module::{Module, ModuleIo, StepOutcome, TickContext};
use crate::types::FaultKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub input: Option<String>,
    pub output: Option<String>,
    pub sample_rate: f64,
    pub stages: Vec<FilterStage>,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            sample_rate: 125.0,
            stages: default_chain(),
        }
    }
}

pub struct Filter {
    input: String,
    output: String,
    channels: usize,
    prototype: SosFilter,
    filters: Vec<SosFilter>,
    primed: bool,
    position: u64,
    reader: Option<StreamReader>,
    writer: Option<StreamWriter>,
}

impl Filter {
    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConstructionFault> {
        let params: FilterParams = parse_params(config)?;
        let prototype = design_chain(&params.stages, params.sample_rate)
            .map_err(|e| ConstructionFault::InvalidConfig(format!("module '{}': {}", config.name, e)))?;
        let out = output(config, params.output.as_deref(), true)?;
        let channels = out.shape[1];
        log::debug!(
            "Filter '{}': {} stages, {} sections per channel",
            config.name,
            params.stages.len(),
            prototype.len()
        );
        Ok(Self {
            input: input(config, params.input.as_deref())?,
            output: out.name.clone(),
            channels,
            filters: vec![prototype.clone(); channels],
            prototype,
            primed: false,
            position: 0,
            reader: None,
            writer: None,
        })
    }
}

impl Module for Filter {
    fn kind(&self) -> &'static str {
        "filter"
    }

    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        let reader = io.stream_reader(&self.input)?;
        if reader.spec().channels() != self.channels {
            return Err(ModuleError::InvalidParameter(format!(
                "'{}' has {} channels but '{}' has {}",
                self.input,
                reader.spec().channels(),
                self.output,
                self.channels
            )));
        }
        self.position = reader.position();
        self.reader = Some(reader);
        self.writer = Some(io.stream_writer(&self.output)?);
        Ok(())
    }

    fn step(&mut self, io: &mut ModuleIo, _tick: &TickContext) -> ModuleResult<StepOutcome> {
        let (Some(reader), Some(writer)) = (self.reader.as_ref(), self.writer.as_mut()) else {
            return Err(ModuleError::Other("filter stepped before setup".to_string()));
        };

        let block = reader.read_new_f64(self.position)?;
        if block.lost > 0 {
            io.report(FaultKind::Overrun {
                signal: self.input.clone(),
                lost: block.lost,
            });
        }
        self.position = block.position;

        let mut out = vec![0.0; self.channels];
        for r in 0..block.rows() {
            let row = block.row(r);
            if !self.primed {
                for (filter, &x) in self.filters.iter_mut().zip(row) {
                    filter.prime(x);
                }
                self.primed = true;
            }
            for ((y, filter), &x) in out.iter_mut().zip(self.filters.iter_mut()).zip(row) {
                *y = filter.process(x);
            }
            writer.push_f64(&out, block.counters[r])?;
        }
        Ok(StepOutcome::Continue)
    }

    fn teardown(&mut self, io: &mut ModuleIo) {
        log::debug!(
            "Filter '{}' stopped at position {} ({} sections per channel)",
            io.name(),
            self.position,
            self.prototype.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{SignalKind, SignalSpec};
    use crate::modules::harness;
    use crate::types::DType;

    const CONFIG: &str = r#"
name: filt
kind: filter
inputs: [raw]
outputs:
  - { name: clean, shape: [100, 2], dtype: f64, stream: true }
"#;

    fn stream(name: &str, writer: &str) -> SignalSpec {
        SignalSpec {
            name: name.to_string(),
            shape: vec![100, 2],
            dtype: DType::F64,
            writer: writer.to_string(),
            kind: SignalKind::Stream,
        }
    }

    #[test]
    fn test_primed_highpass_removes_offset_immediately() {
        let config = harness::module_config(CONFIG);
        let bus = harness::bus(vec![stream("raw", "eeg"), stream("clean", "filt")]);
        let mut raw = bus.stream_writer(bus.id("raw").unwrap(), "eeg").unwrap();
        let (mut io, faults) = harness::io_for(&bus, &config);
        let mut module = Filter::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();

        for c in 0..40u64 {
            raw.push(&[5.0f64, -3.0], 100 + c).unwrap();
        }
        let tick = harness::tick(&mut io, 1);
        module.step(&mut io, &tick).unwrap();

        let clean = bus.stream_reader(bus.id("clean").unwrap()).unwrap();
        let block = clean.read_contiguous::<f64>(40).unwrap();
        // Counters pass through unchanged
        assert_eq!(block.counters[0], 100);
        assert_eq!(block.counters[39], 139);
        assert!(block.samples.iter().all(|v| v.abs() < 1e-9), "{:?}", &block.samples[..4]);
        assert!(faults.try_recv().is_err());
    }

    #[test]
    fn test_overrun_reported() {
        let config = harness::module_config(CONFIG);
        let bus = harness::bus(vec![stream("raw", "eeg"), stream("clean", "filt")]);
        let mut raw = bus.stream_writer(bus.id("raw").unwrap(), "eeg").unwrap();
        let (mut io, faults) = harness::io_for(&bus, &config);
        let mut module = Filter::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();

        for c in 0..250u64 {
            raw.push(&[0.0f64, 0.0], c).unwrap();
        }
        let tick = harness::tick(&mut io, 2);
        module.step(&mut io, &tick).unwrap();

        let record = faults.try_recv().unwrap();
        assert_eq!(
            record.kind,
            FaultKind::Overrun {
                signal: "raw".to_string(),
                lost: 150
            }
        );
        assert_eq!(bus.stream_reader(bus.id("clean").unwrap()).unwrap().position(), 100);
    }

    #[test]
    fn test_incremental_reads() {
        let config = harness::module_config(CONFIG);
        let bus = harness::bus(vec![stream("raw", "eeg"), stream("clean", "filt")]);
        let mut raw = bus.stream_writer(bus.id("raw").unwrap(), "eeg").unwrap();
        let (mut io, _faults) = harness::io_for(&bus, &config);
        let mut module = Filter::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();
        let clean = bus.stream_reader(bus.id("clean").unwrap()).unwrap();

        let mut counter = 0u64;
        for t in 1..=5 {
            for _ in 0..7 {
                raw.push(&[1.0f64, 2.0], counter).unwrap();
                counter += 1;
            }
            let tick = harness::tick(&mut io, t);
            module.step(&mut io, &tick).unwrap();
            assert_eq!(clean.position(), counter);
        }
    }

    #[test]
    fn test_invalid_stage_rejected() {
        let config = harness::module_config(&format!(
            "{}params:\n  stages:\n    - {{ type: lowpass, frequency: 90 }}\n",
            CONFIG.trim_start()
        ));
        assert!(matches!(
            Filter::from_config(&config),
            Err(ConstructionFault::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_channel_mismatch_fails_setup() {
        let config = harness::module_config(CONFIG);
        let mut narrow = stream("raw", "eeg");
        narrow.shape = vec![100, 3];
        let bus = harness::bus(vec![narrow, stream("clean", "filt")]);
        let (mut io, _faults) = harness::io_for(&bus, &config);
        let mut module = Filter::from_config(&config).unwrap();
        assert!(module.setup(&mut io).is_err());
    }
}
