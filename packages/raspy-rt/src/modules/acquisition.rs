//! Acquisition: poll a source, tag every sample with a continuity counter
//! and push it into a stream signal.

use super::source::{open_source, AcquisitionSource, SourceConfig};
use super::{expect_len, output, parse_params};
use crate::bus::SignalWriter;
use crate::circular::{PushOutcome, StreamWriter};
use crate::config::ModuleConfig;
use crate::error::{BusError, ConstructionFault, ContinuityFault, ModuleError, ModuleResult};
use crate::module::{Module, ModuleIo, StepOutcome, TickContext};
use crate::types::FaultKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionParams {
    pub source: SourceConfig,
    /// Stream output; the first declared stream output when unset
    pub output: Option<String>,
    /// Snapshot output receiving the number of new samples each tick
    pub num_samples_output: Option<String>,
    /// Derive counters from the device's package counter when it has one
    pub use_package_counter: bool,
    pub package_modulus: u64,
    /// Package counter increment per sample (2 on some daisy-chained boards)
    pub package_expected_step: u64,
    /// Warm-up samples pushed but reported as zero new samples
    pub samples_to_skip: u64,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            output: None,
            num_samples_output: None,
            use_package_counter: true,
            package_modulus: 256,
            package_expected_step: 1,
            samples_to_skip: 0,
        }
    }
}

/// Unwraps a hardware package counter that wraps at `modulus` into a
/// monotonically increasing sample counter.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageCounter {
    modulus: u64,
    step: u64,
    epoch: u64,
    last: Option<u64>,
}

impl PackageCounter {
    pub fn new(modulus: u64, step: u64) -> Self {
        Self {
            modulus: modulus.max(1),
            step: step.max(1),
            epoch: 0,
            last: None,
        }
    }

    pub fn next(&mut self, raw: u64) -> u64 {
        let raw = raw % self.modulus;
        if let Some(last) = self.last {
            // A backwards jump of more than half the modulus is a wrap
            if raw < last && last - raw > self.modulus / 2 {
                self.epoch += self.modulus;
            }
        }
        self.last = Some(raw);
        (self.epoch + raw) / self.step
    }
}

pub struct Acquisition {
    params: AcquisitionParams,
    output: String,
    num_samples_output: Option<String>,
    channels: usize,
    source: Option<Box<dyn AcquisitionSource>>,
    writer: Option<StreamWriter>,
    count_writer: Option<SignalWriter>,
    package: PackageCounter,
    total_samples: u64,
    valid_samples: u64,
}

impl Acquisition {
    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConstructionFault> {
        let params: AcquisitionParams = parse_params(config)?;
        let out = output(config, params.output.as_deref(), true)?;
        let channels = out.shape[1];
        if let Some(declared) = params.source.declared_channels() {
            if declared != channels {
                return Err(ConstructionFault::ShapeMismatch {
                    signal: out.name.clone(),
                    expected: vec![out.shape[0], declared],
                    found: out.shape.clone(),
                });
            }
        }
        let num_samples_output = match params.num_samples_output.as_deref() {
            Some(name) => {
                let count = output(config, Some(name), false)?;
                expect_len(count, 1)?;
                Some(count.name.clone())
            }
            None => None,
        };

        Ok(Self {
            package: PackageCounter::new(params.package_modulus, params.package_expected_step),
            output: out.name.clone(),
            num_samples_output,
            channels,
            params,
            source: None,
            writer: None,
            count_writer: None,
            total_samples: 0,
            valid_samples: 0,
        })
    }

    /// Samples counted after the warm-up skip
    pub fn valid_samples(&self) -> u64 {
        self.valid_samples
    }

    fn push_rows(&mut self, io: &ModuleIo, rows: Vec<Vec<f64>>, package: Option<Vec<u64>>) -> ModuleResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ModuleError::Other("acquisition stepped before setup".to_string()))?;
        let base = self.total_samples;
        let package = package.filter(|_| self.params.use_package_counter);
        if let Some(raw) = &package {
            if raw.len() != rows.len() {
                return Err(ModuleError::Source(format!(
                    "block has {} package counters for {} samples",
                    raw.len(),
                    rows.len()
                )));
            }
        }

        for (i, row) in rows.iter().enumerate() {
            let counter = match &package {
                Some(raw) => self.package.next(raw[i]),
                None => base + i as u64,
            };
            match writer.push_f64(row, counter) {
                Ok(PushOutcome::Accepted) => {}
                Ok(PushOutcome::AfterGap { expected, missing }) => io.report(FaultKind::Continuity {
                    signal: self.output.clone(),
                    expected,
                    got: counter,
                    missing,
                }),
                Err(BusError::Continuity(ContinuityFault::Stale { last, got })) => io.report(FaultKind::Continuity {
                    signal: self.output.clone(),
                    expected: last + 1,
                    got,
                    missing: 0,
                }),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Module for Acquisition {
    fn kind(&self) -> &'static str {
        "acquisition"
    }

    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        let source = open_source(&self.params.source)?;
        if source.channels() != self.channels {
            return Err(ModuleError::InvalidParameter(format!(
                "source delivers {} channels, '{}' holds {}",
                source.channels(),
                self.output,
                self.channels
            )));
        }
        log::info!("Acquisition '{}': {}", io.name(), source.describe());

        self.writer = Some(io.stream_writer(&self.output)?);
        if let Some(name) = &self.num_samples_output {
            self.count_writer = Some(io.writer(name)?);
        }
        self.source = Some(source);
        Ok(())
    }

    fn step(&mut self, io: &mut ModuleIo, _tick: &TickContext) -> ModuleResult<StepOutcome> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| ModuleError::Other("acquisition stepped before setup".to_string()))?;
        let block = source.poll()?;
        if block.num_channels() != self.channels && block.num_samples() > 0 {
            return Err(ModuleError::Source(format!(
                "block has {} channels, expected {}",
                block.num_channels(),
                self.channels
            )));
        }

        let n = block.num_samples() as u64;
        let skipping = self.total_samples + n < self.params.samples_to_skip;
        let rows = block.rows();
        self.push_rows(io, rows, block.package)?;
        self.total_samples += n;

        let fresh = if skipping { 0 } else { n };
        self.valid_samples += fresh;
        if let Some(writer) = self.count_writer.as_mut() {
            writer.write_f64(&[fresh as f64])?;
        }
        Ok(StepOutcome::Continue)
    }

    fn teardown(&mut self, io: &mut ModuleIo) {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        if let Some(writer) = &self.writer {
            let stats = writer.stats();
            log::info!(
                "Acquisition '{}' stopped: {} samples ({} valid), {} gaps, {} rejected",
                io.name(),
                self.total_samples,
                self.valid_samples,
                stats.gaps,
                stats.rejected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::harness;
    use crate::modules::source::SampleBlock;

    const CONFIG: &str = r#"
name: eeg
kind: acquisition
params:
  source: { type: synthetic, channels: 16, pacing: { mode: per_poll, samples: 25 } }
  num_samples_output: numEEGSamples
outputs:
  - { name: eegbuffer, shape: [1250, 16], dtype: f32, stream: true }
  - { name: numEEGSamples, shape: [1], dtype: i32 }
"#;

    #[test]
    fn test_package_counter_unwraps() {
        let mut counter = PackageCounter::new(256, 1);
        let counters: Vec<u64> = [254, 255, 0, 1].iter().map(|&r| counter.next(r)).collect();
        assert_eq!(counters, vec![254, 255, 256, 257]);
    }

    #[test]
    fn test_package_counter_expected_step() {
        let mut counter = PackageCounter::new(256, 2);
        let counters: Vec<u64> = [252, 254, 0, 2].iter().map(|&r| counter.next(r)).collect();
        assert_eq!(counters, vec![126, 127, 128, 129]);
    }

    #[test]
    fn test_ten_seconds_of_zeros() {
        let config = harness::module_config(CONFIG);
        let bus = harness::bus_for(&[&config]);
        let (mut io, faults) = harness::io_for(&bus, &config);
        let mut module = Acquisition::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();

        // 50 polls of 25 samples at 125 Hz
        for t in 1..=50 {
            let tick = harness::tick(&mut io, t);
            module.step(&mut io, &tick).unwrap();
        }
        harness::commit_all(&bus);

        let reader = bus.stream_reader(bus.id("eegbuffer").unwrap()).unwrap();
        let block = reader.read_contiguous::<f32>(1250).unwrap();
        assert_eq!(block.rows(), 1250);
        assert_eq!(block.samples.len(), 1250 * 16);
        assert!(block.samples.iter().all(|&v| v == 0.0));
        assert_eq!(block.counters.first(), Some(&0));
        assert_eq!(block.counters.last(), Some(&1249));
        assert_eq!(reader.stats().continuity_faults(), 0);
        assert!(faults.try_recv().is_err());

        let count = bus.read::<i32>(bus.id("numEEGSamples").unwrap()).unwrap();
        assert_eq!(count.values, vec![25]);
        assert_eq!(module.valid_samples(), 1250);
    }

    #[test]
    fn test_dropped_packages_reported() {
        let config = harness::module_config(
            r#"
name: eeg
kind: acquisition
params:
  source:
    type: synthetic
    channels: 2
    pacing: { mode: per_poll, samples: 10 }
    package_modulus: 256
    drop_every: 5
outputs:
  - { name: raw, shape: [64, 2], dtype: f64, stream: true }
"#,
        );
        let bus = harness::bus_for(&[&config]);
        let (mut io, faults) = harness::io_for(&bus, &config);
        let mut module = Acquisition::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();
        let tick = harness::tick(&mut io, 1);
        module.step(&mut io, &tick).unwrap();

        let records: Vec<_> = faults.try_iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tick, 1);
        assert_eq!(
            records[0].kind,
            FaultKind::Continuity {
                signal: "raw".to_string(),
                expected: 4,
                got: 5,
                missing: 1,
            }
        );
        let stats = bus.stream_reader(bus.id("raw").unwrap()).unwrap().stats();
        assert_eq!(stats.accepted, 8);
        assert_eq!(stats.gaps, 1);
    }

    /// Delivers one counter fewer than samples
    struct ShortCounters;

    impl AcquisitionSource for ShortCounters {
        fn describe(&self) -> String {
            "short counters".to_string()
        }

        fn channels(&self) -> usize {
            2
        }

        fn sample_rate(&self) -> f64 {
            125.0
        }

        fn poll(&mut self) -> ModuleResult<SampleBlock> {
            Ok(SampleBlock {
                data: vec![vec![0.0; 3], vec![0.0; 3]],
                package: Some(vec![1, 2]),
            })
        }
    }

    #[test]
    fn test_package_counter_length_checked() {
        let config = harness::module_config(
            r#"
name: eeg
kind: acquisition
params:
  source: { type: synthetic, channels: 2, pacing: { mode: per_poll, samples: 3 } }
outputs:
  - { name: raw, shape: [64, 2], dtype: f32, stream: true }
"#,
        );
        let bus = harness::bus_for(&[&config]);
        let (mut io, _faults) = harness::io_for(&bus, &config);
        let mut module = Acquisition::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();
        module.source = Some(Box::new(ShortCounters));

        let tick = harness::tick(&mut io, 1);
        let err = module.step(&mut io, &tick).unwrap_err();
        assert!(matches!(err, ModuleError::Source(ref m) if m.contains("2 package counters for 3 samples")));
        assert_eq!(bus.stream_reader(bus.id("raw").unwrap()).unwrap().position(), 0);
    }

    #[test]
    fn test_warm_up_reports_zero_samples() {
        let config = harness::module_config(
            &CONFIG.replace("num_samples_output: numEEGSamples", "num_samples_output: numEEGSamples\n  samples_to_skip: 60"),
        );
        let bus = harness::bus_for(&[&config]);
        let (mut io, _faults) = harness::io_for(&bus, &config);
        let mut module = Acquisition::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();
        let count_id = bus.id("numEEGSamples").unwrap();

        let mut reported = Vec::new();
        for t in 1..=4 {
            let tick = harness::tick(&mut io, t);
            module.step(&mut io, &tick).unwrap();
            harness::commit_all(&bus);
            reported.push(bus.read::<i32>(count_id).unwrap().values[0]);
        }
        assert_eq!(reported, vec![0, 0, 25, 25]);
        // Warm-up samples were still pushed
        assert_eq!(bus.stream_reader(bus.id("eegbuffer").unwrap()).unwrap().position(), 100);
    }

    #[test]
    fn test_channel_count_checked_at_construction() {
        let config = harness::module_config(&CONFIG.replace("channels: 16", "channels: 8"));
        assert!(matches!(
            Acquisition::from_config(&config),
            Err(ConstructionFault::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_requires_stream_output() {
        let config = harness::module_config(
            "name: eeg\nkind: acquisition\noutputs:\n  - { name: raw, shape: [16], dtype: f32 }\n",
        );
        assert!(matches!(
            Acquisition::from_config(&config),
            Err(ConstructionFault::InvalidConfig(_))
        ));
    }
}
