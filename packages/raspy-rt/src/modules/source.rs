//! Sample sources polled by the acquisition module.
//!
//! A source hands out whatever samples arrived since the last poll as a
//! `channels × samples` block, the layout acquisition hardware delivers.
//! New sources implement [`AcquisitionSource`], add a variant to
//! [`SourceConfig`] and a match arm in [`open_source`].

use crate::error::{ModuleError, ModuleResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::PathBuf;
use std::time::Instant;

/// Samples from one poll, `data[channel][sample]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBlock {
    pub data: Vec<Vec<f64>>,
    /// Raw hardware package counter per sample, if the device has one
    pub package: Option<Vec<u64>>,
}

impl SampleBlock {
    pub fn num_channels(&self) -> usize {
        self.data.len()
    }

    pub fn num_samples(&self) -> usize {
        self.data.first().map_or(0, |ch| ch.len())
    }

    /// Transpose into `samples × channels` rows
    pub fn rows(&self) -> Vec<Vec<f64>> {
        (0..self.num_samples())
            .map(|s| self.data.iter().map(|ch| ch[s]).collect())
            .collect()
    }
}

pub trait AcquisitionSource: Send {
    fn describe(&self) -> String;

    fn channels(&self) -> usize;

    fn sample_rate(&self) -> f64;

    /// Everything that arrived since the previous poll; may be empty
    fn poll(&mut self) -> ModuleResult<SampleBlock>;

    fn stop(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Waveform {
    Zeros,
    Sine { frequency: f64, amplitude: f64 },
    Noise { amplitude: f64 },
}

/// How many samples a synthetic source returns per poll
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Pacing {
    /// A fixed count each poll, independent of wall time
    PerPoll { samples: usize },
    /// As many as the sample rate produced since the source was opened
    RealTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic {
        #[serde(default = "default_channels")]
        channels: usize,
        #[serde(default = "default_sample_rate")]
        sample_rate: f64,
        #[serde(default = "default_waveform")]
        waveform: Waveform,
        #[serde(default = "default_pacing")]
        pacing: Pacing,
        #[serde(default)]
        seed: Option<u64>,
        /// Emit a wrapping package counter with this modulus
        #[serde(default)]
        package_modulus: Option<u64>,
        /// Drop every n-th sample, for exercising continuity reporting
        #[serde(default)]
        drop_every: Option<u64>,
    },
    /// CSV recording, one row per sample
    Playback {
        path: PathBuf,
        #[serde(default = "default_sample_rate")]
        sample_rate: f64,
        /// Defaults to real-time pacing at `sample_rate`
        #[serde(default)]
        samples_per_poll: Option<usize>,
        #[serde(default)]
        looping: bool,
        #[serde(default = "default_true")]
        has_headers: bool,
        /// Column holding the hardware package counter
        #[serde(default)]
        package_column: Option<usize>,
    },
}

fn default_channels() -> usize {
    16
}

fn default_sample_rate() -> f64 {
    125.0
}

fn default_waveform() -> Waveform {
    Waveform::Zeros
}

fn default_pacing() -> Pacing {
    Pacing::RealTime
}

fn default_true() -> bool {
    true
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            waveform: default_waveform(),
            pacing: default_pacing(),
            seed: None,
            package_modulus: None,
            drop_every: None,
        }
    }
}

impl SourceConfig {
    /// Channel count known without opening the source
    pub fn declared_channels(&self) -> Option<usize> {
        match self {
            SourceConfig::Synthetic { channels, .. } => Some(*channels),
            SourceConfig::Playback { .. } => None,
        }
    }
}

pub fn open_source(config: &SourceConfig) -> ModuleResult<Box<dyn AcquisitionSource>> {
    match config {
        SourceConfig::Synthetic {
            channels,
            sample_rate,
            waveform,
            pacing,
            seed,
            package_modulus,
            drop_every,
        } => Ok(Box::new(SyntheticSource::new(
            *channels,
            *sample_rate,
            *waveform,
            *pacing,
            *seed,
            *package_modulus,
            *drop_every,
        )?)),
        SourceConfig::Playback {
            path,
            sample_rate,
            samples_per_poll,
            looping,
            has_headers,
            package_column,
        } => Ok(Box::new(PlaybackSource::open(
            path.clone(),
            *sample_rate,
            *samples_per_poll,
            *looping,
            *has_headers,
            *package_column,
        )?)),
    }
}

/// Wall-clock pacing: the number of samples due at `elapsed` seconds
struct Clock {
    started: Instant,
    sample_rate: f64,
}

impl Clock {
    fn due(&self) -> u64 {
        (self.started.elapsed().as_secs_f64() * self.sample_rate) as u64
    }
}

pub struct SyntheticSource {
    channels: usize,
    sample_rate: f64,
    waveform: Waveform,
    pacing: Pacing,
    rng: StdRng,
    package_modulus: Option<u64>,
    drop_every: Option<u64>,
    clock: Option<Clock>,
    /// Samples generated so far, including dropped ones
    generated: u64,
}

impl SyntheticSource {
    pub fn new(
        channels: usize,
        sample_rate: f64,
        waveform: Waveform,
        pacing: Pacing,
        seed: Option<u64>,
        package_modulus: Option<u64>,
        drop_every: Option<u64>,
    ) -> ModuleResult<Self> {
        if channels == 0 {
            return Err(ModuleError::InvalidParameter("synthetic source needs at least one channel".to_string()));
        }
        if !(sample_rate > 0.0) {
            return Err(ModuleError::InvalidParameter(format!(
                "sample_rate must be positive, got {}",
                sample_rate
            )));
        }
        if package_modulus == Some(0) || drop_every == Some(0) {
            return Err(ModuleError::InvalidParameter(
                "package_modulus and drop_every must be at least 1".to_string(),
            ));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            channels,
            sample_rate,
            waveform,
            pacing,
            rng,
            package_modulus,
            drop_every,
            clock: None,
            generated: 0,
        })
    }

    fn due(&mut self) -> u64 {
        match self.pacing {
            Pacing::PerPoll { samples } => samples as u64,
            Pacing::RealTime => {
                let clock = self.clock.get_or_insert_with(|| Clock {
                    started: Instant::now(),
                    sample_rate: self.sample_rate,
                });
                clock.due().saturating_sub(self.generated)
            }
        }
    }

    fn value(&mut self, channel: usize, index: u64) -> f64 {
        match self.waveform {
            Waveform::Zeros => 0.0,
            Waveform::Sine { frequency, amplitude } => {
                let t = index as f64 / self.sample_rate;
                let phase = channel as f64 * PI / 8.0;
                amplitude * (2.0 * PI * frequency * t + phase).sin()
            }
            Waveform::Noise { amplitude } => {
                if amplitude > 0.0 {
                    self.rng.random_range(-amplitude..amplitude)
                } else {
                    0.0
                }
            }
        }
    }
}

impl AcquisitionSource for SyntheticSource {
    fn describe(&self) -> String {
        format!(
            "synthetic {:?}, {} channels at {} Hz",
            self.waveform, self.channels, self.sample_rate
        )
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn poll(&mut self) -> ModuleResult<SampleBlock> {
        let due = self.due();
        let mut data = vec![Vec::with_capacity(due as usize); self.channels];
        let mut package = self.package_modulus.map(|_| Vec::with_capacity(due as usize));

        for _ in 0..due {
            let index = self.generated;
            self.generated += 1;
            if let Some(every) = self.drop_every {
                if self.generated % every == 0 {
                    continue;
                }
            }
            for (ch, column) in data.iter_mut().enumerate() {
                let v = self.value(ch, index);
                column.push(v);
            }
            if let (Some(package), Some(modulus)) = (package.as_mut(), self.package_modulus) {
                package.push(index % modulus);
            }
        }
        Ok(SampleBlock { data, package })
    }
}

pub struct PlaybackSource {
    path: PathBuf,
    rows: Vec<Vec<f64>>,
    package: Option<Vec<u64>>,
    channels: usize,
    sample_rate: f64,
    samples_per_poll: Option<usize>,
    looping: bool,
    clock: Option<Clock>,
    /// Samples handed out so far, across loops
    emitted: u64,
}

impl PlaybackSource {
    pub fn open(
        path: PathBuf,
        sample_rate: f64,
        samples_per_poll: Option<usize>,
        looping: bool,
        has_headers: bool,
        package_column: Option<usize>,
    ) -> ModuleResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(has_headers)
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| ModuleError::Source(format!("Failed to open {}: {}", path.display(), e)))?;

        let mut columns = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| ModuleError::Source(format!("{}: {}", path.display(), e)))?;
            let values = record
                .iter()
                .map(|field| field.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ModuleError::Source(format!("{} row {}: {}", path.display(), line + 1, e)))?;
            columns.push(values);
        }

        let width = columns.first().map_or(0, |r| r.len());
        if columns.iter().any(|r| r.len() != width) {
            return Err(ModuleError::Source(format!("{}: ragged rows", path.display())));
        }

        let (rows, package) = match package_column {
            Some(col) if col >= width => {
                return Err(ModuleError::InvalidParameter(format!(
                    "package_column {} out of range for {} columns",
                    col, width
                )))
            }
            Some(col) => {
                let package = columns.iter().map(|r| r[col].max(0.0) as u64).collect();
                let rows = columns
                    .into_iter()
                    .map(|mut r| {
                        r.remove(col);
                        r
                    })
                    .collect::<Vec<_>>();
                (rows, Some(package))
            }
            None => (columns, None),
        };

        let channels = rows.first().map_or(0, |r| r.len());
        if rows.is_empty() || channels == 0 {
            return Err(ModuleError::Source(format!("{} holds no samples", path.display())));
        }
        log::info!(
            "Playback {}: {} samples x {} channels{}",
            path.display(),
            rows.len(),
            channels,
            if looping { ", looping" } else { "" }
        );

        Ok(Self {
            path,
            rows,
            package,
            channels,
            sample_rate,
            samples_per_poll,
            looping,
            clock: None,
            emitted: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn due(&mut self) -> u64 {
        match self.samples_per_poll {
            Some(n) => n as u64,
            None => {
                let clock = self.clock.get_or_insert_with(|| Clock {
                    started: Instant::now(),
                    sample_rate: self.sample_rate,
                });
                clock.due().saturating_sub(self.emitted)
            }
        }
    }
}

impl AcquisitionSource for PlaybackSource {
    fn describe(&self) -> String {
        format!("playback {} ({} channels)", self.path.display(), self.channels)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn poll(&mut self) -> ModuleResult<SampleBlock> {
        let total = self.rows.len() as u64;
        let mut due = self.due();
        if !self.looping {
            due = due.min(total.saturating_sub(self.emitted));
        }

        let mut data = vec![Vec::with_capacity(due as usize); self.channels];
        let mut package = self.package.as_ref().map(|_| Vec::with_capacity(due as usize));
        for _ in 0..due {
            let at = (self.emitted % total) as usize;
            self.emitted += 1;
            for (column, &v) in data.iter_mut().zip(&self.rows[at]) {
                column.push(v);
            }
            if let (Some(out), Some(src)) = (package.as_mut(), self.package.as_ref()) {
                out.push(src[at]);
            }
        }
        Ok(SampleBlock { data, package })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_synthetic_per_poll_zeros() {
        let mut source =
            SyntheticSource::new(16, 125.0, Waveform::Zeros, Pacing::PerPoll { samples: 25 }, Some(1), None, None)
                .unwrap();
        let block = source.poll().unwrap();
        assert_eq!(block.num_channels(), 16);
        assert_eq!(block.num_samples(), 25);
        assert!(block.data.iter().flatten().all(|&v| v == 0.0));
        assert!(block.package.is_none());
    }

    #[test]
    fn test_transpose_to_rows() {
        let block = SampleBlock {
            data: vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]],
            package: None,
        };
        assert_eq!(
            block.rows(),
            vec![vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]]
        );
    }

    #[test]
    fn test_package_counter_wraps_and_drops() {
        let mut source = SyntheticSource::new(
            1,
            125.0,
            Waveform::Noise { amplitude: 1.0 },
            Pacing::PerPoll { samples: 10 },
            Some(7),
            Some(4),
            Some(5),
        )
        .unwrap();
        let block = source.poll().unwrap();
        // Samples 4 and 9 (1-based 5th and 10th) are dropped
        assert_eq!(block.package, Some(vec![0, 1, 2, 3, 1, 2, 3, 0]));
        assert_eq!(block.num_samples(), 8);
        assert!(block.data[0].iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn test_seeded_noise_repeats() {
        let make = || {
            SyntheticSource::new(2, 125.0, Waveform::Noise { amplitude: 5.0 }, Pacing::PerPoll { samples: 8 }, Some(3), None, None)
                .unwrap()
        };
        assert_eq!(make().poll().unwrap(), make().poll().unwrap());
    }

    #[test]
    fn test_invalid_synthetic_params() {
        assert!(SyntheticSource::new(0, 125.0, Waveform::Zeros, Pacing::RealTime, None, None, None).is_err());
        assert!(SyntheticSource::new(1, 0.0, Waveform::Zeros, Pacing::RealTime, None, None, None).is_err());
    }

    #[test]
    fn test_playback_reads_and_loops() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pkg,c1,c2").unwrap();
        writeln!(file, "0,1.0,2.0").unwrap();
        writeln!(file, "1,3.0,4.0").unwrap();
        writeln!(file, "2,5.0,6.0").unwrap();
        file.flush().unwrap();

        let mut source = PlaybackSource::open(file.path().to_path_buf(), 125.0, Some(2), true, true, Some(0)).unwrap();
        assert_eq!(source.channels(), 2);
        assert_eq!(source.len(), 3);

        let first = source.poll().unwrap();
        assert_eq!(first.data, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert_eq!(first.package, Some(vec![0, 1]));
        let second = source.poll().unwrap();
        assert_eq!(second.data, vec![vec![5.0, 1.0], vec![6.0, 2.0]]);
    }

    #[test]
    fn test_playback_stops_at_end_without_looping() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.0\n2.0\n3.0").unwrap();
        file.flush().unwrap();

        let mut source = PlaybackSource::open(file.path().to_path_buf(), 125.0, Some(2), false, false, None).unwrap();
        assert_eq!(source.poll().unwrap().num_samples(), 2);
        assert_eq!(source.poll().unwrap().num_samples(), 1);
        assert_eq!(source.poll().unwrap().num_samples(), 0);
    }

    #[test]
    fn test_source_config_from_yaml() {
        let config: SourceConfig = serde_yaml::from_str(
            "type: synthetic\nchannels: 4\nwaveform: { shape: sine, frequency: 10, amplitude: 2 }\npacing: { mode: per_poll, samples: 6 }",
        )
        .unwrap();
        assert_eq!(config.declared_channels(), Some(4));
        let mut source = open_source(&config).unwrap();
        assert_eq!(source.poll().unwrap().num_samples(), 6);
    }
}
