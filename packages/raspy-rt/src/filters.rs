//! IIR filters as cascaded second-order sections.
//!
//! Butterworth low/high/band-pass and notch designs via the bilinear
//! transform. Sections run in Direct Form II Transposed and can be primed to
//! the steady state of a constant input so the first samples of a session do
//! not ring.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
}

/// One stage of a filter chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStage {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    /// Cutoff (low/high-pass), low edge (band-pass) or center (notch), Hz
    pub frequency: f64,
    /// High edge of a band-pass, Hz
    #[serde(default)]
    pub frequency_high: Option<f64>,
    #[serde(default = "default_order")]
    pub order: usize,
    /// Quality factor of a notch
    #[serde(default = "default_q")]
    pub q: f64,
}

fn default_order() -> usize {
    4
}

fn default_q() -> f64 {
    30.0
}

impl FilterStage {
    pub fn notch(frequency: f64, q: f64) -> Self {
        Self {
            filter_type: FilterType::Notch,
            frequency,
            frequency_high: None,
            order: default_order(),
            q,
        }
    }

    pub fn lowpass(frequency: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::Lowpass,
            frequency,
            frequency_high: None,
            order,
            q: default_q(),
        }
    }

    pub fn highpass(frequency: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::Highpass,
            frequency,
            frequency_high: None,
            order,
            q: default_q(),
        }
    }
}

/// Chain used when none is configured: mains notches at 60 Hz, a 40 Hz
/// low-pass and a 4 Hz high-pass.
pub fn default_chain() -> Vec<FilterStage> {
    vec![
        FilterStage::notch(60.0, 10.0),
        FilterStage::notch(60.0, 4.0),
        FilterStage::lowpass(40.0, 4),
        FilterStage::highpass(4.0, 5),
    ]
}

/// `H(z) = (b0 + b1 z^-1 + b2 z^-2) / (1 + a1 z^-1 + a2 z^-2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Gain at z = 1
    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }
}

#[derive(Debug, Clone)]
struct Biquad {
    c: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl Biquad {
    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.c.b0 * x + self.z1;
        self.z1 = self.c.b1 * x - self.c.a1 * y + self.z2;
        self.z2 = self.c.b2 * x - self.c.a2 * y;
        y
    }

    /// Set the state a constant input `x` would settle into; returns the
    /// steady-state output.
    fn prime(&mut self, x: f64) -> f64 {
        let y = self.c.dc_gain() * x;
        self.z1 = y - self.c.b0 * x;
        self.z2 = self.c.b2 * x - self.c.a2 * y;
        y
    }
}

/// Cascade of biquad sections for one channel
#[derive(Debug, Clone)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

impl SosFilter {
    pub fn new(sections: Vec<BiquadCoeffs>) -> Self {
        Self {
            sections: sections
                .into_iter()
                .map(|c| Biquad { c, z1: 0.0, z2: 0.0 })
                .collect(),
        }
    }

    pub fn chain(filters: impl IntoIterator<Item = SosFilter>) -> Self {
        Self {
            sections: filters.into_iter().flat_map(|f| f.sections).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn coeffs(&self) -> Vec<BiquadCoeffs> {
        self.sections.iter().map(|s| s.c).collect()
    }

    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        self.sections.iter_mut().fold(input, |x, s| s.process(x))
    }

    pub fn filter(&mut self, signal: &[f64]) -> Vec<f64> {
        signal.iter().map(|&s| self.process(s)).collect()
    }

    pub fn prime(&mut self, input: f64) {
        self.sections.iter_mut().fold(input, |x, s| s.prime(x));
    }

    pub fn reset(&mut self) {
        for s in &mut self.sections {
            s.z1 = 0.0;
            s.z2 = 0.0;
        }
    }
}

pub struct Butterworth;

impl Butterworth {
    pub fn lowpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        SosFilter::new(Self::sections(Self::prewarp(cutoff, sample_rate), order, false))
    }

    pub fn highpass(cutoff: f64, sample_rate: f64, order: usize) -> SosFilter {
        SosFilter::new(Self::sections(Self::prewarp(cutoff, sample_rate), order, true))
    }

    pub fn bandpass(low: f64, high: f64, sample_rate: f64, order: usize) -> SosFilter {
        SosFilter::chain([
            Self::highpass(low, sample_rate, order),
            Self::lowpass(high, sample_rate, order),
        ])
    }

    fn prewarp(freq: f64, sample_rate: f64) -> f64 {
        (PI * freq / sample_rate).tan()
    }

    /// Pole pairs of the analog prototype `s^2 + 2 sin(theta) s + 1`, mapped
    /// through the bilinear transform. Odd orders end with a real pole.
    fn sections(wn: f64, order: usize, highpass: bool) -> Vec<BiquadCoeffs> {
        let pairs = (order + 1) / 2;
        let wn2 = wn * wn;
        (0..pairs)
            .map(|k| {
                if order % 2 == 1 && k == pairs - 1 {
                    let a1 = (wn - 1.0) / (wn + 1.0);
                    let g = if highpass { 1.0 / (1.0 + wn) } else { wn / (1.0 + wn) };
                    let b1 = if highpass { -g } else { g };
                    return BiquadCoeffs {
                        b0: g,
                        b1,
                        b2: 0.0,
                        a1,
                        a2: 0.0,
                    };
                }
                let theta = PI * (2 * k + 1) as f64 / (2 * order) as f64;
                let damping = 2.0 * theta.sin();
                let denom = 1.0 + damping * wn + wn2;
                let a1 = 2.0 * (wn2 - 1.0) / denom;
                let a2 = (1.0 - damping * wn + wn2) / denom;
                let (b0, b1, b2) = if highpass {
                    (1.0 / denom, -2.0 / denom, 1.0 / denom)
                } else {
                    (wn2 / denom, 2.0 * wn2 / denom, wn2 / denom)
                };
                BiquadCoeffs { b0, b1, b2, a1, a2 }
            })
            .collect()
    }
}

/// Second-order notch with -3 dB bandwidth `center / q`
pub fn notch(center: f64, sample_rate: f64, q: f64) -> SosFilter {
    let w0 = 2.0 * PI * center / sample_rate;
    let bw = w0 / q;
    let beta = (bw / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);
    let cos_w0 = w0.cos();
    SosFilter::new(vec![BiquadCoeffs {
        b0: gain,
        b1: -2.0 * gain * cos_w0,
        b2: gain,
        a1: -2.0 * gain * cos_w0,
        a2: 2.0 * gain - 1.0,
    }])
}

/// Build one stage, checking its frequencies against Nyquist
pub fn design(stage: &FilterStage, sample_rate: f64) -> Result<SosFilter, String> {
    let nyquist = sample_rate / 2.0;
    let below_nyquist = |f: f64, what: &str| {
        if f <= 0.0 || f >= nyquist {
            Err(format!("{} ({} Hz) must lie in (0, {}) Hz", what, f, nyquist))
        } else {
            Ok(())
        }
    };
    if stage.order == 0 {
        return Err("filter order must be at least 1".to_string());
    }

    match stage.filter_type {
        FilterType::Lowpass => {
            below_nyquist(stage.frequency, "Low-pass cutoff")?;
            Ok(Butterworth::lowpass(stage.frequency, sample_rate, stage.order))
        }
        FilterType::Highpass => {
            below_nyquist(stage.frequency, "High-pass cutoff")?;
            Ok(Butterworth::highpass(stage.frequency, sample_rate, stage.order))
        }
        FilterType::Bandpass => {
            let high = stage
                .frequency_high
                .ok_or("band-pass filter requires frequency_high")?;
            below_nyquist(stage.frequency, "Band-pass low edge")?;
            below_nyquist(high, "Band-pass high edge")?;
            if stage.frequency >= high {
                return Err("band-pass low edge must be below the high edge".to_string());
            }
            Ok(Butterworth::bandpass(stage.frequency, high, sample_rate, stage.order))
        }
        FilterType::Notch => {
            below_nyquist(stage.frequency, "Notch frequency")?;
            if stage.q <= 0.0 {
                return Err(format!("notch Q must be positive, got {}", stage.q));
            }
            Ok(notch(stage.frequency, sample_rate, stage.q))
        }
    }
}

/// Build a whole chain as one cascade
pub fn design_chain(stages: &[FilterStage], sample_rate: f64) -> Result<SosFilter, String> {
    let filters = stages
        .iter()
        .map(|s| design(s, sample_rate))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SosFilter::chain(filters))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(x: &[f64]) -> f64 {
        (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
    }

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / fs).sin()).collect()
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let mut lp = Butterworth::lowpass(40.0, 125.0, 4);
        let out: Vec<f64> = (0..500).map(|_| lp.process(1.0)).collect();
        assert!((out[499] - 1.0).abs() < 1e-6);
        for c in lp.coeffs() {
            assert!(c.a2.abs() < 1.0, "unstable section {:?}", c);
        }
    }

    #[test]
    fn test_highpass_blocks_dc_and_passes_band() {
        let mut hp = Butterworth::highpass(4.0, 125.0, 5);
        let out: Vec<f64> = (0..2000).map(|_| hp.process(1.0)).collect();
        assert!(out[1999].abs() < 1e-3);

        let mut hp = Butterworth::highpass(4.0, 125.0, 5);
        let tone = sine(20.0, 125.0, 2000);
        let filtered = hp.filter(&tone);
        assert!(rms(&filtered[1000..]) > 0.6);
    }

    #[test]
    fn test_lowpass_attenuates_above_cutoff() {
        let mut lp = Butterworth::lowpass(10.0, 250.0, 4);
        let filtered = lp.filter(&sine(60.0, 250.0, 2000));
        assert!(rms(&filtered[1000..]) < 0.05);
    }

    #[test]
    fn test_notch_removes_mains() {
        let fs = 125.0;
        let mut filter = notch(60.0, fs, 10.0);
        let tone = sine(60.0, fs, 2000);
        let filtered = filter.filter(&tone);
        assert!(rms(&filtered[500..]) < 0.1 * rms(&tone));
    }

    #[test]
    fn test_default_chain_primed_on_constant_input() {
        let mut chain = design_chain(&default_chain(), 125.0).unwrap();
        assert_eq!(chain.len(), 1 + 1 + 2 + 3);
        chain.prime(5.0);
        // Primed to steady state: a constant input produces no transient.
        for _ in 0..50 {
            assert!(chain.process(5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_design_rejects_bad_frequencies() {
        assert!(design(&FilterStage::lowpass(70.0, 4), 125.0).is_err());
        assert!(design(&FilterStage::notch(60.0, 0.0), 125.0).is_err());
        let band = FilterStage {
            filter_type: FilterType::Bandpass,
            frequency: 30.0,
            frequency_high: Some(10.0),
            order: 2,
            q: 30.0,
        };
        assert!(design(&band, 125.0).is_err());
    }

    #[test]
    fn test_stage_yaml() {
        let stage: FilterStage = serde_yaml::from_str("type: notch\nfrequency: 60\nq: 4").unwrap();
        assert_eq!(stage, FilterStage::notch(60.0, 4.0));
    }
}
