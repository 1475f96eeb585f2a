//! Adaptive Kalman decoder (closed-loop decoder adaptation).
//!
//! State layout: `[px, py, v_right, v_left, v_up, v_down, 1]`.
//!
//! Every tick the decoder runs the steady-state form `x' = M1 x + M2 z`.
//! Every `adapt_every` ticks the `(intended state, observation)` pairs
//! collected since the last adaptation are folded into the forgotten
//! sufficient statistics, the observation model is refit and M1/M2 are
//! recomputed. An adaptation works on a copy of the statistics and only
//! replaces the live state when every stage succeeded.

pub mod checkpoint;
pub mod clda;
pub mod kalman;
pub mod stats;

pub use checkpoint::{Checkpoint, Prior};
pub use clda::{intended_state, IntentionConfig};
pub use kalman::{steady_state_gain, Dynamics, SteadyStateGain};
pub use stats::{Guards, SufficientStats};

use crate::error::{EstimatorError, EstimatorResult, NumericFault};
use checkpoint::{from_rows, to_rows};
use chrono::Utc;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

pub const STATE_DIM: usize = 7;
/// Index of the constant bias state
pub const BIAS: usize = 6;
/// States the observation model may load on: velocities and bias
pub const ACTIVE: [usize; 5] = [2, 3, 4, 5, 6];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Forgetting factor in (0, 1]
    pub lambda: f64,
    /// Ticks between adaptations
    pub adapt_every: u64,
    /// Seconds per tick
    pub dt: f64,
    pub velocity_decay: f64,
    pub velocity_noise: f64,
    /// Minimum diagonal of the refit observation noise
    pub q_floor: f64,
    pub gain_tolerance: f64,
    pub gain_max_iterations: usize,
    /// Adaptations between full re-inversions of the state accumulator
    pub refresh_every: u64,
    /// Pseudo-observations the `{c, q}` prior is worth
    pub prior_weight: f64,
    pub singular_epsilon: f64,
    pub windup_limit: f64,
    pub intention: IntentionConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            lambda: 0.99,
            adapt_every: 20,
            dt: 0.05,
            velocity_decay: 0.9,
            velocity_noise: 1e-2,
            q_floor: 1e-6,
            gain_tolerance: 1e-9,
            gain_max_iterations: 2000,
            refresh_every: 50,
            prior_weight: 100.0,
            singular_epsilon: 1e-12,
            windup_limit: 1e12,
            intention: IntentionConfig::default(),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> EstimatorResult<()> {
        if !(self.lambda > 0.0 && self.lambda <= 1.0) {
            return Err(EstimatorError::InvalidParameter(format!(
                "lambda must lie in (0, 1], got {}",
                self.lambda
            )));
        }
        if self.adapt_every == 0 {
            return Err(EstimatorError::InvalidParameter("adapt_every must be at least 1".to_string()));
        }
        if self.gain_max_iterations == 0 {
            return Err(EstimatorError::InvalidParameter(
                "gain_max_iterations must be at least 1".to_string(),
            ));
        }
        if self.prior_weight <= 0.0 {
            return Err(EstimatorError::InvalidParameter("prior_weight must be positive".to_string()));
        }
        Ok(())
    }

    fn guards(&self) -> Guards {
        Guards {
            singular_epsilon: self.singular_epsilon,
            windup_limit: self.windup_limit,
        }
    }
}

/// Outcome of a committed adaptation
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptReport {
    pub pairs: usize,
    pub gain_iterations: usize,
    pub converged: bool,
    pub residual: f64,
}

/// What happened during one [`Estimator::step`]
#[derive(Debug, Clone, PartialEq)]
pub enum Adaptation {
    None,
    Committed(AdaptReport),
    Skipped(NumericFault),
}

pub struct Estimator {
    config: EstimatorConfig,
    dynamics: Dynamics,
    stats: SufficientStats,
    c: DMatrix<f64>,
    q: DMatrix<f64>,
    m1: DMatrix<f64>,
    m2: DMatrix<f64>,
    x: DVector<f64>,
    pending: Vec<(DVector<f64>, DVector<f64>)>,
    ticks: u64,
    adaptations: u64,
    skipped: u64,
}

impl Estimator {
    pub fn new(config: EstimatorConfig, prior: &Prior) -> EstimatorResult<Self> {
        config.validate()?;
        let m = prior.obs_dim();
        if m == 0 {
            return Err(EstimatorError::InvalidParameter("prior has no observation rows".to_string()));
        }

        let stats = match prior {
            Prior::Model { c, q } => SufficientStats::seeded(
                &from_rows(c, "C", (m, STATE_DIM))?,
                &from_rows(q, "Q", (m, m))?,
                config.prior_weight,
                config.lambda,
            )?,
            Prior::Statistics { r, s, t, ess } => SufficientStats::from_parts(
                from_rows(r, "R", (m, m))?,
                from_rows(s, "S", (STATE_DIM, m))?,
                from_rows(t, "T", (STATE_DIM, STATE_DIM))?,
                *ess,
                config.lambda,
            )?,
        };

        let dynamics = Dynamics::cursor(config.dt, config.velocity_decay, config.velocity_noise);
        let (c, q) = stats.refit(config.q_floor)?;
        let gain = steady_state_gain(&dynamics, &c, &q, config.gain_tolerance, config.gain_max_iterations)?;
        if !gain.converged {
            log::warn!(
                "Initial gain not converged after {} iterations (residual {:e})",
                gain.iterations,
                gain.residual
            );
        }

        let mut x = DVector::zeros(STATE_DIM);
        x[BIAS] = 1.0;

        log::info!(
            "Estimator ready: {} observations, lambda {}, adapting every {} ticks",
            m,
            config.lambda,
            config.adapt_every
        );

        Ok(Self {
            config,
            dynamics,
            stats,
            c,
            q,
            m1: gain.m1,
            m2: gain.m2,
            x,
            pending: Vec::new(),
            ticks: 0,
            adaptations: 0,
            skipped: 0,
        })
    }

    /// Default prior: no observation loading, unit noise
    pub fn uninformed_prior(obs_dim: usize) -> Prior {
        Prior::Model {
            c: vec![vec![0.0; STATE_DIM]; obs_dim],
            q: to_rows(&DMatrix::identity(obs_dim, obs_dim)),
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn obs_dim(&self) -> usize {
        self.c.nrows()
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn position(&self) -> [f64; 2] {
        [self.x[0], self.x[1]]
    }

    pub fn m1(&self) -> &DMatrix<f64> {
        &self.m1
    }

    pub fn m2(&self) -> &DMatrix<f64> {
        &self.m2
    }

    pub fn c(&self) -> &DMatrix<f64> {
        &self.c
    }

    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub fn stats(&self) -> &SufficientStats {
        &self.stats
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn adaptations(&self) -> u64 {
        self.adaptations
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn observation(&self, z: &[f64]) -> EstimatorResult<DVector<f64>> {
        if z.len() != self.obs_dim() {
            return Err(EstimatorError::Dimension {
                what: "observation",
                expected: self.obs_dim().to_string(),
                found: z.len().to_string(),
            });
        }
        Ok(DVector::from_column_slice(z))
    }

    /// `x' = M1 x + M2 z`
    pub fn decode(&mut self, z: &[f64]) -> EstimatorResult<&DVector<f64>> {
        let z = self.observation(z)?;
        let mut next = &self.m1 * &self.x + &self.m2 * z;
        if !next.iter().all(|v| v.is_finite()) {
            return Err(NumericFault::NonFinite("decoded state").into());
        }
        next[BIAS] = 1.0;
        self.x = next;
        Ok(&self.x)
    }

    /// Queue a training pair for the next adaptation
    pub fn observe(&mut self, intended: DVector<f64>, z: &[f64]) -> EstimatorResult<()> {
        let z = self.observation(z)?;
        self.pending.push((intended, z));
        Ok(())
    }

    /// Fold the pending pairs in and recompute M1/M2. On a numeric fault the
    /// previous model stays in force. Pending pairs are consumed either way.
    pub fn adapt(&mut self) -> Result<AdaptReport, NumericFault> {
        let pairs = std::mem::take(&mut self.pending);
        let result = self.candidate(&pairs);

        match result {
            Ok((candidate, c, q, gain)) => {
                self.stats = candidate;
                self.c = c;
                self.q = q;
                self.m1 = gain.m1;
                self.m2 = gain.m2;
                self.adaptations += 1;
                log::debug!(
                    "Adaptation {} committed: {} pairs, gain after {} iterations",
                    self.adaptations,
                    pairs.len(),
                    gain.iterations
                );
                Ok(AdaptReport {
                    pairs: pairs.len(),
                    gain_iterations: gain.iterations,
                    converged: gain.converged,
                    residual: gain.residual,
                })
            }
            Err(fault) => {
                self.skipped += 1;
                Err(fault)
            }
        }
    }

    fn candidate(
        &self,
        pairs: &[(DVector<f64>, DVector<f64>)],
    ) -> Result<(SufficientStats, DMatrix<f64>, DMatrix<f64>, SteadyStateGain), NumericFault> {
        let guards = self.config.guards();
        let mut candidate = self.stats.clone();
        for (x, z) in pairs {
            candidate.accumulate(x, z, &guards)?;
        }
        if (self.adaptations + 1) % self.config.refresh_every.max(1) == 0 {
            candidate.refresh_inverse()?;
        }
        let (c, q) = candidate.refit(self.config.q_floor)?;
        let gain = steady_state_gain(
            &self.dynamics,
            &c,
            &q,
            self.config.gain_tolerance,
            self.config.gain_max_iterations,
        )?;
        Ok((candidate, c, q, gain))
    }

    /// One tick: decode, collect a training pair when a target is known, and
    /// adapt when the interval elapsed.
    pub fn step(&mut self, z: &[f64], target: Option<[f64; 2]>) -> EstimatorResult<Adaptation> {
        self.decode(z)?;
        self.ticks += 1;

        if let Some(target) = target {
            let intended = intended_state(&self.x, target, &self.config.intention);
            self.observe(intended, z)?;
        }

        if self.ticks % self.config.adapt_every != 0 || self.pending.is_empty() {
            return Ok(Adaptation::None);
        }
        Ok(match self.adapt() {
            Ok(report) => Adaptation::Committed(report),
            Err(fault) => Adaptation::Skipped(fault),
        })
    }

    pub fn checkpoint(&self, session: &str, label: &str) -> Checkpoint {
        Checkpoint {
            session: session.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
            obs_dim: self.obs_dim(),
            lambda: self.config.lambda,
            c: to_rows(&self.c),
            q: to_rows(&self.q),
            m1: to_rows(&self.m1),
            m2: to_rows(&self.m2),
            r: to_rows(self.stats.r()),
            s: to_rows(self.stats.s()),
            t: to_rows(self.stats.t()),
            ess: self.stats.ess(),
            ticks: self.ticks,
            adaptations: self.adaptations,
            skipped_adaptations: self.skipped,
        }
    }
}
