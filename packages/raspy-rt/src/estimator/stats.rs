//! Forgotten sufficient statistics and the rank-one maintained inverse.

use super::{ACTIVE, STATE_DIM};
use crate::error::NumericFault;
use nalgebra::{DMatrix, DVector};

/// Numeric guards applied to every accumulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guards {
    /// Rank-one denominators at or below this are treated as singular
    pub singular_epsilon: f64,
    /// Largest allowed diagonal entry of the maintained inverse
    pub windup_limit: f64,
}

impl Default for Guards {
    fn default() -> Self {
        Self {
            singular_epsilon: 1e-12,
            windup_limit: 1e12,
        }
    }
}

/// `R = Σ λ z zᵀ`, `S = Σ λ x zᵀ`, `T = Σ λ x xᵀ` plus the effective sample
/// count and `T[a,a]⁻¹` over the active (velocity and bias) states.
#[derive(Debug, Clone, PartialEq)]
pub struct SufficientStats {
    pub(crate) r: DMatrix<f64>,
    pub(crate) s: DMatrix<f64>,
    pub(crate) t: DMatrix<f64>,
    pub(crate) ess: f64,
    t_active_inv: DMatrix<f64>,
    lambda: f64,
}

fn active_block(t: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(ACTIVE.len(), ACTIVE.len(), |i, j| t[(ACTIVE[i], ACTIVE[j])])
}

fn invert_spd(m: DMatrix<f64>) -> Result<DMatrix<f64>, NumericFault> {
    m.cholesky()
        .map(|c| c.inverse())
        .ok_or(NumericFault::IndefiniteAccumulator)
}

fn check_finite(m: &DMatrix<f64>, what: &'static str) -> Result<(), NumericFault> {
    if m.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(NumericFault::NonFinite(what))
    }
}

impl SufficientStats {
    /// Build from explicit accumulators; `T[a,a]` must be positive definite.
    pub fn from_parts(
        r: DMatrix<f64>,
        s: DMatrix<f64>,
        t: DMatrix<f64>,
        ess: f64,
        lambda: f64,
    ) -> Result<Self, NumericFault> {
        check_finite(&r, "R")?;
        check_finite(&s, "S")?;
        check_finite(&t, "T")?;
        let t_active_inv = invert_spd(active_block(&t))?;
        Ok(Self {
            r,
            s,
            t,
            ess,
            t_active_inv,
            lambda,
        })
    }

    /// Statistics worth `weight` pseudo-observations whose refit reproduces
    /// the observation model `(c, q)`.
    pub fn seeded(c: &DMatrix<f64>, q: &DMatrix<f64>, weight: f64, lambda: f64) -> Result<Self, NumericFault> {
        let mut c = c.clone();
        for col in 0..STATE_DIM {
            if !ACTIVE.contains(&col) {
                c.column_mut(col).fill(0.0);
            }
        }
        let t = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM) * weight;
        let s = &t * c.transpose();
        let r = &c * &t * c.transpose() + q * weight;
        Self::from_parts(r, s, t, weight, lambda)
    }

    pub fn obs_dim(&self) -> usize {
        self.r.nrows()
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn ess(&self) -> f64 {
        self.ess
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn s(&self) -> &DMatrix<f64> {
        &self.s
    }

    pub fn t(&self) -> &DMatrix<f64> {
        &self.t
    }

    pub fn active_inverse(&self) -> &DMatrix<f64> {
        &self.t_active_inv
    }

    /// Forget, then add one `(x, z)` pair. `self` is left unchanged on error.
    pub fn accumulate(&mut self, x: &DVector<f64>, z: &DVector<f64>, guards: &Guards) -> Result<(), NumericFault> {
        if !x.iter().chain(z.iter()).all(|v| v.is_finite()) {
            return Err(NumericFault::NonFinite("observation pair"));
        }
        let u = DVector::from_fn(ACTIVE.len(), |i, _| x[ACTIVE[i]]);
        let inv = self.rank_one_inverse(&u, guards)?;

        let lambda = self.lambda;
        self.r = &self.r * lambda + z * z.transpose();
        self.s = &self.s * lambda + x * z.transpose();
        self.t = &self.t * lambda + x * x.transpose();
        self.ess = lambda * self.ess + 1.0;
        self.t_active_inv = inv;
        Ok(())
    }

    /// Sherman–Morrison on `(λT + u uᵀ)⁻¹` from the maintained `T⁻¹`
    fn rank_one_inverse(&self, u: &DVector<f64>, guards: &Guards) -> Result<DMatrix<f64>, NumericFault> {
        let b = &self.t_active_inv / self.lambda;
        let bu = &b * u;
        let d = 1.0 + u.dot(&bu);
        if !d.is_finite() || d <= guards.singular_epsilon {
            return Err(NumericFault::SingularUpdate { denominator: d });
        }
        let inv = b - (&bu * bu.transpose()) / d;
        check_finite(&inv, "inverse accumulator")?;
        let max_diagonal = inv.diagonal().iter().fold(0.0f64, |m, v| m.max(v.abs()));
        if max_diagonal > guards.windup_limit {
            return Err(NumericFault::InverseWindup { max_diagonal });
        }
        Ok(inv)
    }

    /// Re-invert `T[a,a]` from scratch to drop accumulated rounding drift
    pub fn refresh_inverse(&mut self) -> Result<(), NumericFault> {
        self.t_active_inv = invert_spd(active_block(&self.t))?;
        Ok(())
    }

    /// Observation model from the statistics: `C[:, a] = S[a,:]ᵀ T[a,a]⁻¹`
    /// with position columns zero, `Q = (R − C S) / ess` symmetrized and
    /// floored on the diagonal.
    pub fn refit(&self, q_floor: f64) -> Result<(DMatrix<f64>, DMatrix<f64>), NumericFault> {
        let m = self.obs_dim();
        let s_active = DMatrix::from_fn(ACTIVE.len(), m, |i, j| self.s[(ACTIVE[i], j)]);
        let c_active = s_active.transpose() * &self.t_active_inv;

        let mut c = DMatrix::zeros(m, STATE_DIM);
        for (k, &col) in ACTIVE.iter().enumerate() {
            c.set_column(col, &c_active.column(k));
        }

        let ess = self.ess.max(1.0);
        let raw = (&self.r - &c * &self.s) / ess;
        let mut q = (&raw + raw.transpose()) * 0.5;
        for i in 0..m {
            if q[(i, i)] < q_floor {
                q[(i, i)] = q_floor;
            }
        }
        check_finite(&c, "C")?;
        check_finite(&q, "Q")?;
        Ok((c, q))
    }
}
