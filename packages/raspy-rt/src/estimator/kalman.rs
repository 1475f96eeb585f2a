//! Fixed cursor dynamics and the steady-state Kalman gain.

use super::{BIAS, STATE_DIM};
use crate::error::NumericFault;
use nalgebra::DMatrix;

/// State transition `A` and process noise `W`
#[derive(Debug, Clone, PartialEq)]
pub struct Dynamics {
    pub a: DMatrix<f64>,
    pub w: DMatrix<f64>,
}

impl Dynamics {
    /// Positions integrate signed velocity over `dt`, velocities decay by
    /// `velocity_decay`, bias is constant. Noise only enters the velocities.
    pub fn cursor(dt: f64, velocity_decay: f64, velocity_noise: f64) -> Self {
        let mut a = DMatrix::zeros(STATE_DIM, STATE_DIM);
        a[(0, 0)] = 1.0;
        a[(1, 1)] = 1.0;
        // px += dt (v_right - v_left), py += dt (v_up - v_down)
        a[(0, 2)] = dt;
        a[(0, 3)] = -dt;
        a[(1, 4)] = dt;
        a[(1, 5)] = -dt;
        for v in 2..6 {
            a[(v, v)] = velocity_decay;
        }
        a[(BIAS, BIAS)] = 1.0;

        let mut w = DMatrix::zeros(STATE_DIM, STATE_DIM);
        for v in 2..6 {
            w[(v, v)] = velocity_noise;
        }
        Self { a, w }
    }
}

/// Result of iterating the discrete Riccati recursion
#[derive(Debug, Clone, PartialEq)]
pub struct SteadyStateGain {
    /// `(I − K C) A`
    pub m1: DMatrix<f64>,
    /// `K`
    pub m2: DMatrix<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// `max |K − K_prev|` at the last iteration
    pub residual: f64,
}

/// Iterate `P⁻ = A P Aᵀ + W`, `K = P⁻Cᵀ(C P⁻ Cᵀ + Q)⁻¹`, `P = (I − K C) P⁻`
/// until `K` stops moving by more than `tolerance`, or `max_iterations`.
pub fn steady_state_gain(
    dynamics: &Dynamics,
    c: &DMatrix<f64>,
    q: &DMatrix<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<SteadyStateGain, NumericFault> {
    let n = STATE_DIM;
    let identity = DMatrix::<f64>::identity(n, n);
    let mut p = dynamics.w.clone();
    let mut k = DMatrix::zeros(n, c.nrows());
    let mut residual = f64::INFINITY;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        let p_prior = &dynamics.a * &p * dynamics.a.transpose() + &dynamics.w;
        let innovation = c * &p_prior * c.transpose() + q;
        let innovation_inv = innovation
            .cholesky()
            .map(|ch| ch.inverse())
            .ok_or(NumericFault::SingularInnovation)?;
        let next = &p_prior * c.transpose() * innovation_inv;
        if !next.iter().all(|v| v.is_finite()) {
            return Err(NumericFault::NonFinite("Kalman gain"));
        }
        p = (&identity - &next * c) * p_prior;
        residual = (&next - &k).abs().max();
        k = next;
        if residual < tolerance {
            break;
        }
    }

    let m1 = (&identity - &k * c) * &dynamics.a;
    Ok(SteadyStateGain {
        m1,
        m2: k,
        iterations,
        converged: residual < tolerance,
        residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn observation(m: usize) -> DMatrix<f64> {
        DMatrix::from_fn(m, STATE_DIM, |i, j| {
            if (2..6).contains(&j) {
                ((i + j) % 3) as f64 - 1.0 + 0.1 * i as f64
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_cursor_dynamics_integrate_velocity() {
        let dynamics = Dynamics::cursor(0.05, 0.9, 1e-3);
        let x = DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 1.0]);
        let next = &dynamics.a * x;
        assert!((next[0] - 0.05).abs() < 1e-12);
        assert!((next[1] + 0.1).abs() < 1e-12);
        assert!((next[2] - 0.9).abs() < 1e-12);
        assert_eq!(next[6], 1.0);
    }

    #[test]
    fn test_gain_converges() {
        let dynamics = Dynamics::cursor(0.05, 0.8, 1e-2);
        let c = observation(4);
        let q = DMatrix::identity(4, 4);
        let gain = steady_state_gain(&dynamics, &c, &q, 1e-10, 5000).unwrap();
        assert!(gain.converged);
        assert_eq!(gain.m1.shape(), (STATE_DIM, STATE_DIM));
        assert_eq!(gain.m2.shape(), (STATE_DIM, 4));
        // Bias carries no process noise, so it never picks up gain.
        assert!(gain.m2.row(6).iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_iteration_bound_reported() {
        let dynamics = Dynamics::cursor(0.05, 0.8, 1e-2);
        let gain = steady_state_gain(&dynamics, &observation(3), &DMatrix::identity(3, 3), 0.0, 3).unwrap();
        assert_eq!(gain.iterations, 3);
        assert!(!gain.converged);
    }

    #[test]
    fn test_singular_innovation() {
        let dynamics = Dynamics::cursor(0.05, 0.8, 0.0);
        let c = DMatrix::zeros(2, STATE_DIM);
        let q = DMatrix::zeros(2, 2);
        assert_eq!(
            steady_state_gain(&dynamics, &c, &q, 1e-9, 10).unwrap_err(),
            NumericFault::SingularInnovation
        );
    }
}
