//! Intention estimation for closed-loop adaptation.
//!
//! The decoder's training state is its own decoded state with the velocity
//! re-aimed at the current target. Decoded speed is kept (floored at
//! `min_speed`), so the user's effort level is preserved while the
//! direction is assumed to be correct.

use super::{BIAS, STATE_DIM};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentionConfig {
    pub min_speed: f64,
    /// Inside this distance of the target the intended velocity is zero
    pub hold_radius: f64,
}

impl Default for IntentionConfig {
    fn default() -> Self {
        Self {
            min_speed: 0.1,
            hold_radius: 0.05,
        }
    }
}

/// Planar velocity encoded by the four directional components
pub fn planar_velocity(x: &DVector<f64>) -> (f64, f64) {
    (x[2] - x[3], x[4] - x[5])
}

/// Split a planar velocity into `[right, left, up, down]`
pub fn directional(vx: f64, vy: f64) -> [f64; 4] {
    [vx.max(0.0), (-vx).max(0.0), vy.max(0.0), (-vy).max(0.0)]
}

pub fn intended_state(decoded: &DVector<f64>, target: [f64; 2], config: &IntentionConfig) -> DVector<f64> {
    let (vx, vy) = planar_velocity(decoded);
    let speed = vx.hypot(vy).max(config.min_speed);

    let dx = target[0] - decoded[0];
    let dy = target[1] - decoded[1];
    let distance = dx.hypot(dy);

    let (ix, iy) = if distance <= config.hold_radius {
        (0.0, 0.0)
    } else {
        (speed * dx / distance, speed * dy / distance)
    };

    let mut x = DVector::zeros(STATE_DIM);
    x[0] = decoded[0];
    x[1] = decoded[1];
    for (i, v) in directional(ix, iy).into_iter().enumerate() {
        x[2 + i] = v;
    }
    x[BIAS] = 1.0;
    x
}
