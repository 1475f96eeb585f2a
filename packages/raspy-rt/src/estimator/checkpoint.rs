//! JSON artifacts: the offline prior and the initial/final checkpoints.

use crate::error::{EstimatorError, EstimatorResult};
use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Row-major matrix as it appears in JSON
pub type Rows = Vec<Vec<f64>>;

pub fn to_rows(m: &DMatrix<f64>) -> Rows {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

pub fn from_rows(rows: &Rows, what: &'static str, shape: (usize, usize)) -> EstimatorResult<DMatrix<f64>> {
    let found = (rows.len(), rows.first().map_or(0, |r| r.len()));
    if found != shape || rows.iter().any(|r| r.len() != shape.1) {
        return Err(EstimatorError::Dimension {
            what,
            expected: format!("{}x{}", shape.0, shape.1),
            found: format!("{}x{}", found.0, found.1),
        });
    }
    Ok(DMatrix::from_fn(shape.0, shape.1, |i, j| rows[i][j]))
}

/// Offline prior. Either an observation model, seeded into the statistics
/// with a pseudo-count, or the statistics themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prior {
    Statistics { r: Rows, s: Rows, t: Rows, ess: f64 },
    Model { c: Rows, q: Rows },
}

impl Prior {
    pub fn load(path: &Path) -> EstimatorResult<Self> {
        let text = fs::read_to_string(path)?;
        let prior = serde_json::from_str(&text)?;
        log::info!("Loaded estimator prior from {}", path.display());
        Ok(prior)
    }

    /// Rows of the observation matrix (or of R)
    pub fn obs_dim(&self) -> usize {
        match self {
            Prior::Statistics { r, .. } => r.len(),
            Prior::Model { c, .. } => c.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub obs_dim: usize,
    pub lambda: f64,
    pub c: Rows,
    pub q: Rows,
    pub m1: Rows,
    pub m2: Rows,
    pub r: Rows,
    pub s: Rows,
    pub t: Rows,
    pub ess: f64,
    pub ticks: u64,
    pub adaptations: u64,
    pub skipped_adaptations: u64,
}

impl Checkpoint {
    pub fn file_name(session: &str, label: &str) -> String {
        format!("{}-{}.json", session, label)
    }

    /// Write `<dir>/<session>-<label>.json`
    pub fn write(&self, dir: &Path) -> EstimatorResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(&self.session, &self.label));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        log::info!("Wrote {} checkpoint to {}", self.label, path.display());
        Ok(path)
    }

    pub fn read(path: &Path) -> EstimatorResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Statistics of this checkpoint as a prior for the next session
    pub fn as_prior(&self) -> Prior {
        Prior::Statistics {
            r: self.r.clone(),
            s: self.s.clone(),
            t: self.t.clone(),
            ess: self.ess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_variants_parse() {
        let model: Prior = serde_json::from_str(r#"{"c": [[0,0,1,0,0,0,0]], "q": [[1]]}"#).unwrap();
        assert!(matches!(model, Prior::Model { .. }));
        assert_eq!(model.obs_dim(), 1);

        let stats: Prior =
            serde_json::from_str(r#"{"r": [[1]], "s": [[0],[0],[0],[0],[0],[0],[0]], "t": [], "ess": 3}"#).unwrap();
        assert!(matches!(stats, Prior::Statistics { ess, .. } if ess == 3.0));
    }

    #[test]
    fn test_rows_dimension_checked() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            from_rows(&rows, "C", (2, 2)),
            Err(EstimatorError::Dimension { what: "C", .. })
        ));
        let m = from_rows(&vec![vec![1.0, 2.0], vec![3.0, 4.0]], "C", (2, 2)).unwrap();
        assert_eq!(m[(1, 0)], 3.0);
        assert_eq!(to_rows(&m), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_checkpoint_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint {
            session: "s1".to_string(),
            label: "initial".to_string(),
            created_at: Utc::now(),
            obs_dim: 1,
            lambda: 0.99,
            c: vec![vec![0.0; 7]],
            q: vec![vec![1.0]],
            m1: vec![],
            m2: vec![],
            r: vec![vec![1.0]],
            s: vec![vec![0.0]; 7],
            t: vec![],
            ess: 1.0,
            ticks: 0,
            adaptations: 0,
            skipped_adaptations: 0,
        };
        let path = checkpoint.write(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "s1-initial.json");
        assert_eq!(Checkpoint::read(&path).unwrap(), checkpoint);
    }
}
