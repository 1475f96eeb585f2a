use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I8,
    I32,
    I64,
    U8,
    U64,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 | DType::U64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U64 => "u64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Plain-old-data element that can live in a shared memory segment.
///
/// Sealed: only the primitive types listed in [`DType`] implement it, which is
/// what makes the byte-level copies in the bus sound.
pub trait Element: sealed::Sealed + Copy + Default + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr) => {
        impl sealed::Sealed for $t {}

        impl Element for $t {
            const DTYPE: DType = $dtype;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    };
}

impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);
impl_element!(i8, DType::I8);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(u8, DType::U8);
impl_element!(u64, DType::U64);

/// Number of elements described by a shape
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Constructed,
    Running,
    Stopped,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self::Constructed
    }
}

/// Non-fatal faults. They are logged where they happen and collected in the
/// session report; none of them stops decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
    /// Gap or stale counter on a stream signal
    Continuity {
        signal: String,
        expected: u64,
        got: u64,
        missing: u64,
    },
    /// Reader fell more than one region behind and lost samples
    Overrun { signal: String, lost: u64 },
    /// Adaptation step skipped
    Numeric { message: String },
    /// Master timer fired later than the tolerance allows
    LateTick { overrun_us: u64 },
    /// Steady-state gain iteration hit its bound before converging
    GainNotConverged { iterations: usize, residual: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub tick: u64,
    pub module: String,
    pub kind: FaultKind,
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick {} [{}] ", self.tick, self.module)?;
        match &self.kind {
            FaultKind::Continuity {
                signal,
                expected,
                got,
                missing,
            } => write!(
                f,
                "continuity fault on '{}': expected counter {}, got {} ({} missing)",
                signal, expected, got, missing
            ),
            FaultKind::Overrun { signal, lost } => {
                write!(f, "reader overrun on '{}': {} samples lost", signal, lost)
            }
            FaultKind::Numeric { message } => write!(f, "adaptation skipped: {}", message),
            FaultKind::LateTick { overrun_us } => write!(f, "late tick by {} us", overrun_us),
            FaultKind::GainNotConverged {
                iterations,
                residual,
            } => write!(
                f,
                "steady-state gain not converged after {} iterations (residual {:e})",
                iterations, residual
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes_match_rust_types() {
        assert_eq!(DType::F32.size(), std::mem::size_of::<f32>());
        assert_eq!(DType::F64.size(), std::mem::size_of::<f64>());
        assert_eq!(DType::I8.size(), std::mem::size_of::<i8>());
        assert_eq!(DType::U64.size(), std::mem::size_of::<u64>());
    }

    #[test]
    fn test_dtype_serde_lowercase() {
        let d: DType = serde_json::from_str("\"f32\"").unwrap();
        assert_eq!(d, DType::F32);
        assert_eq!(serde_json::to_string(&DType::I64).unwrap(), "\"i64\"");
    }

    #[test]
    fn test_element_round_trip_through_f64() {
        assert_eq!(<i8 as Element>::from_f64(-3.0), -3);
        assert_eq!(7u8.to_f64(), 7.0);
        assert_eq!(<f32 as Element>::DTYPE, DType::F32);
    }

    #[test]
    fn test_fault_record_display_names_module_and_tick() {
        let record = FaultRecord {
            tick: 12,
            module: "eeg".to_string(),
            kind: FaultKind::Continuity {
                signal: "eegbuffer".to_string(),
                expected: 5,
                got: 9,
                missing: 4,
            },
        };
        let text = record.to_string();
        assert!(text.contains("tick 12"));
        assert!(text.contains("[eeg]"));
        assert!(text.contains("4 missing"));
    }
}
