use crate::types::DType;
use thiserror::Error;

/// Faults that prevent a pipeline from being constructed. Nothing is spawned
/// when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionFault {
    #[error("Dependency cycle through module '{module}'")]
    Cycle { module: String },

    #[error("Module '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    #[error("Module '{0}' declared twice")]
    DuplicateModule(String),

    #[error("Signal '{signal}' has two writers: '{first}' and '{second}'")]
    DuplicateWriter {
        signal: String,
        first: String,
        second: String,
    },

    #[error("Module '{module}' reads unknown signal '{signal}'")]
    UnknownSignal { module: String, signal: String },

    #[error("Signal '{signal}' shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        signal: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Signal '{signal}' dtype mismatch: expected {expected}, found {found}")]
    DTypeMismatch {
        signal: String,
        expected: DType,
        found: DType,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by signal bus handles.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Signal '{signal}' holds {found}, requested {expected}")]
    DTypeMismatch {
        signal: String,
        expected: DType,
        found: DType,
    },

    #[error("Signal '{signal}' expects {expected} elements, got {found}")]
    LengthMismatch {
        signal: String,
        expected: usize,
        found: usize,
    },

    #[error("Signal '{0}' is not a {1} signal")]
    KindMismatch(String, &'static str),

    #[error("Writer handle for signal '{0}' already taken")]
    WriterTaken(String),

    #[error("Module '{module}' is not the declared writer of '{signal}'")]
    NotWriter { signal: String, module: String },

    #[error("Module '{module}' did not declare '{signal}' as input")]
    NotDeclared { signal: String, module: String },

    #[error("Signal '{signal}' holds {available} samples, requested {requested}")]
    WindowUnavailable {
        signal: String,
        requested: usize,
        available: usize,
    },

    #[error("Continuity fault: {0}")]
    Continuity(#[from] ContinuityFault),

    #[error("Construction fault: {0}")]
    Construction(#[from] ConstructionFault),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A push that the bipartite buffer refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityFault {
    #[error("Stale sample counter {got} (last accepted {last})")]
    Stale { last: u64, got: u64 },
}

/// An adaptation step that would have corrupted estimator state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericFault {
    #[error("Rank-one update denominator {denominator:e} is near zero")]
    SingularUpdate { denominator: f64 },

    #[error("Inverse accumulator diverged (max diagonal {max_diagonal:e})")]
    InverseWindup { max_diagonal: f64 },

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("Innovation covariance is singular")]
    SingularInnovation,

    #[error("State outer-product block is not positive definite")]
    IndefiniteAccumulator,
}

#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("Numeric fault: {0}")]
    Numeric(#[from] NumericFault),

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    Dimension {
        what: &'static str,
        expected: String,
        found: String,
    },

    #[error("Invalid estimator parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors a module returns from `setup` or `step`.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Estimator error: {0}")]
    Estimator(#[from] EstimatorError),

    #[error("Acquisition source error: {0}")]
    Source(String),

    #[error("Model artifact error: {0}")]
    Model(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Top-level pipeline errors. Everything except `Construction` and `Config`
/// means the pipeline started and then halted.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Construction fault: {0}")]
    Construction(#[from] ConstructionFault),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Module '{module}' failed during setup: {message}")]
    Setup { module: String, message: String },

    #[error("Tick {tick} missed: module '{module}' did not complete (stalled: {stalled:?})")]
    MissedTick {
        tick: u64,
        module: String,
        stalled: Vec<String>,
    },

    #[error("Module '{module}' faulted at tick {tick}: {message}")]
    StepFault {
        module: String,
        tick: u64,
        message: String,
    },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// True when the pipeline was running and had to halt.
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            RuntimeError::Setup { .. } | RuntimeError::MissedTick { .. } | RuntimeError::StepFault { .. }
        )
    }
}

pub type BusResult<T> = std::result::Result<T, BusError>;
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;
pub type EstimatorResult<T> = std::result::Result<T, EstimatorError>;
pub type Result<T> = std::result::Result<T, RuntimeError>;
