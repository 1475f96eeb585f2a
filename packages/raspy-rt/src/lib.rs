//! Real-time closed-loop BCI runtime.
//!
//! Modules exchange data through a shared-memory [`bus::SignalBus`], are
//! stepped once per tick by a [`runtime::Pipeline`] in dependency order, and
//! a [`estimator::Estimator`] decodes and adapts a Kalman filter online.

pub mod bus;
pub mod circular;
pub mod config;
pub mod error;
pub mod estimator;
pub mod filters;
pub mod module;
pub mod modules;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod segment;
pub mod timer;
pub mod types;

pub use bus::{Backing, SignalBus, SignalId, SignalKind, SignalReader, SignalSpec, SignalWriter, Snapshot};
pub use circular::{PushOutcome, StreamBlock, StreamReader, StreamWriter};
pub use config::{ModuleConfig, ModuleKind, SessionConfig, SessionPlan};
pub use error::{ConstructionFault, ModuleError, Result, RuntimeError};
pub use estimator::{Adaptation, Estimator, EstimatorConfig};
pub use module::{Module, ModuleDecl, ModuleIo, StepOutcome, TickContext};
pub use runtime::{Pipeline, SessionReport, SessionSettings, StopHandle, Termination};
pub use timer::{MasterTimer, TimerConfig};
pub use types::*;
