//! Module lifecycle contract.
//!
//! A module is set up once, stepped once per released tick, and torn down at
//! shutdown. It only ever talks to other modules through the signals handed
//! to it by [`ModuleIo`].

use crate::bus::{SignalBus, SignalId, SignalReader, SignalWriter};
use crate::circular::{StreamReader, StreamWriter};
use crate::error::{BusError, BusResult, ModuleResult};
use crate::types::{FaultKind, FaultRecord};
use crossbeam::channel::Sender;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-tick context passed to `step`
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub tick: u64,
    /// Start of the next tick; the step must finish before it
    pub deadline: Instant,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Ask the runtime to finish after one grace tick
    Quit,
}

pub trait Module: Send {
    /// Registry tag, used in logs
    fn kind(&self) -> &'static str {
        "custom"
    }

    /// Acquire signal handles and load artifacts. Runs on the module's thread.
    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()>;

    fn step(&mut self, io: &mut ModuleIo, tick: &TickContext) -> ModuleResult<StepOutcome>;

    /// Runs on normal shutdown and after a halt
    fn teardown(&mut self, _io: &mut ModuleIo) {}
}

/// Session facts every module may need
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub name: String,
    pub period: Duration,
    pub checkpoint_dir: Option<PathBuf>,
}

/// Declared signal wiring of one module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDecl {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub depends_on: Vec<String>,
}

/// Sends non-fatal faults to the coordinator
#[derive(Clone)]
pub struct FaultReporter {
    module: String,
    tx: Sender<FaultRecord>,
}

impl FaultReporter {
    pub(crate) fn new(module: &str, tx: Sender<FaultRecord>) -> Self {
        Self {
            module: module.to_string(),
            tx,
        }
    }

    pub fn report(&self, tick: u64, kind: FaultKind) {
        let record = FaultRecord {
            tick,
            module: self.module.clone(),
            kind,
        };
        log::warn!("{}", record);
        // The coordinator only goes away after every worker has stopped.
        let _ = self.tx.send(record);
    }
}

/// A module's view of the bus: its declared inputs and outputs only.
pub struct ModuleIo {
    decl: ModuleDecl,
    bus: Arc<SignalBus>,
    session: Arc<SessionInfo>,
    faults: FaultReporter,
    tick: u64,
    /// Modules stepped before this one every tick; `None` outside a pipeline
    upstream: Option<HashSet<String>>,
}

impl ModuleIo {
    pub(crate) fn new(
        decl: ModuleDecl,
        bus: Arc<SignalBus>,
        session: Arc<SessionInfo>,
        faults: FaultReporter,
    ) -> Self {
        Self {
            decl,
            bus,
            session,
            faults,
            tick: 0,
            upstream: None,
        }
    }

    pub(crate) fn with_upstream(mut self, upstream: impl IntoIterator<Item = String>) -> Self {
        self.upstream = Some(upstream.into_iter().collect());
        self
    }

    /// Whether this module is ordered after `writer` within a tick
    pub fn sees_current_tick(&self, writer: &str) -> bool {
        writer == self.decl.name || self.upstream.as_ref().map_or(true, |up| up.contains(writer))
    }

    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn decl(&self) -> &ModuleDecl {
        &self.decl
    }

    pub(crate) fn bus(&self) -> Arc<SignalBus> {
        Arc::clone(&self.bus)
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Tick being stepped (0 during setup)
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    pub fn has_input(&self, signal: &str) -> bool {
        self.decl.inputs.iter().any(|s| s == signal)
    }

    pub fn has_output(&self, signal: &str) -> bool {
        self.decl.outputs.iter().any(|s| s == signal)
    }

    fn input(&self, signal: &str) -> BusResult<SignalId> {
        if !self.has_input(signal) {
            return Err(BusError::NotDeclared {
                signal: signal.to_string(),
                module: self.decl.name.clone(),
            });
        }
        self.bus.id(signal)
    }

    fn output(&self, signal: &str) -> BusResult<SignalId> {
        if !self.has_output(signal) {
            return Err(BusError::NotWriter {
                signal: signal.to_string(),
                module: self.decl.name.clone(),
            });
        }
        self.bus.id(signal)
    }

    /// Snapshot reader. Signals from modules this one is not ordered after
    /// read as of the previous tick boundary.
    pub fn reader(&self, signal: &str) -> BusResult<SignalReader> {
        let id = self.input(signal)?;
        if self.sees_current_tick(&self.bus.spec(id).writer) {
            self.bus.reader(id)
        } else {
            self.bus.lagged_reader(id)
        }
    }

    pub fn stream_reader(&self, signal: &str) -> BusResult<StreamReader> {
        self.bus.stream_reader(self.input(signal)?)
    }

    pub fn writer(&mut self, signal: &str) -> BusResult<SignalWriter> {
        let id = self.output(signal)?;
        self.bus.writer(id, &self.decl.name)
    }

    pub fn stream_writer(&mut self, signal: &str) -> BusResult<StreamWriter> {
        let id = self.output(signal)?;
        self.bus.stream_writer(id, &self.decl.name)
    }

    /// Report a non-fatal fault at the current tick
    pub fn report(&self, kind: FaultKind) {
        self.faults.report(self.tick, kind);
    }

    pub fn reporter(&self) -> FaultReporter {
        self.faults.clone()
    }
}
