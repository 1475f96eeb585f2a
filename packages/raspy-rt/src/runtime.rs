//! Pipeline construction and the tick loop.
//!
//! Each module runs on its own named thread. The coordinator (the caller of
//! [`Pipeline::run`]) owns the master timer: every tick it releases the
//! completion board and waits for all modules to report completion before
//! the next deadline. Any module that misses it halts the pipeline. Once a
//! tick completes, committed snapshots are published to lagged readers.

use crate::bus::{Backing, SignalBus, SignalKind, SignalSpec};
use crate::circular::BufferStats;
use crate::error::{ConstructionFault, Result, RuntimeError};
use crate::module::{FaultReporter, Module, ModuleDecl, ModuleIo, SessionInfo, StepOutcome, TickContext};
use crate::scheduler::{CompletionBoard, DagScheduler, Turn};
use crate::timer::{MasterTimer, TimerConfig, TimerStats};
use crate::types::{FaultKind, FaultRecord, ModuleState};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session-level settings, independent of the module set
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub name: String,
    pub timer: TimerConfig,
    pub max_ticks: Option<u64>,
    pub setup_timeout: Duration,
    pub teardown_timeout: Duration,
    pub backing: Backing,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            timer: TimerConfig::default(),
            max_ticks: None,
            setup_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(1),
            backing: Backing::Anonymous,
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// Reached the configured tick limit
    MaxTicks,
    /// A module asked to quit at `tick`
    Quit { module: String, tick: u64 },
    /// Stopped through a [`StopHandle`]
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: String,
    /// Unique per run, also written to the log
    pub run_id: String,
    pub ticks: u64,
    pub late_ticks: u64,
    pub termination: Termination,
    pub faults: Vec<FaultRecord>,
    pub timer: TimerStats,
    pub buffers: BTreeMap<String, BufferStats>,
}

impl SessionReport {
    pub fn continuity_faults(&self) -> usize {
        self.faults
            .iter()
            .filter(|f| matches!(f.kind, FaultKind::Continuity { .. }))
            .count()
    }
}

/// Requests a clean stop at the next tick boundary
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum WorkerEvent {
    SetupDone {
        module: usize,
        result: std::result::Result<(), String>,
    },
    Quit {
        module: usize,
        tick: u64,
    },
    StepFailed {
        module: usize,
        tick: u64,
        message: String,
    },
    Stopped {
        module: usize,
    },
}

struct Entry {
    decl: ModuleDecl,
    module: Box<dyn Module>,
}

/// A validated set of modules and signals, ready to run.
pub struct Pipeline {
    settings: SessionSettings,
    bus: SignalBus,
    scheduler: DagScheduler,
    entries: Vec<Entry>,
    stop: StopHandle,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("session", &self.settings.name)
            .field("modules", &self.scheduler.order_names())
            .field("signals", &self.bus.len())
            .finish()
    }
}

impl Pipeline {
    /// Validate the wiring and allocate every signal. Nothing is spawned.
    pub fn from_modules(
        settings: SessionSettings,
        signals: Vec<SignalSpec>,
        modules: Vec<(ModuleDecl, Box<dyn Module>)>,
    ) -> Result<Self> {
        let scheduler = DagScheduler::new(
            modules
                .iter()
                .map(|(decl, _)| (decl.name.as_str(), decl.depends_on.as_slice())),
        )?;

        for spec in &signals {
            if scheduler.index_of(&spec.writer).is_none() {
                return Err(ConstructionFault::InvalidConfig(format!(
                    "signal '{}' is written by unknown module '{}'",
                    spec.name, spec.writer
                ))
                .into());
            }
        }
        let bus = plan_bus(&settings.backing, signals)?;

        for (decl, _) in &modules {
            for output in &decl.outputs {
                let id = bus.id(output).map_err(|_| ConstructionFault::UnknownSignal {
                    module: decl.name.clone(),
                    signal: output.clone(),
                })?;
                let writer = &bus.spec(id).writer;
                if writer != &decl.name {
                    return Err(ConstructionFault::DuplicateWriter {
                        signal: output.clone(),
                        first: writer.clone(),
                        second: decl.name.clone(),
                    }
                    .into());
                }
            }
            for input in &decl.inputs {
                if bus.id(input).is_err() {
                    return Err(ConstructionFault::UnknownSignal {
                        module: decl.name.clone(),
                        signal: input.clone(),
                    }
                    .into());
                }
            }
        }

        log::info!(
            "Pipeline '{}': {} modules, {} signals ({} bytes mapped)",
            settings.name,
            scheduler.len(),
            bus.len(),
            bus.mapped_bytes()
        );

        Ok(Self {
            settings,
            bus,
            scheduler,
            entries: modules
                .into_iter()
                .map(|(decl, module)| Entry { decl, module })
                .collect(),
            stop: StopHandle::default(),
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &DagScheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Spawn all modules, drive ticks until termination, tear down.
    pub fn run(self) -> Result<SessionReport> {
        let Pipeline {
            settings,
            bus,
            scheduler,
            entries,
            stop,
        } = self;

        let run_id = Uuid::new_v4().to_string();
        log::info!("Starting session '{}' (run {})", settings.name, run_id);
        let bus = Arc::new(bus);
        let board = Arc::new(CompletionBoard::new(scheduler.upstream_table()));
        let session = Arc::new(SessionInfo {
            name: settings.name.clone(),
            period: settings.timer.period,
            checkpoint_dir: settings.checkpoint_dir.clone(),
        });
        let (fault_tx, fault_rx) = channel::unbounded::<FaultRecord>();
        let (event_tx, event_rx) = channel::unbounded::<WorkerEvent>();

        let mut states = vec![ModuleState::Constructed; entries.len()];
        let mut handles: Vec<Option<JoinHandle<()>>> = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            let io = ModuleIo::new(
                entry.decl.clone(),
                Arc::clone(&bus),
                Arc::clone(&session),
                FaultReporter::new(&entry.decl.name, fault_tx.clone()),
            )
            .with_upstream(
                scheduler
                    .ancestors(index)
                    .into_iter()
                    .map(|i| scheduler.name(i).to_string()),
            );
            let board = Arc::clone(&board);
            let events = event_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("raspy-{}", entry.decl.name))
                .spawn(move || worker(index, entry.module, io, board, events))?;
            handles.push(Some(handle));
        }
        drop(fault_tx);
        drop(event_tx);

        let mut coordinator = Coordinator {
            settings: &settings,
            scheduler: &scheduler,
            bus: &bus,
            board: &board,
            events: &event_rx,
            states: &mut states,
            quit: None,
            late: Vec::new(),
        };

        let outcome = match coordinator.await_setup() {
            Ok(()) => coordinator.tick_loop(&stop),
            Err(e) => Err(e),
        };

        board.halt();
        let stopped = coordinator.await_stopped();
        for (index, handle) in handles.iter_mut().enumerate() {
            if let Some(handle) = handle.take() {
                if stopped[index] {
                    let _ = handle.join();
                } else {
                    log::error!(
                        "Module '{}' did not stop within {:?}; detaching its thread",
                        scheduler.name(index),
                        settings.teardown_timeout
                    );
                }
            }
        }

        let late = std::mem::take(&mut coordinator.late);
        let (ticks, termination, timer) = outcome?;

        let mut faults: Vec<FaultRecord> = fault_rx.try_iter().chain(late).collect();
        faults.sort_by_key(|f| f.tick);
        let buffers = bus
            .specs()
            .filter(|spec| spec.kind == SignalKind::Stream)
            .filter_map(|spec| {
                let id = bus.id(&spec.name).ok()?;
                let reader = bus.stream_reader(id).ok()?;
                Some((spec.name.clone(), reader.stats()))
            })
            .collect();

        log::info!(
            "Session '{}' finished after {} ticks ({:?}), {} faults",
            settings.name,
            ticks,
            termination,
            faults.len()
        );

        Ok(SessionReport {
            session: settings.name.clone(),
            run_id,
            ticks,
            late_ticks: timer.late_ticks,
            termination,
            faults,
            timer,
            buffers,
        })
    }
}

fn plan_bus(backing: &Backing, signals: Vec<SignalSpec>) -> Result<SignalBus> {
    let mut bus = SignalBus::new(backing.clone());
    for spec in signals {
        bus.declare_spec(spec).map_err(|e| match e {
            crate::error::BusError::Construction(fault) => RuntimeError::Construction(fault),
            other => RuntimeError::Bus(other),
        })?;
    }
    Ok(bus)
}

struct Coordinator<'a> {
    settings: &'a SessionSettings,
    scheduler: &'a DagScheduler,
    bus: &'a SignalBus,
    board: &'a CompletionBoard,
    events: &'a Receiver<WorkerEvent>,
    states: &'a mut [ModuleState],
    quit: Option<(usize, u64)>,
    late: Vec<FaultRecord>,
}

impl Coordinator<'_> {
    fn await_setup(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.setup_timeout;
        let mut ready = 0;
        while ready < self.states.len() {
            let event = match self.events.recv_deadline(deadline) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    let module = self
                        .states
                        .iter()
                        .position(|s| *s == ModuleState::Constructed)
                        .map(|i| self.scheduler.name(i).to_string())
                        .unwrap_or_default();
                    return Err(RuntimeError::Setup {
                        module,
                        message: format!("setup did not finish within {:?}", self.settings.setup_timeout),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RuntimeError::Config("module threads exited during setup".to_string()))
                }
            };
            match event {
                WorkerEvent::SetupDone { module, result: Ok(()) } => {
                    self.states[module] = ModuleState::Running;
                    ready += 1;
                }
                WorkerEvent::SetupDone {
                    module,
                    result: Err(message),
                } => {
                    self.states[module] = ModuleState::Stopped;
                    log::error!("Module '{}' failed setup: {}", self.scheduler.name(module), message);
                    return Err(RuntimeError::Setup {
                        module: self.scheduler.name(module).to_string(),
                        message,
                    });
                }
                WorkerEvent::Stopped { module } => self.states[module] = ModuleState::Stopped,
                _ => {}
            }
        }
        log::debug!("All {} modules set up", ready);
        Ok(())
    }

    fn tick_loop(&mut self, stop: &StopHandle) -> Result<(u64, Termination, TimerStats)> {
        let period = self.settings.timer.period;
        let mut timer = MasterTimer::new(self.settings.timer);
        let mut ticks = 0;

        let termination = loop {
            if self.settings.max_ticks.is_some_and(|max| ticks >= max) {
                break Termination::MaxTicks;
            }
            if stop.is_stopped() {
                break Termination::Stopped;
            }

            let info = timer.wait_for_next_tick();
            if let Some(lateness) = info.lateness {
                self.late.push(FaultRecord {
                    tick: info.tick,
                    module: "timer".to_string(),
                    kind: FaultKind::LateTick {
                        overrun_us: lateness.as_micros() as u64,
                    },
                });
            }
            let deadline = info.fired_at + period;
            self.board.release(info.tick, deadline);

            if let Err(pending) = self.board.wait_all_complete(info.tick, deadline) {
                return Err(self.escalate(info.tick, &pending));
            }
            self.bus.publish();
            ticks = info.tick;

            for event in self.events.try_iter() {
                match event {
                    WorkerEvent::Quit { module, tick } if self.quit.is_none() => {
                        log::info!(
                            "Module '{}' requested quit at tick {}",
                            self.scheduler.name(module),
                            tick
                        );
                        self.quit = Some((module, tick));
                    }
                    WorkerEvent::Stopped { module } => self.states[module] = ModuleState::Stopped,
                    _ => {}
                }
            }

            // One grace tick after the quit request, then stop.
            if let Some((module, tick)) = self.quit {
                if info.tick > tick {
                    break Termination::Quit {
                        module: self.scheduler.name(module).to_string(),
                        tick,
                    };
                }
            }
        };

        Ok((ticks, termination, timer.stats()))
    }

    /// Turn a tick that did not complete into the halting error
    fn escalate(&mut self, tick: u64, pending: &[usize]) -> RuntimeError {
        self.board.halt();
        // A failed step halts the board itself; prefer its report.
        let grace = Instant::now() + Duration::from_millis(10);
        while let Ok(event) = self.events.recv_deadline(grace) {
            match event {
                WorkerEvent::StepFailed { module, tick, message } => {
                    log::error!(
                        "Module '{}' faulted at tick {}: {}",
                        self.scheduler.name(module),
                        tick,
                        message
                    );
                    return RuntimeError::StepFault {
                        module: self.scheduler.name(module).to_string(),
                        tick,
                        message,
                    };
                }
                WorkerEvent::Stopped { module } => self.states[module] = ModuleState::Stopped,
                _ => {}
            }
        }

        let (culprit, stalled) = self
            .scheduler
            .diagnose(pending)
            .unwrap_or((pending[0], pending[1..].to_vec()));
        let module = self.scheduler.name(culprit).to_string();
        let stalled: Vec<String> = stalled.iter().map(|&i| self.scheduler.name(i).to_string()).collect();
        log::error!(
            "Tick {} missed: module '{}' did not complete, stalled: {:?}",
            tick,
            module,
            stalled
        );
        RuntimeError::MissedTick { tick, module, stalled }
    }

    /// Wait up to the teardown timeout for every worker to stop
    fn await_stopped(&mut self) -> Vec<bool> {
        let deadline = Instant::now() + self.settings.teardown_timeout;
        while self.states.iter().any(|s| *s != ModuleState::Stopped) {
            match self.events.recv_deadline(deadline) {
                Ok(WorkerEvent::Stopped { module }) => self.states[module] = ModuleState::Stopped,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        self.states.iter().map(|s| *s == ModuleState::Stopped).collect()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with non-string payload".to_string()
    }
}

fn worker(
    index: usize,
    mut module: Box<dyn Module>,
    mut io: ModuleIo,
    board: Arc<CompletionBoard>,
    events: Sender<WorkerEvent>,
) {
    let setup = match catch_unwind(AssertUnwindSafe(|| module.setup(&mut io))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload)),
    };
    let setup_ok = setup.is_ok();
    let _ = events.send(WorkerEvent::SetupDone {
        module: index,
        result: setup,
    });
    if !setup_ok {
        let _ = events.send(WorkerEvent::Stopped { module: index });
        return;
    }
    log::debug!("Module '{}' ({}) running", io.name(), module.kind());

    let period = io.session().period;
    let bus = io.bus();
    let outputs: Vec<_> = io
        .decl()
        .outputs
        .iter()
        .filter_map(|name| bus.id(name).ok())
        .filter(|id| bus.spec(*id).kind == SignalKind::Snapshot)
        .collect();
    let mut quitting = false;

    loop {
        let (tick, deadline) = match board.wait_turn(index) {
            Turn::Halt => break,
            Turn::Run { tick, deadline } => (tick, deadline),
        };
        if quitting {
            board.complete(index, tick);
            continue;
        }

        io.set_tick(tick);
        let ctx = TickContext { tick, deadline, period };
        match catch_unwind(AssertUnwindSafe(|| module.step(&mut io, &ctx))) {
            Ok(Ok(outcome)) => {
                for id in &outputs {
                    bus.commit(*id);
                }
                if outcome == StepOutcome::Quit {
                    quitting = true;
                    let _ = events.send(WorkerEvent::Quit { module: index, tick });
                }
                board.complete(index, tick);
            }
            Ok(Err(e)) => {
                let _ = events.send(WorkerEvent::StepFailed {
                    module: index,
                    tick,
                    message: e.to_string(),
                });
                board.halt();
                break;
            }
            Err(payload) => {
                let _ = events.send(WorkerEvent::StepFailed {
                    module: index,
                    tick,
                    message: panic_message(payload),
                });
                board.halt();
                break;
            }
        }
    }

    if catch_unwind(AssertUnwindSafe(|| module.teardown(&mut io))).is_err() {
        log::error!("Module '{}' panicked during teardown", io.name());
    }
    log::debug!("Module '{}' stopped", io.name());
    let _ = events.send(WorkerEvent::Stopped { module: index });
}
