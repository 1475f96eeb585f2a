use crossbeam::channel::{bounded, Receiver};
use raspy_rt::error::ModuleResult;
use raspy_rt::{
    ConstructionFault, DType, Module, ModuleDecl, ModuleIo, Pipeline, RuntimeError, SessionConfig, SessionSettings,
    SignalKind, SignalSpec, SignalWriter, StepOutcome, Termination, TickContext, TimerConfig,
};
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const CENTER_OUT: &str = r#"
session:
  name: e2e
  period_ms: 20
  late_tolerance_ms: 20
  max_ticks: 200
modules:
  - name: eeg
    kind: acquisition
    params:
      source:
        type: synthetic
        channels: 4
        waveform: { shape: sine, frequency: 10, amplitude: 20 }
        pacing: { mode: per_poll, samples: 5 }
        seed: 7
      num_samples_output: eeg_count
    outputs:
      - { name: raw, shape: [250, 4], dtype: f32, stream: true }
      - { name: eeg_count, shape: [1], dtype: u64 }
  - name: filt
    kind: filter
    inputs: [raw]
    outputs:
      - { name: clean, shape: [250, 4], dtype: f32, stream: true }
    depends_on: [eeg]
  - name: features
    kind: features
    params: { window: 25 }
    inputs: [clean]
    outputs:
      - { name: power, shape: [4], dtype: f64 }
    depends_on: [filt]
  - name: decoder
    kind: clda
    params:
      target: target_pos
      estimator: { adapt_every: 5 }
    inputs: [power, target_pos]
    outputs:
      - { name: kf_state, shape: [7], dtype: f64 }
      - { name: decoded_pos, shape: [2], dtype: f32 }
    depends_on: [features]
  - name: task
    kind: task
    params: { hold_ticks: 3, quit_after_cycles: 2 }
    outputs:
      - { name: target_pos, shape: [2], dtype: f32 }
      - { name: state_task, shape: [1], dtype: i8 }
"#;

fn settings(max_ticks: u64) -> SessionSettings {
    SessionSettings {
        name: "itest".to_string(),
        timer: TimerConfig {
            period: Duration::from_millis(20),
            late_tolerance: Duration::from_millis(20),
            spin_window: Duration::from_millis(1),
        },
        max_ticks: Some(max_ticks),
        teardown_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn snapshot(name: &str, writer: &str) -> SignalSpec {
    SignalSpec {
        name: name.to_string(),
        shape: vec![1],
        dtype: DType::U64,
        writer: writer.to_string(),
        kind: SignalKind::Snapshot,
    }
}

fn decl(name: &str, inputs: &[&str], outputs: &[&str], depends_on: &[&str]) -> ModuleDecl {
    let owned = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
    ModuleDecl {
        name: name.to_string(),
        inputs: owned(inputs),
        outputs: owned(outputs),
        depends_on: owned(depends_on),
    }
}

/// Writes the tick number; optionally blocks or panics at one tick
struct Ticker {
    output: &'static str,
    out: Option<SignalWriter>,
    block_at: Option<(u64, Receiver<()>)>,
    panic_at: Option<u64>,
}

impl Ticker {
    fn new(output: &'static str) -> Self {
        Self {
            output,
            out: None,
            block_at: None,
            panic_at: None,
        }
    }
}

impl Module for Ticker {
    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        self.out = Some(io.writer(self.output)?);
        Ok(())
    }

    fn step(&mut self, _io: &mut ModuleIo, tick: &TickContext) -> ModuleResult<StepOutcome> {
        if let Some((at, release)) = &self.block_at {
            if *at == tick.tick {
                let _ = release.recv_timeout(Duration::from_secs(5));
            }
        }
        if self.panic_at == Some(tick.tick) {
            panic!("sensor unplugged");
        }
        if let Some(out) = self.out.as_mut() {
            out.write(&[tick.tick])?;
        }
        Ok(StepOutcome::Continue)
    }
}

/// Fails unless it reads the writer's value from `lag` ticks ago
struct TickReader {
    input: &'static str,
    lag: u64,
    delay: Duration,
    reader: Option<raspy_rt::SignalReader>,
}

impl TickReader {
    fn new(input: &'static str, lag: u64) -> Self {
        Self {
            input,
            lag,
            delay: Duration::ZERO,
            reader: None,
        }
    }
}

impl Module for TickReader {
    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        self.reader = Some(io.reader(self.input)?);
        Ok(())
    }

    fn step(&mut self, _io: &mut ModuleIo, tick: &TickContext) -> ModuleResult<StepOutcome> {
        std::thread::sleep(self.delay);
        if let Some(reader) = self.reader.as_ref() {
            let seen = reader.read_f64()?.values[0] as u64;
            if seen != tick.tick - self.lag {
                return Err(raspy_rt::ModuleError::Other(format!(
                    "tick {} saw upstream value {}",
                    tick.tick, seen
                )));
            }
        }
        Ok(StepOutcome::Continue)
    }
}

#[test]
fn test_center_out_session_runs_to_quit() {
    init_logging();
    let checkpoints = tempfile::tempdir().unwrap();
    let mut config = SessionConfig::from_yaml_str(CENTER_OUT).unwrap();
    config.session.checkpoint_dir = Some(checkpoints.path().to_path_buf());

    let report = Pipeline::from_config(&config).unwrap().run().unwrap();

    // Five targets held three ticks each, twice, plus the grace tick
    assert_eq!(
        report.termination,
        Termination::Quit {
            module: "task".to_string(),
            tick: 30
        }
    );
    assert_eq!(report.ticks, 31);
    assert_eq!(report.continuity_faults(), 0);
    assert_eq!(report.buffers["raw"].accepted, 31 * 5);
    assert_eq!(report.buffers["clean"].accepted, 31 * 5);
    assert!(checkpoints.path().join("e2e-initial.json").exists());
    assert!(checkpoints.path().join("e2e-final.json").exists());
}

#[test]
fn test_dependent_sees_same_tick_output() {
    init_logging();
    let pipeline = Pipeline::from_modules(
        settings(15),
        vec![snapshot("count", "source")],
        vec![
            (decl("source", &[], &["count"], &[]), Box::new(Ticker::new("count")) as Box<dyn Module>),
            (
                decl("sink", &["count"], &[], &["source"]),
                Box::new(TickReader::new("count", 0)) as Box<dyn Module>,
            ),
        ],
    )
    .unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.ticks, 15);
    assert_eq!(report.termination, Termination::MaxTicks);
}

#[test]
fn test_unordered_reader_sees_previous_tick() {
    init_logging();
    let mut sink = TickReader::new("count", 1);
    sink.delay = Duration::from_millis(3);
    let pipeline = Pipeline::from_modules(
        settings(20),
        vec![snapshot("count", "source")],
        vec![
            (decl("source", &[], &["count"], &[]), Box::new(Ticker::new("count")) as Box<dyn Module>),
            (decl("sink", &["count"], &[], &[]), Box::new(sink) as Box<dyn Module>),
        ],
    )
    .unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.ticks, 20);
    assert_eq!(report.termination, Termination::MaxTicks);
}

#[test]
fn test_transitive_dependent_sees_same_tick_output() {
    init_logging();
    let pipeline = Pipeline::from_modules(
        settings(10),
        vec![snapshot("count", "source"), snapshot("relay_out", "relay")],
        vec![
            (decl("source", &[], &["count"], &[]), Box::new(Ticker::new("count")) as Box<dyn Module>),
            (
                decl("relay", &[], &["relay_out"], &["source"]),
                Box::new(Ticker::new("relay_out")) as Box<dyn Module>,
            ),
            (
                decl("sink", &["count"], &[], &["relay"]),
                Box::new(TickReader::new("count", 0)) as Box<dyn Module>,
            ),
        ],
    )
    .unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.ticks, 10);
}

#[test]
fn test_hung_module_misses_tick() {
    init_logging();
    let (release_tx, release_rx) = bounded::<()>(1);
    let mut hung = Ticker::new("a");
    hung.block_at = Some((3, release_rx));

    let pipeline = Pipeline::from_modules(
        settings(50),
        vec![snapshot("a", "hung"), snapshot("b", "after"), snapshot("c", "free")],
        vec![
            (decl("hung", &[], &["a"], &[]), Box::new(hung) as Box<dyn Module>),
            (decl("after", &["a"], &["b"], &["hung"]), Box::new(Ticker::new("b")) as Box<dyn Module>),
            (decl("free", &[], &["c"], &[]), Box::new(Ticker::new("c")) as Box<dyn Module>),
        ],
    )
    .unwrap();

    let err = pipeline.run().unwrap_err();
    drop(release_tx);
    assert!(err.is_halt());
    match err {
        RuntimeError::MissedTick { tick, module, stalled } => {
            assert_eq!(tick, 3);
            assert_eq!(module, "hung");
            assert_eq!(stalled, vec!["after".to_string()]);
        }
        other => panic!("expected a missed tick, got {other}"),
    }
}

#[test]
fn test_step_panic_halts_with_fault() {
    init_logging();
    let mut boom = Ticker::new("a");
    boom.panic_at = Some(2);
    let pipeline = Pipeline::from_modules(
        settings(50),
        vec![snapshot("a", "boom")],
        vec![(decl("boom", &[], &["a"], &[]), Box::new(boom) as Box<dyn Module>)],
    )
    .unwrap();

    match pipeline.run() {
        Err(RuntimeError::StepFault { module, tick, message }) => {
            assert_eq!(module, "boom");
            assert_eq!(tick, 2);
            assert!(message.contains("sensor unplugged"));
        }
        other => panic!("expected a step fault, got {other:?}"),
    }
}

#[test]
fn test_cycle_rejected_before_spawn() {
    let text = r#"
modules:
  - name: a
    kind: task
    outputs: [{ name: ta, shape: [2], dtype: f32 }]
    depends_on: [b]
  - name: b
    kind: task
    outputs: [{ name: tb, shape: [2], dtype: f32 }]
    depends_on: [a]
"#;
    let config = SessionConfig::from_yaml_str(text).unwrap();
    assert!(matches!(
        Pipeline::from_config(&config),
        Err(RuntimeError::Construction(ConstructionFault::Cycle { .. }))
    ));
}

#[test]
fn test_second_writer_rejected() {
    let err = Pipeline::from_modules(
        settings(1),
        vec![snapshot("a", "first")],
        vec![
            (decl("first", &[], &["a"], &[]), Box::new(Ticker::new("a")) as Box<dyn Module>),
            (decl("second", &[], &["a"], &[]), Box::new(Ticker::new("a")) as Box<dyn Module>),
        ],
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Construction(ConstructionFault::DuplicateWriter { ref first, ref second, .. })
            if first == "first" && second == "second"
    ));
}

#[test]
fn test_file_backed_session() {
    init_logging();
    let shm = tempfile::tempdir().unwrap();
    let text = format!(
        r#"
session: {{ name: mapped, period_ms: 10, late_tolerance_ms: 10, max_ticks: 8, shm_dir: {} }}
modules:
  - name: eeg
    kind: acquisition
    params:
      source: {{ type: synthetic, channels: 16, pacing: {{ mode: per_poll, samples: 25 }} }}
    outputs:
      - {{ name: raw, shape: [250, 16], dtype: f32, stream: true }}
"#,
        shm.path().display()
    );
    let config = SessionConfig::from_yaml_str(&text).unwrap();
    let report = Pipeline::from_config(&config).unwrap().run().unwrap();
    assert_eq!(report.ticks, 8);
    assert_eq!(report.buffers["raw"].accepted, 200);
    assert!(report.faults.iter().all(|f| f.module == "timer"));
}
