//! Minimal center-out task: steps through a fixed sequence of targets.

use super::{output_len, parse_params};
use crate::bus::SignalWriter;
use crate::config::ModuleConfig;
use crate::error::{ConstructionFault, ModuleError, ModuleResult};
use crate::module::{Module, ModuleIo, StepOutcome, TickContext};
use serde::{Deserialize, Serialize};

pub const LEFT: u8 = 0;
pub const RIGHT: u8 = 1;
pub const UP: u8 = 2;
pub const DOWN: u8 = 3;
pub const REST: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParams {
    /// Task states in order; 0 left, 1 right, 2 up, 3 down, 4 rest
    pub sequence: Vec<u8>,
    pub hold_ticks: u64,
    pub amplitude: f64,
    pub target_output: Option<String>,
    pub state_output: Option<String>,
    /// Set to 1 while the task runs
    pub game_state_output: Option<String>,
    /// Ask the runtime to finish after this many passes through the sequence
    pub quit_after_cycles: Option<u64>,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            sequence: vec![LEFT, RIGHT, UP, DOWN, REST],
            hold_ticks: 400,
            amplitude: 0.7,
            target_output: None,
            state_output: None,
            game_state_output: None,
            quit_after_cycles: None,
        }
    }
}

pub fn target_of(state: u8, amplitude: f64) -> [f64; 2] {
    match state {
        LEFT => [-amplitude, 0.0],
        RIGHT => [amplitude, 0.0],
        UP => [0.0, amplitude],
        DOWN => [0.0, -amplitude],
        _ => [0.0, 0.0],
    }
}

fn snapshot_output(config: &ModuleConfig, name: Option<&str>, len: usize) -> Result<Option<String>, ConstructionFault> {
    match name {
        Some(name) => {
            let out = config
                .outputs
                .iter()
                .find(|o| o.name == name)
                .ok_or_else(|| ConstructionFault::InvalidConfig(format!(
                    "module '{}': output '{}' is not declared",
                    config.name, name
                )))?;
            if out.stream || output_len(out) != len {
                return Err(ConstructionFault::ShapeMismatch {
                    signal: out.name.clone(),
                    expected: vec![len],
                    found: out.shape.clone(),
                });
            }
            Ok(Some(out.name.clone()))
        }
        None => Ok(config
            .outputs
            .iter()
            .find(|o| !o.stream && output_len(o) == len)
            .map(|o| o.name.clone())),
    }
}

pub struct CenterOutTask {
    params: TaskParams,
    target_output: String,
    state_output: Option<String>,
    game_state_output: Option<String>,
    target: Option<SignalWriter>,
    state: Option<SignalWriter>,
    game_state: Option<SignalWriter>,
    steps: u64,
}

impl CenterOutTask {
    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConstructionFault> {
        let params: TaskParams = parse_params(config)?;
        if params.sequence.is_empty() || params.sequence.iter().any(|&s| s > REST) {
            return Err(ConstructionFault::InvalidConfig(format!(
                "module '{}': sequence must be non-empty with states 0..=4",
                config.name
            )));
        }
        if params.hold_ticks == 0 || params.quit_after_cycles == Some(0) {
            return Err(ConstructionFault::InvalidConfig(format!(
                "module '{}': hold_ticks and quit_after_cycles must be at least 1",
                config.name
            )));
        }

        let target_output = snapshot_output(config, params.target_output.as_deref(), 2)?.ok_or_else(|| {
            ConstructionFault::InvalidConfig(format!("module '{}' needs a 2-element target output", config.name))
        })?;
        let state_output = snapshot_output(config, params.state_output.as_deref(), 1)?;
        let game_state_output = match params.game_state_output.as_deref() {
            Some(name) => snapshot_output(config, Some(name), 1)?,
            None => None,
        };
        if state_output.is_some() && state_output == game_state_output {
            return Err(ConstructionFault::InvalidConfig(format!(
                "module '{}': task state and game state need separate outputs",
                config.name
            )));
        }

        Ok(Self {
            params,
            target_output,
            state_output,
            game_state_output,
            target: None,
            state: None,
            game_state: None,
            steps: 0,
        })
    }

    /// Task state shown at the given zero-based step
    pub fn state_at(&self, step: u64) -> u8 {
        let len = self.params.sequence.len() as u64;
        self.params.sequence[((step / self.params.hold_ticks) % len) as usize]
    }

    fn cycle_len(&self) -> u64 {
        self.params.hold_ticks * self.params.sequence.len() as u64
    }
}

impl Module for CenterOutTask {
    fn kind(&self) -> &'static str {
        "task"
    }

    fn setup(&mut self, io: &mut ModuleIo) -> ModuleResult<()> {
        self.target = Some(io.writer(&self.target_output)?);
        if let Some(name) = &self.state_output {
            self.state = Some(io.writer(name)?);
        }
        if let Some(name) = &self.game_state_output {
            self.game_state = Some(io.writer(name)?);
        }
        log::info!(
            "Task '{}': sequence {:?}, {} ticks per target",
            io.name(),
            self.params.sequence,
            self.params.hold_ticks
        );
        Ok(())
    }

    fn step(&mut self, _io: &mut ModuleIo, _tick: &TickContext) -> ModuleResult<StepOutcome> {
        let state = self.state_at(self.steps);
        let target = target_of(state, self.params.amplitude);
        self.steps += 1;

        self.target
            .as_mut()
            .ok_or_else(|| ModuleError::Other("task stepped before setup".to_string()))?
            .write_f64(&target)?;
        if let Some(writer) = self.state.as_mut() {
            writer.write_f64(&[state as f64])?;
        }
        if let Some(writer) = self.game_state.as_mut() {
            writer.write_f64(&[1.0])?;
        }

        if let Some(cycles) = self.params.quit_after_cycles {
            if self.steps == cycles * self.cycle_len() {
                log::info!("Task finished {} cycles", cycles);
                return Ok(StepOutcome::Quit);
            }
        }
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::harness;

    const CONFIG: &str = r#"
name: task
kind: task
params: { sequence: [0, 2, 4], hold_ticks: 2, quit_after_cycles: 2, game_state_output: game_state }
outputs:
  - { name: target_pos, shape: [2], dtype: f32 }
  - { name: state_task, shape: [1], dtype: i8 }
  - { name: game_state, shape: [1], dtype: i8 }
"#;

    #[test]
    fn test_target_mapping() {
        assert_eq!(target_of(LEFT, 0.7), [-0.7, 0.0]);
        assert_eq!(target_of(DOWN, 0.5), [0.0, -0.5]);
        assert_eq!(target_of(REST, 0.7), [0.0, 0.0]);
    }

    #[test]
    fn test_sequence_and_quit() {
        let config = harness::module_config(CONFIG);
        let bus = harness::bus_for(&[&config]);
        let (mut io, _faults) = harness::io_for(&bus, &config);
        let mut module = CenterOutTask::from_config(&config).unwrap();
        module.setup(&mut io).unwrap();

        let state_id = bus.id("state_task").unwrap();
        let target_id = bus.id("target_pos").unwrap();
        let mut states = Vec::new();
        let mut outcomes = Vec::new();
        for t in 1..=12 {
            let tick = harness::tick(&mut io, t);
            outcomes.push(module.step(&mut io, &tick).unwrap());
            harness::commit_all(&bus);
            states.push(bus.read::<i8>(state_id).unwrap().values[0]);
            if t == 3 {
                assert_eq!(bus.read::<f32>(target_id).unwrap().values, vec![0.0, 0.7]);
            }
        }
        assert_eq!(states, vec![0, 0, 2, 2, 4, 4, 0, 0, 2, 2, 4, 4]);
        assert_eq!(outcomes.iter().filter(|o| **o == StepOutcome::Quit).count(), 1);
        assert_eq!(outcomes[11], StepOutcome::Quit);
        assert_eq!(bus.read::<i8>(bus.id("game_state").unwrap()).unwrap().values, vec![1]);
    }

    #[test]
    fn test_invalid_sequence() {
        let config = harness::module_config(&CONFIG.replace("[0, 2, 4]", "[0, 7]"));
        assert!(matches!(
            CenterOutTask::from_config(&config),
            Err(ConstructionFault::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_needs_target_output() {
        let config = harness::module_config("name: task\nkind: task\noutputs: []\n");
        assert!(CenterOutTask::from_config(&config).is_err());
    }
}
