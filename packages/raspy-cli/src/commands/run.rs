use crate::cli::RunArgs;
use crate::exit_codes;
use crate::output;
use raspy_rt::{Pipeline, RuntimeError, SessionConfig};

/// Command-line flags take precedence over the session file
pub fn apply_overrides(config: &mut SessionConfig, args: &RunArgs) {
    let session = &mut config.session;
    if let Some(name) = &args.name {
        session.name = name.clone();
    }
    if let Some(period) = args.period_ms {
        session.period_ms = period;
    }
    if args.max_ticks.is_some() {
        session.max_ticks = args.max_ticks;
    }
    if let Some(dir) = &args.shm_dir {
        session.shm_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.checkpoint_dir {
        session.checkpoint_dir = Some(dir.clone());
    }
}

pub fn execute(args: RunArgs) -> i32 {
    let mut config = match SessionConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };
    apply_overrides(&mut config, &args);

    let pipeline = match Pipeline::from_config(&config) {
        Ok(pipeline) => pipeline,
        Err(e @ RuntimeError::Construction(_)) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    if !args.quiet {
        eprintln!("Running session '{}'...", config.session.name);
        eprintln!("  Modules: {}", pipeline.scheduler().order_names().join(" -> "));
        eprintln!("  Period: {} ms", config.session.period_ms);
        if let Some(max) = config.session.max_ticks {
            eprintln!("  Tick limit: {}", max);
        }
    }

    match pipeline.run() {
        Ok(report) => {
            if let Err(e) = output::emit(&report, args.compact, args.output.as_deref()) {
                eprintln!("Error: {}", e);
                return exit_codes::EXECUTION_ERROR;
            }
            if !args.quiet {
                eprintln!(
                    "Finished after {} ticks: {} late, {} faults ({} continuity)",
                    report.ticks,
                    report.late_ticks,
                    report.faults.len(),
                    report.continuity_faults()
                );
                if let Some(ref path) = args.output {
                    eprintln!("Report written to {}", path);
                }
            }
            exit_codes::SUCCESS
        }
        Err(e) if e.is_halt() => {
            eprintln!("Session halted: {}", e);
            exit_codes::PIPELINE_HALTED
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_test_args() -> RunArgs {
        RunArgs {
            config: PathBuf::from("session.yaml"),
            name: None,
            period_ms: None,
            max_ticks: None,
            shm_dir: None,
            checkpoint_dir: None,
            output: None,
            compact: false,
            quiet: true,
        }
    }

    fn make_config() -> SessionConfig {
        SessionConfig::from_yaml_str("session: { name: file, period_ms: 20, max_ticks: 100 }\nmodules: []\n").unwrap()
    }

    #[test]
    fn test_no_overrides_keeps_file_values() {
        let mut config = make_config();
        apply_overrides(&mut config, &make_test_args());
        assert_eq!(config, make_config());
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = make_config();
        let args = RunArgs {
            name: Some("cli".to_string()),
            period_ms: Some(10.0),
            max_ticks: Some(3),
            shm_dir: Some(PathBuf::from("/dev/shm")),
            ..make_test_args()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.session.name, "cli");
        assert_eq!(config.session.period_ms, 10.0);
        assert_eq!(config.session.max_ticks, Some(3));
        assert_eq!(config.session.shm_dir, Some(PathBuf::from("/dev/shm")));
        assert_eq!(config.session.checkpoint_dir, None);
    }
}
