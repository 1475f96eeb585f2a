use crate::cli::InfoArgs;
use crate::exit_codes;
use crate::output;
use raspy_rt::config::SessionSection;
use serde::Serialize;

#[derive(Serialize)]
struct InfoOutput {
    cli_version: String,
    platform: String,
    arch: String,
    default_period_ms: f64,
    default_late_tolerance_ms: f64,
    shm_dir: Option<String>,
}

pub fn execute(args: InfoArgs) -> i32 {
    let defaults = SessionSection::default();
    let info = InfoOutput {
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        default_period_ms: defaults.period_ms,
        default_late_tolerance_ms: defaults.late_tolerance_ms,
        shm_dir: std::env::var("RASPY_SHM_DIR").ok(),
    };

    if args.json {
        if let Err(e) = output::emit(&info, false, None) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        println!("raspy CLI v{}", info.cli_version);
        println!("Platform: {} ({})", info.platform, info.arch);
        println!();
        println!(
            "Default tick: {} ms (late after {} ms)",
            info.default_period_ms, info.default_late_tolerance_ms
        );
        match info.shm_dir {
            Some(ref dir) => println!("Signal segments: files under {}", dir),
            None => println!("Signal segments: anonymous mappings ($RASPY_SHM_DIR unset)"),
        }
    }

    exit_codes::SUCCESS
}
