use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "raspy",
    version,
    about = "Real-time closed-loop BCI session runner",
    long_about = "Run, validate and inspect raspy-rt sessions.\n\
                  A session file (YAML) declares the tick period and the modules, their\n\
                  signals and dependencies. Set $RASPY_SHM_DIR to back signals with files."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a session until it quits, reaches its tick limit or halts
    Run(RunArgs),
    /// Check a session file without spawning anything
    Validate(ValidateArgs),
    /// List the built-in module kinds
    Kinds(KindsArgs),
    /// Show version and platform information
    Info(InfoArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Session file (YAML)
    #[arg(value_name = "SESSION")]
    pub config: PathBuf,

    /// Override the session name
    #[arg(long)]
    pub name: Option<String>,

    /// Override the tick period in milliseconds
    #[arg(long, value_parser = parse_period_ms)]
    pub period_ms: Option<f64>,

    /// Stop after this many ticks
    #[arg(long, visible_alias = "ticks")]
    pub max_ticks: Option<u64>,

    /// Back signals with files under this directory
    #[arg(long, env = "RASPY_SHM_DIR")]
    pub shm_dir: Option<PathBuf>,

    /// Where decoders export their checkpoints
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Write the session report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<String>,

    /// Print the session report on a single line
    #[arg(long)]
    pub compact: bool,

    /// Only print the session report; no tick progress on stderr
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Session file (YAML)
    #[arg(value_name = "SESSION")]
    pub config: PathBuf,

    /// Print the tick order and signal layout as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct KindsArgs {
    /// Print module kinds and descriptions as a JSON array
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    /// Print version and default timing as a JSON object
    #[arg(long)]
    pub json: bool,
}

/// Tick period in milliseconds; finite and positive.
pub fn parse_period_ms(s: &str) -> Result<f64, String> {
    let value = s
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("Invalid period '{}': expected milliseconds, e.g. 50 or 12.5", s))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("Invalid period '{}': must be greater than zero", s));
    }
    Ok(value)
}
