use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // RUST_LOG, when set, refines the -v level per module
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .format_timestamp_micros()
        .format_target(cli.verbose >= 2)
        .init();

    let exit_code = match cli.command {
        cli::Command::Run(args) => commands::run::execute(args),
        cli::Command::Validate(args) => commands::validate::execute(args),
        cli::Command::Kinds(args) => commands::kinds::execute(args),
        cli::Command::Info(args) => commands::info::execute(args),
    };

    std::process::exit(exit_code);
}
