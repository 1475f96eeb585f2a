use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use raspy_rt::registry;
use raspy_rt::SessionConfig;
use serde::Serialize;

#[derive(Serialize)]
struct ValidateOutput {
    config: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<raspy_rt::SessionPlan>,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let path = args.config.display().to_string();
    let (plan, error, code) = match SessionConfig::load(&args.config) {
        Err(e) => (None, Some(e.to_string()), exit_codes::INPUT_ERROR),
        Ok(config) => match registry::validate(&config) {
            Ok(plan) => (Some(plan), None, exit_codes::SUCCESS),
            Err(fault) => (None, Some(fault.to_string()), exit_codes::INPUT_ERROR),
        },
    };

    let result = ValidateOutput {
        config: path,
        valid: error.is_none(),
        plan,
        error,
    };

    if args.json {
        if let Err(e) = output::emit(&result, false, None) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else if let Some(ref err) = result.error {
        eprintln!("Error: {}", err);
    } else if let Some(ref plan) = result.plan {
        println!(
            "Session '{}' is valid: {} modules, {} signals, {} bytes mapped",
            plan.session,
            plan.order.len(),
            plan.signals.len(),
            plan.mapped_bytes
        );
        println!("Tick order: {}", plan.order.join(" -> "));
    }

    code
}
