use crate::cli::KindsArgs;
use crate::exit_codes;
use crate::output;
use raspy_rt::registry;

pub fn execute(args: KindsArgs) -> i32 {
    let kinds = registry::kinds();

    if args.json {
        if let Err(e) = output::emit(&kinds, false, None) {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    } else {
        println!("Built-in module kinds:\n");
        println!("  {:<14} {}", "Kind", "Description");
        println!("  {}", "-".repeat(64));
        for k in &kinds {
            println!("  {:<14} {}", k.kind, k.description);
        }
        println!();
        println!("Use `kind: <name>` in a session file's module entry.");
    }

    exit_codes::SUCCESS
}
