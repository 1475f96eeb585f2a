use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Serialize a value to JSON (pretty or compact).
pub fn to_json<T: Serialize>(value: &T, compact: bool) -> Result<String, String> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    json.map_err(|e| format!("JSON serialization failed: {}", e))
}

/// Serialize `value` and write it to `path`, or stdout when unset.
pub fn emit<T: Serialize>(value: &T, compact: bool, path: Option<&str>) -> Result<(), String> {
    let json = to_json(value, compact)?;
    match path {
        Some(path) => std::fs::write(Path::new(path), json + "\n")
            .map_err(|e| format!("Failed to write output file '{}': {}", path, e)),
        None => {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{}", json).map_err(|e| format!("Failed to write to stdout: {}", e))
        }
    }
}
