//! Built-in module variants.
//!
//! Each variant converts its free-form `params` into a typed parameter
//! struct and checks the shapes of the signals it was wired to before
//! anything is spawned. [`crate::registry`] dispatches on the kind tag.

pub mod acquisition;
pub mod decoder;
pub mod features;
pub mod filter;
pub mod source;
pub mod task;

pub use acquisition::{Acquisition, AcquisitionParams, PackageCounter};
pub use decoder::{CldaDecoder, CldaParams};
pub use features::{FeatureModel, FeatureParams, Features};
pub use filter::{Filter, FilterParams};
pub use source::{open_source, AcquisitionSource, Pacing, SampleBlock, SourceConfig, Waveform};
pub use task::{CenterOutTask, TaskParams};

use crate::config::{InputConfig, ModuleConfig, OutputConfig};
use crate::error::ConstructionFault;
use serde::de::DeserializeOwned;

/// Typed parameters of a module; an absent `params` block means defaults
pub(crate) fn parse_params<T: DeserializeOwned + Default>(config: &ModuleConfig) -> Result<T, ConstructionFault> {
    if config.params.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(config.params.clone()).map_err(|e| {
        ConstructionFault::InvalidConfig(format!("module '{}' ({}): {}", config.name, config.kind, e))
    })
}

fn invalid(config: &ModuleConfig, message: String) -> ConstructionFault {
    ConstructionFault::InvalidConfig(format!("module '{}' ({}): {}", config.name, config.kind, message))
}

/// The named output, or the first output of the requested kind
pub(crate) fn output<'a>(
    config: &'a ModuleConfig,
    name: Option<&str>,
    stream: bool,
) -> Result<&'a OutputConfig, ConstructionFault> {
    let found = match name {
        Some(name) => config.outputs.iter().find(|o| o.name == name),
        None => config.outputs.iter().find(|o| o.stream == stream),
    };
    let out = found.ok_or_else(|| {
        invalid(
            config,
            match name {
                Some(name) => format!("output '{}' is not declared", name),
                None => format!("needs a {} output", if stream { "stream" } else { "snapshot" }),
            },
        )
    })?;
    if out.stream != stream {
        return Err(invalid(
            config,
            format!(
                "output '{}' must be a {} signal",
                out.name,
                if stream { "stream" } else { "snapshot" }
            ),
        ));
    }
    Ok(out)
}

/// Shape of an output as a flat element count
pub(crate) fn output_len(out: &OutputConfig) -> usize {
    out.shape.iter().product()
}

pub(crate) fn expect_len(out: &OutputConfig, len: usize) -> Result<(), ConstructionFault> {
    if output_len(out) != len {
        return Err(ConstructionFault::ShapeMismatch {
            signal: out.name.clone(),
            expected: vec![len],
            found: out.shape.clone(),
        });
    }
    Ok(())
}

/// The named input, or the only input when there is exactly one
pub(crate) fn input(config: &ModuleConfig, name: Option<&str>) -> Result<String, ConstructionFault> {
    let names: Vec<&str> = config.inputs.iter().map(InputConfig::name).collect();
    match name {
        Some(name) if names.contains(&name) => Ok(name.to_string()),
        Some(name) => Err(invalid(config, format!("input '{}' is not declared", name))),
        None if names.len() == 1 => Ok(names[0].to_string()),
        None => Err(invalid(
            config,
            format!("cannot pick an input from {:?}; name it in params", names),
        )),
    }
}
