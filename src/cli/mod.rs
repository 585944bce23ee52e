//! CLI command implementations.

pub mod host;
pub mod images;
pub mod params;

use std::path::Path;
use vmfixture::{Error, Params, Result};

/// Load the parameter file, if any, then apply `KEY=VALUE` overrides.
pub fn load_params(path: Option<&Path>, overrides: &[String]) -> Result<Params> {
    let mut params = match path {
        Some(path) => Params::load(path)?,
        None => Params::new(),
    };

    for pair in overrides {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::config(format!("invalid override '{}', expected KEY=VALUE", pair)))?;
        params.set(key.trim(), value);
    }
    Ok(params)
}
