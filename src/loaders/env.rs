//! The `env` loader: exposes every environment variable of the current
//! process, keyed by its own name (suffix `""`, i.e. the key itself
//! becomes the variable's value — see [`super::load`]'s suffix scheme,
//! used here with each env var name acting as both the outer `vars` name
//! and its own suffix).

use std::collections::HashMap;

use serde_yaml::Value;

use super::Result;

pub fn load() -> Result<HashMap<String, Value>> {
    Ok(std::env::vars()
        .map(|(k, v)| (k, Value::String(v)))
        .collect())
}
