//! `ValueLoader`: the `{loader: <name>, ...}` variable form in `vars`.
//!
//! A loader turns one `vars` entry into a map of suffix → value; each
//! entry is exposed in the replacement map as `<varName><suffix>` (an
//! empty suffix yields the bare variable name).

mod env;
mod file;
mod pem;

use std::collections::HashMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unknown value loader {name:?}"))]
    UnknownLoader { name: String },

    #[snafu(display("loader {loader} missing required parameter {param:?}"))]
    MissingParameter { loader: &'static str, param: &'static str },

    #[snafu(display("loader {loader} failed to read file {path}: {source}"))]
    Io {
        loader: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("loader {loader} got invalid input: {message}"))]
    InvalidInput { loader: &'static str, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Loads the named loader's output for one `vars` entry.
///
/// `params` is the entry's mapping minus the `loader` key itself.
/// `base_dir` anchors relative `file` paths to the directory the config
/// file that declared this `vars` entry lives in.
pub fn load(name: &str, params: &Mapping, base_dir: &Path) -> Result<HashMap<String, Value>> {
    match name {
        "env" => env::load(),
        "file" => file::load(params, base_dir),
        "pem" => pem::load(params, base_dir),
        other => UnknownLoaderSnafu { name: other }.fail(),
    }
}

pub(crate) fn get_str<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    map.get(key)?.as_str()
}

pub(crate) fn resolve_path(base_dir: &Path, file: &str) -> std::path::PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
