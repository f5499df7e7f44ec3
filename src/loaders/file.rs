//! The `file` loader: reads one file's contents, optionally base64-encoded.

use std::collections::HashMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use super::{get_str, resolve_path, InvalidInputSnafu, IoSnafu, MissingParameterSnafu, Result};

const LOADER: &str = "file";

pub fn load(params: &Mapping, base_dir: &Path) -> Result<HashMap<String, Value>> {
    let file = get_str(params, "file").ok_or(
        MissingParameterSnafu {
            loader: LOADER,
            param: "file",
        }
        .build(),
    )?;
    let encoding = get_str(params, "encoding").unwrap_or("utf-8");
    let conversion = get_str(params, "conversion");

    let path = resolve_path(base_dir, file);
    let bytes = std::fs::read(&path).map_err(|source| {
        IoSnafu {
            loader: LOADER,
            path: path.display().to_string(),
            source,
        }
        .build()
    })?;

    let text = match conversion {
        Some("base64") => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        }
        Some(other) => {
            return InvalidInputSnafu {
                loader: LOADER,
                message: format!("unknown conversion {other:?}"),
            }
            .fail()
        }
        None => {
            if encoding != "utf-8" {
                return InvalidInputSnafu {
                    loader: LOADER,
                    message: format!("unsupported encoding {encoding:?}"),
                }
                .fail();
            }
            String::from_utf8(bytes).map_err(|_| {
                InvalidInputSnafu {
                    loader: LOADER,
                    message: "file is not valid utf-8".to_string(),
                }
                .build()
            })?
        }
    };

    let mut out = HashMap::new();
    out.insert(String::new(), Value::String(text));
    Ok(out)
}
