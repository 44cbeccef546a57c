pub mod build;
pub mod validate;

use std::path::PathBuf;

/// Explicit `--template`, else the standard lookup
pub fn resolve_template(template: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match template {
        Some(path) => Ok(path),
        None => Ok(amiflow_config::find_template()?),
    }
}
