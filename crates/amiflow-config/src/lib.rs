//! amiflow template discovery, decoding and validation
//!
//! A template is a YAML file holding one or more builders and the shell
//! provisioners they share. [`load_template`] reads and validates one; every
//! problem is reported together in [`ConfigError::Invalid`].

pub mod access;
pub mod ami;
pub mod block_device;
pub mod builders;
pub mod duration;
pub mod error;
pub mod run;
pub mod template;

pub use access::{AccessConfig, MAX_ATTEMPTS_ENV, POLL_DELAY_ENV, Polling, PollingConfig};
pub use ami::{AmiConfig, DeregistrationProtection, FastLaunchConfig};
pub use block_device::BlockDevice;
pub use builders::{ChrootConfig, EbsConfig, RootDeviceConfig, SurrogateConfig};
pub use duration::parse_duration;
pub use error::*;
pub use run::{
    AmiFilter, CommConfig, MetadataOptionsConfig, PolicyDocument, PolicyStatement, RunConfig,
    SecurityGroupFilter, SourceConfig,
};
pub use template::{BuilderConfig, BuilderEntry, ShellProvisioner, Template, load_template};

use std::path::PathBuf;

pub const TEMPLATE_ENV: &str = "AMIFLOW_TEMPLATE";

/// amiflow's per-user config directory, created on first use
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("amiflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the template to build
///
/// Search order:
/// 1. `AMIFLOW_TEMPLATE` (direct path)
/// 2. current directory: amiflow.local.yaml, amiflow.yaml
/// 3. ./.amiflow/ with the same names
/// 4. ~/.config/amiflow/amiflow.yaml
pub fn find_template() -> Result<PathBuf> {
    if let Ok(template_path) = std::env::var(TEMPLATE_ENV) {
        let path = PathBuf::from(template_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = ["amiflow.local.yaml", "amiflow.yaml"];

    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(".amiflow");
    if project_dir.is_dir() {
        for filename in &candidates {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("amiflow").join("amiflow.yaml");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::TemplateNotFound)
}
