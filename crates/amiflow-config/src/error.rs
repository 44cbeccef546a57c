use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error(
        "Template not found. Looked in:\n\
        - current directory: amiflow.local.yaml, amiflow.yaml\n\
        - ./.amiflow/ directory\n\
        - ~/.config/amiflow/amiflow.yaml\n\
        Set AMIFLOW_TEMPLATE to point at a template directly"
    )]
    TemplateNotFound,

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid template:\n{}", bullets(.0))]
    Invalid(Vec<String>),

    #[error("No builder named '{0}' in template")]
    UnknownBuilder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn bullets(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  * {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
