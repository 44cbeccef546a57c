//! Build template: builders plus the provisioning commands they share

use crate::access::AccessConfig;
use crate::builders::{ChrootConfig, EbsConfig, SurrogateConfig};
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuilderConfig {
    #[serde(rename = "amazon-ebs")]
    Ebs(Box<EbsConfig>),
    #[serde(rename = "amazon-chroot")]
    Chroot(Box<ChrootConfig>),
    #[serde(rename = "amazon-ebssurrogate")]
    Surrogate(Box<SurrogateConfig>),
}

impl BuilderConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            BuilderConfig::Ebs(_) => "amazon-ebs",
            BuilderConfig::Chroot(_) => "amazon-chroot",
            BuilderConfig::Surrogate(_) => "amazon-ebssurrogate",
        }
    }

    pub fn access(&self) -> &AccessConfig {
        match self {
            BuilderConfig::Ebs(c) => &c.access,
            BuilderConfig::Chroot(c) => &c.access,
            BuilderConfig::Surrogate(c) => &c.access,
        }
    }

    fn prepare(&mut self) -> Vec<String> {
        match self {
            BuilderConfig::Ebs(c) => c.prepare(),
            BuilderConfig::Chroot(c) => c.prepare(),
            BuilderConfig::Surrogate(c) => c.prepare(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderEntry {
    /// Defaults to the builder type
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: BuilderConfig,
}

impl BuilderEntry {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.type_name())
    }
}

/// Commands run on the machine being imaged, in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellProvisioner {
    #[serde(default)]
    pub inline: Vec<String>,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
}

impl ShellProvisioner {
    /// Each inline command prefixed with the provisioner's environment
    pub fn commands(&self) -> Vec<String> {
        let env: String = self
            .environment_vars
            .iter()
            .map(|(k, v)| format!("{}='{}' ", k, v.replace('\'', "'\\''")))
            .collect();
        self.inline.iter().map(|c| format!("{}{}", env, c)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub builders: Vec<BuilderEntry>,
    #[serde(default)]
    pub provisioners: Vec<ShellProvisioner>,
}

impl Template {
    pub fn from_yaml(path: &Path, content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate and default every builder, reporting all problems at once
    pub fn prepare(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        if self.builders.is_empty() {
            errors.push("at least one builder is required".to_string());
        }

        let mut names: Vec<String> = Vec::new();
        for entry in &mut self.builders {
            let name = entry.name().to_string();
            if names.contains(&name) {
                errors.push(format!("builder name '{}' is used twice", name));
            }
            for error in entry.kind.prepare() {
                errors.push(format!("{}: {}", name, error));
            }
            names.push(name);
        }

        for (i, provisioner) in self.provisioners.iter().enumerate() {
            if provisioner.inline.is_empty() {
                errors.push(format!("provisioner {}: inline must not be empty", i));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn builder(&self, name: &str) -> Result<&BuilderEntry> {
        self.builders
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| ConfigError::UnknownBuilder(name.to_string()))
    }

    /// All provisioning commands in template order
    pub fn commands(&self) -> Vec<String> {
        self.provisioners.iter().flat_map(|p| p.commands()).collect()
    }
}

/// Read, decode and validate a template file
pub fn load_template(path: &Path) -> Result<Template> {
    let content = std::fs::read_to_string(path)?;
    let mut template = Template::from_yaml(path, &content)?;
    template.prepare()?;
    Ok(template)
}
