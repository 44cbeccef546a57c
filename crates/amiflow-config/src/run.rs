//! Source instance, source image and communicator settings

use crate::duration::parse_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiFilter {
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub owners: Vec<String>,
    /// Pick the newest match instead of failing on several
    #[serde(default)]
    pub most_recent: bool,
}

/// Where the source image comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub source_ami: Option<String>,
    #[serde(default)]
    pub source_ami_filter: Option<AmiFilter>,
}

impl SourceConfig {
    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        match (&self.source_ami, &self.source_ami_filter) {
            (None, None) => {
                errors.push("a source_ami or source_ami_filter must be specified".to_string())
            }
            (Some(_), Some(_)) => errors.push(
                "only one of source_ami or source_ami_filter can be specified".to_string(),
            ),
            (None, Some(filter)) if filter.filters.is_empty() && filter.owners.is_empty() => errors
                .push("source_ami_filter needs at least one filter or owner".to_string()),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupFilter {
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

/// IAM policy document for a temporary instance profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    #[serde(default = "default_policy_version")]
    pub version: String,
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    #[serde(default = "default_effect")]
    pub effect: String,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

fn default_policy_version() -> String {
    "2012-10-17".to_string()
}

fn default_effect() -> String {
    "Allow".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOptionsConfig {
    #[serde(default = "default_http_endpoint")]
    pub http_endpoint: String,
    #[serde(default)]
    pub http_tokens: Option<String>,
    #[serde(default = "default_hop_limit")]
    pub http_put_response_hop_limit: i32,
    #[serde(default)]
    pub instance_metadata_tags: Option<String>,
}

impl Default for MetadataOptionsConfig {
    fn default() -> Self {
        Self {
            http_endpoint: default_http_endpoint(),
            http_tokens: None,
            http_put_response_hop_limit: default_hop_limit(),
            instance_metadata_tags: None,
        }
    }
}

fn default_http_endpoint() -> String {
    "enabled".to_string()
}

fn default_hop_limit() -> i32 {
    1
}

/// How provisioning reaches the machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommConfig {
    /// `ssh` or `none`
    #[serde(default = "default_communicator")]
    pub communicator: String,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: String,
    #[serde(default)]
    pub ssh_private_key_file: Option<PathBuf>,
    /// Existing key pair; requires `ssh_private_key_file`
    #[serde(default)]
    pub ssh_keypair_name: Option<String>,
    /// `public_ip`, `private_ip` or `public_dns`
    #[serde(default)]
    pub ssh_interface: Option<String>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            communicator: default_communicator(),
            ssh_username: None,
            ssh_port: default_ssh_port(),
            ssh_timeout: default_ssh_timeout(),
            ssh_private_key_file: None,
            ssh_keypair_name: None,
            ssh_interface: None,
        }
    }
}

fn default_communicator() -> String {
    "ssh".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout() -> String {
    "5m".to_string()
}

impl CommConfig {
    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        match self.communicator.as_str() {
            "none" => return,
            "ssh" => {}
            other => {
                errors.push(format!("communicator must be 'ssh' or 'none', got '{}'", other));
                return;
            }
        }
        if self.ssh_username.as_deref().unwrap_or_default().is_empty() {
            errors.push("ssh_username must be specified".to_string());
        }
        if let Err(e) = parse_duration(&self.ssh_timeout) {
            errors.push(format!("ssh_timeout: {}", e));
        }
        if self.ssh_keypair_name.is_some() && self.ssh_private_key_file.is_none() {
            errors.push("ssh_keypair_name requires ssh_private_key_file".to_string());
        }
        if let Some(interface) = &self.ssh_interface {
            if !["public_ip", "private_ip", "public_dns"].contains(&interface.as_str()) {
                errors.push(format!("unknown ssh_interface '{}'", interface));
            }
        }
    }

    pub fn uses_ssh(&self) -> bool {
        self.communicator == "ssh"
    }

    pub fn ssh_timeout(&self) -> Duration {
        parse_duration(&self.ssh_timeout).unwrap_or(Duration::from_secs(300))
    }
}

/// Settings for the instance a build launches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub security_group_filter: Option<SecurityGroupFilter>,
    #[serde(default)]
    pub temporary_security_group_source_cidrs: Vec<String>,
    #[serde(default)]
    pub temporary_security_group_source_public_ip: bool,
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    #[serde(default)]
    pub temporary_iam_instance_profile_policy_document: Option<PolicyDocument>,
    #[serde(default)]
    pub temporary_iam_instance_profile_managed_policies: Vec<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub user_data_file: Option<PathBuf>,
    #[serde(default)]
    pub associate_public_ip_address: Option<bool>,
    #[serde(default)]
    pub ebs_optimized: bool,
    #[serde(default)]
    pub enable_unlimited_credits: bool,
    #[serde(default)]
    pub metadata_options: MetadataOptionsConfig,
    #[serde(default)]
    pub tenancy: Option<String>,
    #[serde(default)]
    pub shutdown_behavior: Option<String>,
    #[serde(default)]
    pub run_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub run_volume_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub disable_stop_instance: bool,
    #[serde(flatten)]
    pub comm: CommConfig,
}

impl RunConfig {
    pub(crate) fn prepare(&mut self, errors: &mut Vec<String>) {
        self.source.validate(errors);
        self.comm.validate(errors);

        if self.instance_type.is_empty() {
            errors.push("instance_type must be specified".to_string());
        }
        if self.shutdown_behavior.is_none() {
            self.shutdown_behavior = Some("stop".to_string());
        }
        if let Some(behavior) = &self.shutdown_behavior {
            if behavior != "stop" && behavior != "terminate" {
                errors.push(format!(
                    "shutdown_behavior must be 'stop' or 'terminate', got '{}'",
                    behavior
                ));
            }
        }
        if let Some(tenancy) = &self.tenancy {
            if !["default", "dedicated", "host"].contains(&tenancy.as_str()) {
                errors.push(format!("unknown tenancy '{}'", tenancy));
            }
        }

        if !self.security_group_ids.is_empty() && self.security_group_filter.is_some() {
            errors.push(
                "only one of security_group_ids or security_group_filter can be specified"
                    .to_string(),
            );
        }
        if self.temporary_security_group_source_public_ip
            && !self.temporary_security_group_source_cidrs.is_empty()
        {
            errors.push(
                "temporary_security_group_source_public_ip cannot be combined with \
                 temporary_security_group_source_cidrs"
                    .to_string(),
            );
        }

        let temporary_profile = self.temporary_iam_instance_profile_policy_document.is_some()
            || !self.temporary_iam_instance_profile_managed_policies.is_empty();
        if self.iam_instance_profile.is_some() && temporary_profile {
            errors.push(
                "iam_instance_profile cannot be combined with a temporary instance profile"
                    .to_string(),
            );
        }
        if let Some(document) = &self.temporary_iam_instance_profile_policy_document {
            if document.statement.is_empty() {
                errors.push(
                    "temporary_iam_instance_profile_policy_document needs at least one Statement"
                        .to_string(),
                );
            }
        }

        if self.user_data.is_some() && self.user_data_file.is_some() {
            errors.push("only one of user_data or user_data_file can be specified".to_string());
        }
        if let Some(path) = &self.user_data_file {
            if !path.exists() {
                errors.push(format!("user_data_file {} does not exist", path.display()));
            }
        }

        if self.enable_unlimited_credits && !self.instance_type.starts_with('t') {
            errors.push(
                "enable_unlimited_credits is only supported for burstable (t*) instance types"
                    .to_string(),
            );
        }

        let meta = &self.metadata_options;
        if meta.http_endpoint != "enabled" && meta.http_endpoint != "disabled" {
            errors.push("metadata_options.http_endpoint must be 'enabled' or 'disabled'".to_string());
        }
        if let Some(tokens) = &meta.http_tokens {
            if tokens != "optional" && tokens != "required" {
                errors.push("metadata_options.http_tokens must be 'optional' or 'required'".to_string());
            }
        }
        if !(1..=64).contains(&meta.http_put_response_hop_limit) {
            errors.push(
                "metadata_options.http_put_response_hop_limit must be between 1 and 64".to_string(),
            );
        }
    }

    /// Plain-text user data from the template or its file
    pub fn load_user_data(&self) -> std::io::Result<Option<String>> {
        match (&self.user_data, &self.user_data_file) {
            (Some(data), _) => Ok(Some(data.clone())),
            (None, Some(path)) => std::fs::read_to_string(path).map(Some),
            (None, None) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RunConfig {
        RunConfig {
            source: SourceConfig {
                source_ami: Some("ami-123".into()),
                source_ami_filter: None,
            },
            instance_type: "t3.micro".into(),
            comm: CommConfig {
                ssh_username: Some("ubuntu".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_run_config() {
        let mut run = valid();
        let mut errors = Vec::new();
        run.prepare(&mut errors);
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(run.shutdown_behavior.as_deref(), Some("stop"));
        assert_eq!(run.comm.ssh_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_conflicts_collected() {
        let mut run = valid();
        run.source.source_ami_filter = Some(AmiFilter {
            owners: vec!["self".into()],
            ..Default::default()
        });
        run.iam_instance_profile = Some("builder".into());
        run.temporary_iam_instance_profile_managed_policies =
            vec!["arn:aws:iam::aws:policy/ReadOnlyAccess".into()];
        run.comm.ssh_keypair_name = Some("mine".into());

        let mut errors = Vec::new();
        run.prepare(&mut errors);
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_none_communicator_needs_no_username() {
        let mut run = valid();
        run.comm = CommConfig {
            communicator: "none".into(),
            ..Default::default()
        };
        let mut errors = Vec::new();
        run.prepare(&mut errors);
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(!run.comm.uses_ssh());
    }

    #[test]
    fn test_policy_document_yaml() {
        let yaml = r#"
Statement:
  - Action: ["s3:GetObject"]
    Resource: ["*"]
"#;
        let doc: PolicyDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.version, "2012-10-17");
        assert_eq!(doc.statement[0].effect, "Allow");
    }
}
