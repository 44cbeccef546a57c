//! Output image settings shared by every builder

use crate::duration::parse_duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregistrationProtection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub with_cooldown: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastLaunchConfig {
    #[serde(default)]
    pub enable_fast_launch: bool,
    #[serde(default)]
    pub max_parallel_launches: Option<i32>,
}

impl FastLaunchConfig {
    pub fn max_parallel_launches(&self) -> i32 {
        self.max_parallel_launches.unwrap_or(6)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiConfig {
    /// Name template for the output image
    #[serde(default)]
    pub ami_name: String,
    #[serde(default)]
    pub ami_description: Option<String>,
    #[serde(default)]
    pub ami_virtualization_type: Option<String>,
    #[serde(default)]
    pub ami_users: Vec<String>,
    #[serde(default)]
    pub ami_groups: Vec<String>,
    #[serde(default)]
    pub ami_org_arns: Vec<String>,
    #[serde(default)]
    pub ami_ou_arns: Vec<String>,
    #[serde(default)]
    pub ami_product_codes: Vec<String>,
    /// Regions to copy the image to
    #[serde(default)]
    pub ami_regions: Vec<String>,
    #[serde(default)]
    pub region_kms_key_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshot_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshot_users: Vec<String>,
    #[serde(default)]
    pub snapshot_groups: Vec<String>,
    #[serde(default)]
    pub ena_support: Option<bool>,
    #[serde(default)]
    pub sriov_support: bool,
    #[serde(default)]
    pub force_deregister: bool,
    #[serde(default)]
    pub force_delete_snapshot: bool,
    #[serde(default)]
    pub encrypt_boot: Option<bool>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    /// Do not keep an image in the build region
    #[serde(default)]
    pub skip_save_build_region: bool,
    /// RFC 3339 timestamp
    #[serde(default)]
    pub deprecate_at: Option<String>,
    #[serde(default)]
    pub imds_support: Option<String>,
    #[serde(default)]
    pub deregistration_protection: DeregistrationProtection,
    /// Bound on snapshot copy time for region copies (`2h`)
    #[serde(default)]
    pub snapshot_copy_completion_timeout: Option<String>,
    #[serde(default)]
    pub fast_launch: FastLaunchConfig,
}

impl AmiConfig {
    pub(crate) fn prepare(&mut self, build_region: &str, errors: &mut Vec<String>) {
        if self.ami_virtualization_type.is_none() {
            self.ami_virtualization_type = Some("hvm".to_string());
        }

        if self.ami_name.is_empty() {
            errors.push("ami_name must be specified".to_string());
        } else if self.ami_name.len() < 3 || self.ami_name.len() > 128 {
            errors.push("ami_name must be between 3 and 128 characters long".to_string());
        }

        if let Some(description) = &self.ami_description {
            if description.len() > 255 {
                errors.push("ami_description must be less than 255 characters".to_string());
            }
        }

        let mut seen = Vec::new();
        for region in &self.ami_regions {
            if seen.contains(region) {
                continue;
            }
            if region == build_region && !self.skip_save_build_region {
                // The build region always keeps its image
                continue;
            }
            if !self.region_kms_key_ids.is_empty() && !self.region_kms_key_ids.contains_key(region) {
                errors.push(format!(
                    "region {} is in ami_regions but not in region_kms_key_ids",
                    region
                ));
            }
            seen.push(region.clone());
        }
        for region in self.region_kms_key_ids.keys() {
            if region != build_region && !self.ami_regions.contains(region) {
                errors.push(format!(
                    "region {} is in region_kms_key_ids but not in ami_regions",
                    region
                ));
            }
        }

        if self.kms_key_id.is_some() && self.encrypt_boot != Some(true) {
            errors.push("kms_key_id requires encrypt_boot to be true".to_string());
        }
        if self.encrypt_boot == Some(false) && !self.region_kms_key_ids.is_empty() {
            errors.push("region_kms_key_ids cannot be used with encrypt_boot false".to_string());
        }
        if self.force_delete_snapshot && !self.force_deregister {
            errors.push("force_delete_snapshot requires force_deregister".to_string());
        }
        if self.skip_save_build_region && self.ami_regions.is_empty() {
            errors.push(
                "skip_save_build_region requires at least one region in ami_regions".to_string(),
            );
        }

        if let Some(value) = &self.imds_support {
            if value != "v2.0" {
                errors.push(format!("imds_support must be 'v2.0', got '{}'", value));
            }
        }
        if let Some(at) = &self.deprecate_at {
            if DateTime::parse_from_rfc3339(at).is_err() {
                errors.push(format!("deprecate_at '{}' is not an RFC 3339 timestamp", at));
            }
        }
        if let Some(timeout) = &self.snapshot_copy_completion_timeout {
            match parse_duration(timeout) {
                Ok(d) if d.as_secs() < 15 * 60 || d.as_secs() > 2880 * 60 => errors.push(
                    "snapshot_copy_completion_timeout must be between 15m and 48h".to_string(),
                ),
                Ok(_) => {}
                Err(e) => errors.push(format!("snapshot_copy_completion_timeout: {}", e)),
            }
        }
        if let Some(parallel) = self.fast_launch.max_parallel_launches {
            if parallel < 6 {
                errors.push("fast_launch.max_parallel_launches must be at least 6".to_string());
            }
        }
    }

    pub fn deprecate_at(&self) -> Option<DateTime<Utc>> {
        self.deprecate_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    /// Whole minutes of the region-copy completion bound
    pub fn snapshot_copy_completion_minutes(&self) -> Option<i64> {
        self.snapshot_copy_completion_timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .map(|d| (d.as_secs() / 60) as i64)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypt_boot == Some(true)
    }
}
