//! Block device mapping settings

use serde::{Deserialize, Serialize};

const IOPS_VOLUME_TYPES: &[&str] = &["io1", "io2", "gp3"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub volume_size: Option<i32>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub iops: Option<i32>,
    #[serde(default)]
    pub throughput: Option<i32>,
    #[serde(default)]
    pub delete_on_termination: Option<bool>,
    #[serde(default)]
    pub encrypted: Option<bool>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    /// Suppress a mapping inherited from the source image
    #[serde(default)]
    pub no_device: bool,
    /// `ephemeralN` instance store
    #[serde(default)]
    pub virtual_name: Option<String>,
    /// Surrogate builds only: keep the volume out of the registered image
    #[serde(default)]
    pub omit_from_artifact: bool,
}

impl BlockDevice {
    pub(crate) fn validate(&self, field: &str, errors: &mut Vec<String>) {
        if self.device_name.is_empty() {
            errors.push(format!("{}: device_name is required", field));
            return;
        }
        let prefix = format!("{} {}", field, self.device_name);

        if self.kms_key_id.is_some() && self.encrypted != Some(true) {
            errors.push(format!("{}: kms_key_id requires encrypted to be true", prefix));
        }

        let volume_type = self.volume_type.as_deref().unwrap_or("gp2");
        if self.iops.is_some() && !IOPS_VOLUME_TYPES.contains(&volume_type) {
            errors.push(format!(
                "{}: iops is only valid for io1, io2 and gp3 volumes",
                prefix
            ));
        }
        if let Some(throughput) = self.throughput {
            if volume_type != "gp3" {
                errors.push(format!("{}: throughput is only valid for gp3 volumes", prefix));
            } else if !(125..=1000).contains(&throughput) {
                errors.push(format!(
                    "{}: throughput must be between 125 and 1000 MiB/s",
                    prefix
                ));
            }
        }
        if self.no_device && (self.snapshot_id.is_some() || self.volume_size.is_some()) {
            errors.push(format!(
                "{}: no_device cannot be combined with volume settings",
                prefix
            ));
        }
    }

    pub fn is_ebs(&self) -> bool {
        !self.no_device && self.virtual_name.is_none()
    }
}

pub(crate) fn validate_all(field: &str, devices: &[BlockDevice], errors: &mut Vec<String>) {
    let mut names = Vec::new();
    for device in devices {
        device.validate(field, errors);
        if !device.device_name.is_empty() {
            if names.contains(&device.device_name) {
                errors.push(format!(
                    "{}: device {} is mapped twice",
                    field, device.device_name
                ));
            }
            names.push(device.device_name.clone());
        }
    }
}
