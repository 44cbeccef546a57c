//! Per-builder configuration

use crate::access::AccessConfig;
use crate::ami::AmiConfig;
use crate::block_device::{BlockDevice, validate_all};
use crate::run::{RunConfig, SourceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ARCHITECTURES: &[&str] = &["x86_64", "arm64", "i386", "x86_64_mac", "arm64_mac"];
const BOOT_MODES: &[&str] = &["legacy-bios", "uefi", "uefi-preferred"];

fn default_architecture() -> String {
    "x86_64".to_string()
}

fn validate_boot_mode(boot_mode: &Option<String>, errors: &mut Vec<String>) {
    if let Some(mode) = boot_mode {
        if !BOOT_MODES.contains(&mode.as_str()) {
            errors.push(format!("unknown boot_mode '{}'", mode));
        }
    }
}

fn validate_architecture(architecture: &str, errors: &mut Vec<String>) {
    if !ARCHITECTURES.contains(&architecture) {
        errors.push(format!("unknown ami_architecture '{}'", architecture));
    }
}

/// `amazon-ebs`: boot an instance, provision it, image it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbsConfig {
    #[serde(flatten)]
    pub access: AccessConfig,
    #[serde(flatten)]
    pub ami: AmiConfig,
    #[serde(flatten)]
    pub run: RunConfig,
    #[serde(default)]
    pub ami_block_device_mappings: Vec<BlockDevice>,
    #[serde(default)]
    pub launch_block_device_mappings: Vec<BlockDevice>,
    /// Provision only; no image is created
    #[serde(default)]
    pub skip_create_ami: bool,
}

impl EbsConfig {
    pub fn prepare(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        self.access.prepare(&mut errors);
        self.ami.prepare(&self.access.region, &mut errors);
        self.run.prepare(&mut errors);
        validate_all("ami_block_device_mappings", &self.ami_block_device_mappings, &mut errors);
        validate_all(
            "launch_block_device_mappings",
            &self.launch_block_device_mappings,
            &mut errors,
        );
        errors
    }
}

/// Root device of an image registered from a surrogate volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDeviceConfig {
    /// Launch mapping whose snapshot becomes the root
    #[serde(default)]
    pub source_device_name: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub delete_on_termination: bool,
    #[serde(default)]
    pub volume_size: Option<i32>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub iops: Option<i32>,
    #[serde(default)]
    pub throughput: Option<i32>,
}

/// `amazon-ebssurrogate`: provision a secondary volume, promote it to root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurrogateConfig {
    #[serde(flatten)]
    pub access: AccessConfig,
    #[serde(flatten)]
    pub ami: AmiConfig,
    #[serde(flatten)]
    pub run: RunConfig,
    #[serde(default)]
    pub ami_block_device_mappings: Vec<BlockDevice>,
    #[serde(default)]
    pub launch_block_device_mappings: Vec<BlockDevice>,
    #[serde(default)]
    pub ami_root_device: RootDeviceConfig,
    #[serde(default = "default_architecture")]
    pub ami_architecture: String,
    #[serde(default)]
    pub boot_mode: Option<String>,
    /// Swap the surrogate in as root and use CreateImage instead of RegisterImage
    #[serde(default)]
    pub use_create_image: bool,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            access: AccessConfig::default(),
            ami: AmiConfig::default(),
            run: RunConfig::default(),
            ami_block_device_mappings: Vec::new(),
            launch_block_device_mappings: Vec::new(),
            ami_root_device: RootDeviceConfig::default(),
            ami_architecture: default_architecture(),
            boot_mode: None,
            use_create_image: false,
        }
    }
}

impl SurrogateConfig {
    pub fn prepare(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        self.access.prepare(&mut errors);
        self.ami.prepare(&self.access.region, &mut errors);
        self.run.prepare(&mut errors);
        validate_all("ami_block_device_mappings", &self.ami_block_device_mappings, &mut errors);
        validate_all(
            "launch_block_device_mappings",
            &self.launch_block_device_mappings,
            &mut errors,
        );
        validate_architecture(&self.ami_architecture, &mut errors);
        validate_boot_mode(&self.boot_mode, &mut errors);

        let root = &self.ami_root_device;
        if root.source_device_name.is_empty() || root.device_name.is_empty() {
            errors.push(
                "ami_root_device.source_device_name and ami_root_device.device_name are required"
                    .to_string(),
            );
        } else if !self
            .launch_block_device_mappings
            .iter()
            .any(|d| d.device_name == root.source_device_name)
        {
            errors.push(format!(
                "ami_root_device.source_device_name {} is not in launch_block_device_mappings",
                root.source_device_name
            ));
        }
        errors
    }
}

fn default_mount_path() -> String {
    "/mnt/amiflow-amazon-chroot-volumes/{{ device }}".to_string()
}

fn default_mount_partition() -> String {
    "1".to_string()
}

fn default_command_wrapper() -> String {
    "{{ command }}".to_string()
}

fn default_copy_files() -> Vec<String> {
    vec!["/etc/resolv.conf".to_string()]
}

fn default_chroot_mounts() -> Vec<[String; 3]> {
    [
        ["proc", "proc", "/proc"],
        ["sysfs", "sysfs", "/sys"],
        ["bind", "/dev", "/dev"],
        ["devpts", "devpts", "/dev/pts"],
        ["binfmt_misc", "binfmt_misc", "/proc/sys/fs/binfmt_misc"],
    ]
    .iter()
    .map(|m| m.map(str::to_string))
    .collect()
}

/// `amazon-chroot`: attach a volume to this host and provision it in a chroot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootConfig {
    #[serde(flatten)]
    pub access: AccessConfig,
    #[serde(flatten)]
    pub ami: AmiConfig,
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Start from an empty volume instead of a source image
    #[serde(default)]
    pub from_scratch: bool,
    #[serde(default)]
    pub ami_block_device_mappings: Vec<BlockDevice>,
    #[serde(default)]
    pub root_device_name: Option<String>,
    #[serde(default)]
    pub root_volume_size: Option<i32>,
    #[serde(default)]
    pub root_volume_type: Option<String>,
    #[serde(default)]
    pub root_volume_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub root_volume_encrypt_boot: Option<bool>,
    #[serde(default)]
    pub root_volume_kms_key_id: Option<String>,
    /// Fixed device path instead of the first free one
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default = "default_mount_partition")]
    pub mount_partition: String,
    #[serde(default)]
    pub mount_options: Vec<String>,
    #[serde(default = "default_chroot_mounts")]
    pub chroot_mounts: Vec<[String; 3]>,
    #[serde(default = "default_copy_files")]
    pub copy_files: Vec<String>,
    #[serde(default = "default_command_wrapper")]
    pub command_wrapper: String,
    #[serde(default)]
    pub pre_mount_commands: Vec<String>,
    #[serde(default)]
    pub post_mount_commands: Vec<String>,
    #[serde(default = "default_architecture")]
    pub ami_architecture: String,
    #[serde(default)]
    pub boot_mode: Option<String>,
}

impl Default for ChrootConfig {
    fn default() -> Self {
        Self {
            access: AccessConfig::default(),
            ami: AmiConfig::default(),
            source: SourceConfig::default(),
            from_scratch: false,
            ami_block_device_mappings: Vec::new(),
            root_device_name: None,
            root_volume_size: None,
            root_volume_type: None,
            root_volume_tags: BTreeMap::new(),
            root_volume_encrypt_boot: None,
            root_volume_kms_key_id: None,
            device_path: None,
            mount_path: default_mount_path(),
            mount_partition: default_mount_partition(),
            mount_options: Vec::new(),
            chroot_mounts: default_chroot_mounts(),
            copy_files: default_copy_files(),
            command_wrapper: default_command_wrapper(),
            pre_mount_commands: Vec::new(),
            post_mount_commands: Vec::new(),
            ami_architecture: default_architecture(),
            boot_mode: None,
        }
    }
}

impl ChrootConfig {
    pub fn prepare(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        self.access.prepare(&mut errors);
        self.ami.prepare(&self.access.region, &mut errors);
        validate_all("ami_block_device_mappings", &self.ami_block_device_mappings, &mut errors);
        validate_architecture(&self.ami_architecture, &mut errors);
        validate_boot_mode(&self.boot_mode, &mut errors);

        if self.from_scratch {
            if self.source.source_ami.is_some() || self.source.source_ami_filter.is_some() {
                errors.push(
                    "source_ami and source_ami_filter are unused when from_scratch is true"
                        .to_string(),
                );
            }
            if self.root_volume_size.is_none() {
                errors.push("root_volume_size is required when from_scratch is true".to_string());
            }
            if self.pre_mount_commands.is_empty() {
                errors.push(
                    "pre_mount_commands are required to partition the volume when from_scratch is true"
                        .to_string(),
                );
            }
            if self.ami_block_device_mappings.is_empty() {
                errors.push(
                    "ami_block_device_mappings are required when from_scratch is true".to_string(),
                );
            }
        } else {
            self.source.validate(&mut errors);
        }

        let needs_root_name = self.from_scratch || !self.ami_block_device_mappings.is_empty();
        if needs_root_name && self.root_device_name.is_none() {
            errors.push(
                "root_device_name is required with ami_block_device_mappings".to_string(),
            );
        }
        if let Some(root) = &self.root_device_name {
            if !self.ami_block_device_mappings.is_empty()
                && !self.ami_block_device_mappings.iter().any(|d| &d.device_name == root)
            {
                errors.push(format!(
                    "root_device_name {} is not in ami_block_device_mappings",
                    root
                ));
            }
        }

        if self.root_volume_kms_key_id.is_some() && self.root_volume_encrypt_boot != Some(true) {
            errors.push("root_volume_kms_key_id requires root_volume_encrypt_boot".to_string());
        }
        if !self.command_wrapper.contains("command") {
            errors.push("command_wrapper must reference {{ command }}".to_string());
        }
        if !self.mount_path.contains("device") && self.device_path.is_none() {
            // A fixed mount path would be shared between concurrent builds
            errors.push("mount_path must reference {{ device }}".to_string());
        }
        errors
    }
}
