//! Cloud capability traits
//!
//! The build steps only talk to the cloud through these traits. The AWS SDK
//! implementation lives in `amiflow-aws`; tests use the in-memory fake.

use crate::error::{CloudError, Result};
use crate::model::{
    BlockDeviceMapping, Image, Instance, InstanceProfile, KeyPair, SecurityGroup, Snapshot,
    Subnet, Tag, Volume,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A describe filter (`name=tag:Role`, `values=["builder"]`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageQuery {
    pub image_ids: Vec<String>,
    pub owners: Vec<String>,
    pub filters: Vec<Filter>,
}

impl ImageQuery {
    pub fn by_id(image_id: impl Into<String>) -> Self {
        Self {
            image_ids: vec![image_id.into()],
            ..Default::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            filters: vec![Filter::new("name", vec![name.into()])],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroupQuery {
    pub group_ids: Vec<String>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataOptions {
    pub http_endpoint: Option<String>,
    pub http_tokens: Option<String>,
    pub http_put_response_hop_limit: Option<i32>,
    pub instance_metadata_tags: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub availability_zone: Option<String>,
    pub security_group_ids: Vec<String>,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    /// Plain text; the adapter encodes it
    pub user_data: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub tags: Vec<Tag>,
    pub volume_tags: Vec<Tag>,
    /// Apply tags in the launch request itself
    pub tag_on_create: bool,
    pub associate_public_ip: Option<bool>,
    pub ebs_optimized: bool,
    pub metadata_options: Option<MetadataOptions>,
    /// `standard` or `unlimited` for burstable types
    pub credit_specification: Option<String>,
    pub tenancy: Option<String>,
    pub shutdown_behavior: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateImageRequest {
    pub instance_id: String,
    pub name: String,
    pub description: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterImageRequest {
    pub name: String,
    pub description: Option<String>,
    pub architecture: Option<String>,
    pub virtualization_type: Option<String>,
    pub root_device_name: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub ena_support: Option<bool>,
    pub sriov_net_support: Option<String>,
    pub boot_mode: Option<String>,
    pub imds_support: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyImageRequest {
    pub source_region: String,
    pub source_image_id: String,
    pub name: String,
    pub description: Option<String>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    /// Time-based copy: the provider completes snapshot copies within this bound
    pub completion_duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub availability_zone: String,
    pub snapshot_id: Option<String>,
    pub size: Option<i32>,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    pub encrypted: Option<bool>,
    pub kms_key_id: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: String,
    pub port: u16,
    pub cidr_blocks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchPermissions {
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub organization_arns: Vec<String>,
    pub organizational_unit_arns: Vec<String>,
}

impl LaunchPermissions {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.groups.is_empty()
            && self.organization_arns.is_empty()
            && self.organizational_unit_arns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAttribute {
    Description(String),
    LaunchPermission(LaunchPermissions),
    ProductCodes(Vec<String>),
    /// `v2.0` requires IMDSv2 for instances launched from the image
    ImdsSupport(String),
}

/// Compute and image operations in one region
#[async_trait]
pub trait ComputeApi: Send + Sync {
    fn region(&self) -> &str;

    async fn describe_images(&self, query: &ImageQuery) -> Result<Vec<Image>>;

    async fn describe_image(&self, image_id: &str) -> Result<Image> {
        self.describe_images(&ImageQuery::by_id(image_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::ResourceNotFound(image_id.to_string()))
    }

    /// Launch one instance and return its ID
    async fn run_instance(&self, request: &RunInstanceRequest) -> Result<String>;
    async fn describe_instance(&self, instance_id: &str) -> Result<Instance>;
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()>;

    async fn describe_subnet(&self, subnet_id: &str) -> Result<Subnet>;
    async fn describe_security_groups(&self, query: &SecurityGroupQuery)
    -> Result<Vec<SecurityGroup>>;
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> Result<String>;
    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> Result<()>;
    async fn delete_security_group(&self, group_id: &str) -> Result<()>;

    async fn create_key_pair(&self, name: &str) -> Result<KeyPair>;
    async fn delete_key_pair(&self, name: &str) -> Result<()>;

    async fn create_image(&self, request: &CreateImageRequest) -> Result<String>;
    async fn register_image(&self, request: &RegisterImageRequest) -> Result<String>;
    /// Issued against the destination region's client
    async fn copy_image(&self, request: &CopyImageRequest) -> Result<String>;
    async fn deregister_image(&self, image_id: &str) -> Result<()>;

    async fn create_snapshot(&self, volume_id: &str, description: &str, tags: &[Tag])
    -> Result<String>;
    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String>;
    async fn describe_volume(&self, volume_id: &str) -> Result<Volume>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn detach_volume(&self, volume_id: &str) -> Result<()>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    async fn modify_image_attribute(&self, image_id: &str, attribute: &ImageAttribute)
    -> Result<()>;
    async fn add_create_volume_permission(
        &self,
        snapshot_id: &str,
        users: &[String],
        groups: &[String],
    ) -> Result<()>;

    async fn enable_image_deprecation(&self, image_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn enable_deregistration_protection(&self, image_id: &str, with_cooldown: bool)
    -> Result<()>;

    async fn enable_fast_launch(&self, image_id: &str, max_parallel_launches: i32) -> Result<()>;
    async fn fast_launch_state(&self, image_id: &str) -> Result<String>;
}

/// IAM operations used for temporary instance profiles
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn create_role(&self, name: &str, assume_role_policy: &str, tags: &[Tag]) -> Result<()>;
    async fn get_role(&self, name: &str) -> Result<()>;
    async fn delete_role(&self, name: &str) -> Result<()>;

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> Result<()>;
    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> Result<()>;
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()>;
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()>;

    async fn create_instance_profile(&self, name: &str, tags: &[Tag]) -> Result<()>;
    async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile>;
    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<()>;
    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str) -> Result<()>;
    async fn delete_instance_profile(&self, name: &str) -> Result<()>;
}

/// Opens region-scoped compute clients for cross-region work
#[async_trait]
pub trait RegionalClients: Send + Sync {
    async fn compute(&self, region: &str) -> Result<Arc<dyn ComputeApi>>;
}

/// Facts about the machine running the build
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Instance ID of the host, from instance metadata
    async fn instance_id(&self) -> Result<String>;

    /// The caller's public IPv4 address as seen from the internet
    async fn public_ip(&self) -> Result<String>;
}

/// Every client a build needs, for the build region
#[derive(Clone)]
pub struct CloudClients {
    pub compute: Arc<dyn ComputeApi>,
    pub identity: Arc<dyn IdentityApi>,
    pub regions: Arc<dyn RegionalClients>,
    pub host: Arc<dyn HostProbe>,
}

impl CloudClients {
    pub fn region(&self) -> &str {
        self.compute.region()
    }
}
