//! AWS provider for amiflow
//!
//! This crate implements the amiflow capability traits on top of the AWS SDK:
//!
//! - [`Ec2Compute`]: instances, images, snapshots, volumes, security groups
//! - [`IamIdentity`]: temporary roles and instance profiles
//! - [`AwsRegions`]: region-scoped EC2 clients for cross-region copies
//! - [`AwsHost`]: instance metadata (chroot builds) and public IP discovery
//!
//! Credentials come from the default AWS provider chain.
//!
//! # Example
//!
//! ```ignore
//! use amiflow_aws::{AwsOptions, connect};
//!
//! let clients = connect(&AwsOptions::new("us-east-1")).await?;
//! let image = clients.compute.describe_image("ami-0123456789abcdef0").await?;
//! ```

mod convert;
mod error;

pub mod ec2;
pub mod host;
pub mod iam;

pub use ec2::Ec2Compute;
pub use host::{AwsHost, DEFAULT_CHECK_IP_URL};
pub use iam::IamIdentity;

use amiflow_cloud::{CloudClients, ComputeApi, RegionalClients, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;

/// Connection settings for one build
#[derive(Debug, Clone)]
pub struct AwsOptions {
    pub region: String,
    /// Named profile from the shared config files
    pub profile: Option<String>,
    /// SDK-level attempts per request, `None` keeps the SDK default
    pub max_retries: Option<u32>,
    pub check_ip_url: String,
}

impl AwsOptions {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            profile: None,
            max_retries: None,
            check_ip_url: DEFAULT_CHECK_IP_URL.to_string(),
        }
    }
}

/// Hands out EC2 clients for other regions sharing the base credentials
pub struct AwsRegions {
    base: SdkConfig,
}

impl AwsRegions {
    pub fn new(base: SdkConfig) -> Self {
        Self { base }
    }
}

#[async_trait]
impl RegionalClients for AwsRegions {
    async fn compute(&self, region: &str) -> Result<Arc<dyn ComputeApi>> {
        let config = aws_sdk_ec2::config::Builder::from(&self.base)
            .region(Region::new(region.to_string()))
            .build();
        Ok(Arc::new(Ec2Compute::new(
            aws_sdk_ec2::Client::from_conf(config),
            region,
        )))
    }
}

/// Load the SDK configuration
pub async fn load_sdk_config(options: &AwsOptions) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(options.region.clone()));
    if let Some(profile) = &options.profile {
        loader = loader.profile_name(profile);
    }
    if let Some(attempts) = options.max_retries {
        loader = loader.retry_config(
            aws_config::retry::RetryConfig::standard().with_max_attempts(attempts.max(1)),
        );
    }
    loader.load().await
}

/// Build every client a build needs for `options.region`
pub async fn connect(options: &AwsOptions) -> Result<CloudClients> {
    let sdk_config = load_sdk_config(options).await;
    tracing::debug!(
        region = %options.region,
        profile = ?options.profile,
        "Loaded AWS configuration"
    );

    Ok(CloudClients {
        compute: Arc::new(Ec2Compute::new(
            aws_sdk_ec2::Client::new(&sdk_config),
            options.region.clone(),
        )),
        identity: Arc::new(IamIdentity::new(aws_sdk_iam::Client::new(&sdk_config))),
        regions: Arc::new(AwsRegions::new(sdk_config)),
        host: Arc::new(AwsHost::new(options.check_ip_url.clone())),
    })
}
