//! Host facts: instance metadata and public IP discovery

use amiflow_cloud::{CloudError, HostProbe, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Default endpoint answering with the caller's public IPv4 address
pub const DEFAULT_CHECK_IP_URL: &str = "https://checkip.amazonaws.com";

pub struct AwsHost {
    imds: aws_config::imds::Client,
    http: reqwest::Client,
    check_ip_url: String,
}

impl AwsHost {
    pub fn new(check_ip_url: impl Into<String>) -> Self {
        Self {
            imds: aws_config::imds::Client::builder().build(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            check_ip_url: check_ip_url.into(),
        }
    }
}

impl Default for AwsHost {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_IP_URL)
    }
}

#[async_trait]
impl HostProbe for AwsHost {
    async fn instance_id(&self) -> Result<String> {
        let value = self
            .imds
            .get("/latest/meta-data/instance-id")
            .await
            .map_err(|e| {
                CloudError::api(
                    "GetInstanceIdentity",
                    "InstanceMetadataUnavailable",
                    format!("is this host an EC2 instance? {}", e),
                )
            })?;
        let id: &str = value.as_ref();
        Ok(id.trim().to_string())
    }

    async fn public_ip(&self) -> Result<String> {
        let response = self
            .http
            .get(&self.check_ip_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CloudError::api("CheckIp", "RequestFailed", e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| CloudError::api("CheckIp", "RequestFailed", e.to_string()))?;
        parse_ipv4(&body)
    }
}

fn parse_ipv4(body: &str) -> Result<String> {
    let trimmed = body.trim();
    trimmed
        .parse::<std::net::Ipv4Addr>()
        .map(|ip| ip.to_string())
        .map_err(|_| {
            CloudError::api(
                "CheckIp",
                "InvalidResponse",
                format!("expected an IPv4 address, got '{}'", trimmed),
            )
        })
}
