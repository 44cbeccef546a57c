//! EC2 implementation of [`ComputeApi`]

use crate::convert;
use crate::error::{api_error, missing_field};
use amiflow_cloud::{
    CloudError, ComputeApi, CopyImageRequest, CreateImageRequest, CreateVolumeRequest, Image,
    ImageAttribute, ImageQuery, IngressRule, Instance, KeyPair, RegisterImageRequest, Result,
    RunInstanceRequest, SecurityGroup, SecurityGroupQuery, Snapshot, Subnet, Tag, Volume,
};
use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::primitives::DateTime as SmithyDateTime;
use aws_sdk_ec2::types as ec2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};

/// EC2 client bound to one region
#[derive(Clone)]
pub struct Ec2Compute {
    client: Client,
    region: String,
}

impl Ec2Compute {
    pub fn new(client: Client, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
        }
    }

    fn metadata_options(
        options: &amiflow_cloud::MetadataOptions,
    ) -> ec2::InstanceMetadataOptionsRequest {
        ec2::InstanceMetadataOptionsRequest::builder()
            .set_http_endpoint(
                options
                    .http_endpoint
                    .as_deref()
                    .map(ec2::InstanceMetadataEndpointState::from),
            )
            .set_http_tokens(options.http_tokens.as_deref().map(ec2::HttpTokensState::from))
            .set_http_put_response_hop_limit(options.http_put_response_hop_limit)
            .set_instance_metadata_tags(
                options
                    .instance_metadata_tags
                    .as_deref()
                    .map(ec2::InstanceMetadataTagsState::from),
            )
            .build()
    }
}

#[async_trait]
impl ComputeApi for Ec2Compute {
    fn region(&self) -> &str {
        &self.region
    }

    async fn describe_images(&self, query: &ImageQuery) -> Result<Vec<Image>> {
        let output = self
            .client
            .describe_images()
            .set_image_ids((!query.image_ids.is_empty()).then(|| query.image_ids.clone()))
            .set_owners((!query.owners.is_empty()).then(|| query.owners.clone()))
            .set_filters(convert::filters(&query.filters))
            .send()
            .await
            .map_err(|e| api_error("DescribeImages", e))?;
        Ok(output.images().iter().map(convert::image).collect())
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> Result<String> {
        let mut builder = self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(ec2::InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .set_key_name(request.key_name.clone())
            .set_user_data(request.user_data.as_ref().map(|d| BASE64.encode(d)))
            .set_block_device_mappings(convert::block_device_mappings(
                &request.block_device_mappings,
            ))
            .ebs_optimized(request.ebs_optimized)
            .set_instance_initiated_shutdown_behavior(
                request
                    .shutdown_behavior
                    .as_deref()
                    .map(ec2::ShutdownBehavior::from),
            );

        if let Some(profile) = &request.iam_instance_profile {
            builder = builder.iam_instance_profile(
                ec2::IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }

        let placement = ec2::Placement::builder()
            .set_availability_zone(request.availability_zone.clone())
            .set_tenancy(request.tenancy.as_deref().map(ec2::Tenancy::from))
            .build();
        builder = builder.placement(placement);

        // A public IP choice can only be expressed through an explicit network interface
        match request.associate_public_ip {
            Some(associate) => {
                builder = builder.network_interfaces(
                    ec2::InstanceNetworkInterfaceSpecification::builder()
                        .device_index(0)
                        .associate_public_ip_address(associate)
                        .delete_on_termination(true)
                        .set_subnet_id(request.subnet_id.clone())
                        .set_groups(Some(request.security_group_ids.clone()))
                        .build(),
                );
            }
            None => {
                builder = builder
                    .set_subnet_id(request.subnet_id.clone())
                    .set_security_group_ids(Some(request.security_group_ids.clone()));
            }
        }

        if let Some(options) = &request.metadata_options {
            builder = builder.metadata_options(Self::metadata_options(options));
        }

        if let Some(credits) = &request.credit_specification {
            let spec = ec2::CreditSpecificationRequest::builder()
                .cpu_credits(credits)
                .build()
                .map_err(|e| CloudError::InvalidConfig(e.to_string()))?;
            builder = builder.credit_specification(spec);
        }

        if request.tag_on_create {
            if !request.tags.is_empty() {
                builder = builder.tag_specifications(convert::tag_specification(
                    ec2::ResourceType::Instance,
                    &request.tags,
                ));
            }
            if !request.volume_tags.is_empty() {
                builder = builder.tag_specifications(convert::tag_specification(
                    ec2::ResourceType::Volume,
                    &request.volume_tags,
                ));
            }
        }

        let output = builder
            .send()
            .await
            .map_err(|e| api_error("RunInstances", e))?;

        output
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| missing_field("RunInstances", "instance id"))
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Instance> {
        let output = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("DescribeInstances", e))?;

        output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .map(convert::instance)
            .ok_or_else(|| CloudError::ResourceNotFound(instance_id.to_string()))
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.client
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("StopInstances", e))?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("TerminateInstances", e))?;
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<()> {
        if resource_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        self.client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(convert::tags(tags)))
            .send()
            .await
            .map_err(|e| api_error("CreateTags", e))?;
        Ok(())
    }

    async fn describe_subnet(&self, subnet_id: &str) -> Result<Subnet> {
        let output = self
            .client
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(|e| api_error("DescribeSubnets", e))?;

        let subnet = output
            .subnets()
            .first()
            .ok_or_else(|| CloudError::ResourceNotFound(subnet_id.to_string()))?;
        Ok(Subnet {
            id: subnet_id.to_string(),
            vpc_id: subnet.vpc_id().unwrap_or_default().to_string(),
            availability_zone: subnet.availability_zone().unwrap_or_default().to_string(),
        })
    }

    async fn describe_security_groups(
        &self,
        query: &SecurityGroupQuery,
    ) -> Result<Vec<SecurityGroup>> {
        let output = self
            .client
            .describe_security_groups()
            .set_group_ids((!query.group_ids.is_empty()).then(|| query.group_ids.clone()))
            .set_filters(convert::filters(&query.filters))
            .send()
            .await
            .map_err(|e| api_error("DescribeSecurityGroups", e))?;

        Ok(output
            .security_groups()
            .iter()
            .map(|g| SecurityGroup {
                id: g.group_id().unwrap_or_default().to_string(),
                name: g.group_name().unwrap_or_default().to_string(),
                vpc_id: g.vpc_id().map(str::to_string),
            })
            .collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> Result<String> {
        let output = self
            .client
            .create_security_group()
            .group_name(name)
            .description(description)
            .set_vpc_id(vpc_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| api_error("CreateSecurityGroup", e))?;

        output
            .group_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateSecurityGroup", "group id"))
    }

    async fn authorize_ingress(&self, group_id: &str, rule: &IngressRule) -> Result<()> {
        let ranges = rule
            .cidr_blocks
            .iter()
            .map(|cidr| ec2::IpRange::builder().cidr_ip(cidr).build())
            .collect();

        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(
                ec2::IpPermission::builder()
                    .ip_protocol(&rule.protocol)
                    .from_port(i32::from(rule.port))
                    .to_port(i32::from(rule.port))
                    .set_ip_ranges(Some(ranges))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| api_error("AuthorizeSecurityGroupIngress", e))?;
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(|e| api_error("DeleteSecurityGroup", e))?;
        Ok(())
    }

    async fn create_key_pair(&self, name: &str) -> Result<KeyPair> {
        let output = self
            .client
            .create_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(|e| api_error("CreateKeyPair", e))?;

        Ok(KeyPair {
            name: output.key_name().unwrap_or(name).to_string(),
            private_key: output
                .key_material()
                .ok_or_else(|| missing_field("CreateKeyPair", "key material"))?
                .to_string(),
        })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        self.client
            .delete_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(|e| api_error("DeleteKeyPair", e))?;
        Ok(())
    }

    async fn create_image(&self, request: &CreateImageRequest) -> Result<String> {
        let output = self
            .client
            .create_image()
            .instance_id(&request.instance_id)
            .name(&request.name)
            .set_description(request.description.clone())
            .set_block_device_mappings(convert::block_device_mappings(
                &request.block_device_mappings,
            ))
            .send()
            .await
            .map_err(|e| api_error("CreateImage", e))?;

        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateImage", "image id"))
    }

    async fn register_image(&self, request: &RegisterImageRequest) -> Result<String> {
        let output = self
            .client
            .register_image()
            .name(&request.name)
            .set_description(request.description.clone())
            .set_architecture(request.architecture.as_deref().map(ec2::ArchitectureValues::from))
            .set_virtualization_type(request.virtualization_type.clone())
            .root_device_name(&request.root_device_name)
            .set_block_device_mappings(convert::block_device_mappings(
                &request.block_device_mappings,
            ))
            .set_ena_support(request.ena_support)
            .set_sriov_net_support(request.sriov_net_support.clone())
            .set_boot_mode(request.boot_mode.as_deref().map(ec2::BootModeValues::from))
            .set_imds_support(request.imds_support.as_deref().map(ec2::ImdsSupportValues::from))
            .send()
            .await
            .map_err(|e| api_error("RegisterImage", e))?;

        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("RegisterImage", "image id"))
    }

    async fn copy_image(&self, request: &CopyImageRequest) -> Result<String> {
        let output = self
            .client
            .copy_image()
            .source_region(&request.source_region)
            .source_image_id(&request.source_image_id)
            .name(&request.name)
            .set_description(request.description.clone())
            .encrypted(request.encrypted)
            .set_kms_key_id(request.kms_key_id.clone())
            .set_snapshot_copy_completion_duration_minutes(request.completion_duration_minutes)
            .send()
            .await
            .map_err(|e| api_error("CopyImage", e))?;

        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CopyImage", "image id"))
    }

    async fn deregister_image(&self, image_id: &str) -> Result<()> {
        self.client
            .deregister_image()
            .image_id(image_id)
            .send()
            .await
            .map_err(|e| api_error("DeregisterImage", e))?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &[Tag],
    ) -> Result<String> {
        let mut builder = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .description(description);
        if !tags.is_empty() {
            builder = builder
                .tag_specifications(convert::tag_specification(ec2::ResourceType::Snapshot, tags));
        }

        let output = builder
            .send()
            .await
            .map_err(|e| api_error("CreateSnapshot", e))?;

        output
            .snapshot_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateSnapshot", "snapshot id"))
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let output = self
            .client
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(|e| api_error("DescribeSnapshots", e))?;

        output
            .snapshots()
            .first()
            .map(convert::snapshot)
            .ok_or_else(|| CloudError::ResourceNotFound(snapshot_id.to_string()))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.client
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(|e| api_error("DeleteSnapshot", e))?;
        Ok(())
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String> {
        let mut builder = self
            .client
            .create_volume()
            .availability_zone(&request.availability_zone)
            .set_snapshot_id(request.snapshot_id.clone())
            .set_size(request.size)
            .set_volume_type(request.volume_type.as_deref().map(ec2::VolumeType::from))
            .set_iops(request.iops)
            .set_throughput(request.throughput)
            .set_encrypted(request.encrypted)
            .set_kms_key_id(request.kms_key_id.clone());
        if !request.tags.is_empty() {
            builder = builder.tag_specifications(convert::tag_specification(
                ec2::ResourceType::Volume,
                &request.tags,
            ));
        }

        let output = builder
            .send()
            .await
            .map_err(|e| api_error("CreateVolume", e))?;

        output
            .volume_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateVolume", "volume id"))
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Volume> {
        let output = self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| api_error("DescribeVolumes", e))?;

        output
            .volumes()
            .first()
            .map(convert::volume)
            .ok_or_else(|| CloudError::ResourceNotFound(volume_id.to_string()))
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        self.client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|e| api_error("AttachVolume", e))?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| api_error("DetachVolume", e))?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| api_error("DeleteVolume", e))?;
        Ok(())
    }

    async fn modify_image_attribute(
        &self,
        image_id: &str,
        attribute: &ImageAttribute,
    ) -> Result<()> {
        let builder = self.client.modify_image_attribute().image_id(image_id);
        let builder = match attribute {
            ImageAttribute::Description(description) => builder.description(
                ec2::AttributeValue::builder().value(description).build(),
            ),
            ImageAttribute::LaunchPermission(permissions) => {
                let mut add = Vec::new();
                for user in &permissions.users {
                    add.push(ec2::LaunchPermission::builder().user_id(user).build());
                }
                for group in &permissions.groups {
                    add.push(
                        ec2::LaunchPermission::builder()
                            .group(ec2::PermissionGroup::from(group.as_str()))
                            .build(),
                    );
                }
                for arn in &permissions.organization_arns {
                    add.push(ec2::LaunchPermission::builder().organization_arn(arn).build());
                }
                for arn in &permissions.organizational_unit_arns {
                    add.push(
                        ec2::LaunchPermission::builder()
                            .organizational_unit_arn(arn)
                            .build(),
                    );
                }
                builder.launch_permission(
                    ec2::LaunchPermissionModifications::builder()
                        .set_add(Some(add))
                        .build(),
                )
            }
            ImageAttribute::ProductCodes(codes) => builder.set_product_codes(Some(codes.clone())),
            ImageAttribute::ImdsSupport(value) => {
                builder.imds_support(ec2::AttributeValue::builder().value(value).build())
            }
        };

        builder
            .send()
            .await
            .map_err(|e| api_error("ModifyImageAttribute", e))?;
        Ok(())
    }

    async fn add_create_volume_permission(
        &self,
        snapshot_id: &str,
        users: &[String],
        groups: &[String],
    ) -> Result<()> {
        self.client
            .modify_snapshot_attribute()
            .snapshot_id(snapshot_id)
            .attribute(ec2::SnapshotAttributeName::CreateVolumePermission)
            .operation_type(ec2::OperationType::Add)
            .set_user_ids((!users.is_empty()).then(|| users.to_vec()))
            .set_group_names((!groups.is_empty()).then(|| groups.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("ModifySnapshotAttribute", e))?;
        Ok(())
    }

    async fn enable_image_deprecation(&self, image_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.client
            .enable_image_deprecation()
            .image_id(image_id)
            .deprecate_at(SmithyDateTime::from_secs(at.timestamp()))
            .send()
            .await
            .map_err(|e| api_error("EnableImageDeprecation", e))?;
        Ok(())
    }

    async fn enable_deregistration_protection(
        &self,
        image_id: &str,
        with_cooldown: bool,
    ) -> Result<()> {
        self.client
            .enable_image_deregistration_protection()
            .image_id(image_id)
            .with_cooldown(with_cooldown)
            .send()
            .await
            .map_err(|e| api_error("EnableImageDeregistrationProtection", e))?;
        Ok(())
    }

    async fn enable_fast_launch(&self, image_id: &str, max_parallel_launches: i32) -> Result<()> {
        self.client
            .enable_fast_launch()
            .image_id(image_id)
            .resource_type("snapshot")
            .max_parallel_launches(max_parallel_launches)
            .send()
            .await
            .map_err(|e| api_error("EnableFastLaunch", e))?;
        Ok(())
    }

    async fn fast_launch_state(&self, image_id: &str) -> Result<String> {
        let output = self
            .client
            .describe_fast_launch_images()
            .image_ids(image_id)
            .send()
            .await
            .map_err(|e| api_error("DescribeFastLaunchImages", e))?;

        Ok(output
            .fast_launch_images()
            .first()
            .and_then(|i| i.state())
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "disabled".to_string()))
    }
}
