//! Conversions between SDK shapes and the amiflow model

use amiflow_cloud::{
    BlockDeviceMapping, EbsBlockDevice, Filter, Image, ImageState, Instance, InstanceBlockDevice,
    InstanceState, Snapshot, SnapshotState, Tag, Volume, VolumeAttachment, VolumeState,
};
use aws_sdk_ec2::types as ec2;

pub(crate) fn filters(filters: &[Filter]) -> Option<Vec<ec2::Filter>> {
    if filters.is_empty() {
        return None;
    }
    Some(
        filters
            .iter()
            .map(|f| {
                ec2::Filter::builder()
                    .name(&f.name)
                    .set_values(Some(f.values.clone()))
                    .build()
            })
            .collect(),
    )
}

pub(crate) fn tags(tags: &[Tag]) -> Vec<ec2::Tag> {
    tags.iter()
        .map(|t| ec2::Tag::builder().key(&t.key).value(&t.value).build())
        .collect()
}

pub(crate) fn tag_specification(
    resource: ec2::ResourceType,
    list: &[Tag],
) -> ec2::TagSpecification {
    ec2::TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(tags(list)))
        .build()
}

pub(crate) fn block_device_mapping(mapping: &BlockDeviceMapping) -> ec2::BlockDeviceMapping {
    let mut builder = ec2::BlockDeviceMapping::builder()
        .device_name(&mapping.device_name)
        .set_virtual_name(mapping.virtual_name.clone());

    if mapping.no_device {
        builder = builder.no_device("");
    } else if let Some(ebs) = &mapping.ebs {
        builder = builder.ebs(
            ec2::EbsBlockDevice::builder()
                .set_snapshot_id(ebs.snapshot_id.clone())
                .set_volume_size(ebs.volume_size)
                .set_volume_type(ebs.volume_type.as_deref().map(ec2::VolumeType::from))
                .set_iops(ebs.iops)
                .set_throughput(ebs.throughput)
                .set_delete_on_termination(ebs.delete_on_termination)
                .set_encrypted(ebs.encrypted)
                .set_kms_key_id(ebs.kms_key_id.clone())
                .build(),
        );
    }
    builder.build()
}

pub(crate) fn block_device_mappings(
    mappings: &[BlockDeviceMapping],
) -> Option<Vec<ec2::BlockDeviceMapping>> {
    if mappings.is_empty() {
        None
    } else {
        Some(mappings.iter().map(block_device_mapping).collect())
    }
}

fn from_block_device_mapping(mapping: &ec2::BlockDeviceMapping) -> BlockDeviceMapping {
    BlockDeviceMapping {
        device_name: mapping.device_name().unwrap_or_default().to_string(),
        virtual_name: mapping.virtual_name().map(str::to_string),
        no_device: mapping.no_device().is_some(),
        ebs: mapping.ebs().map(|ebs| EbsBlockDevice {
            snapshot_id: ebs.snapshot_id().map(str::to_string),
            volume_size: ebs.volume_size(),
            volume_type: ebs.volume_type().map(|v| v.as_str().to_string()),
            iops: ebs.iops(),
            throughput: ebs.throughput(),
            delete_on_termination: ebs.delete_on_termination(),
            encrypted: ebs.encrypted(),
            kms_key_id: ebs.kms_key_id().map(str::to_string),
        }),
    }
}

pub(crate) fn image(image: &ec2::Image) -> Image {
    Image {
        id: image.image_id().unwrap_or_default().to_string(),
        name: image.name().unwrap_or_default().to_string(),
        description: image.description().map(str::to_string),
        state: image
            .state()
            .map(|s| ImageState::parse(s.as_str()))
            .unwrap_or_default(),
        owner_id: image.owner_id().map(str::to_string),
        creation_date: image.creation_date().map(str::to_string),
        architecture: image.architecture().map(|a| a.as_str().to_string()),
        virtualization_type: image.virtualization_type().map(|v| v.as_str().to_string()),
        root_device_name: image.root_device_name().map(str::to_string),
        root_device_type: image.root_device_type().map(|t| t.as_str().to_string()),
        ena_support: image.ena_support(),
        sriov_net_support: image.sriov_net_support().map(str::to_string),
        boot_mode: image.boot_mode().map(|b| b.as_str().to_string()),
        block_device_mappings: image
            .block_device_mappings()
            .iter()
            .map(from_block_device_mapping)
            .collect(),
    }
}

pub(crate) fn instance(instance: &ec2::Instance) -> Instance {
    Instance {
        id: instance.instance_id().unwrap_or_default().to_string(),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|n| InstanceState::parse(n.as_str()))
            .unwrap_or_default(),
        state_reason: instance
            .state_reason()
            .and_then(|r| r.message())
            .map(str::to_string),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string),
        subnet_id: instance.subnet_id().map(str::to_string),
        vpc_id: instance.vpc_id().map(str::to_string),
        public_ip: instance.public_ip_address().map(str::to_string),
        private_ip: instance.private_ip_address().map(str::to_string),
        public_dns: instance
            .public_dns_name()
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        root_device_name: instance.root_device_name().map(str::to_string),
        block_devices: instance
            .block_device_mappings()
            .iter()
            .filter_map(|m| {
                Some(InstanceBlockDevice {
                    device_name: m.device_name()?.to_string(),
                    volume_id: m.ebs()?.volume_id()?.to_string(),
                })
            })
            .collect(),
    }
}

pub(crate) fn snapshot(snapshot: &ec2::Snapshot) -> Snapshot {
    Snapshot {
        id: snapshot.snapshot_id().unwrap_or_default().to_string(),
        state: snapshot
            .state()
            .map(|s| SnapshotState::parse(s.as_str()))
            .unwrap_or_default(),
        progress: snapshot.progress().map(str::to_string),
        state_message: snapshot.state_message().map(str::to_string),
        volume_id: snapshot.volume_id().map(str::to_string),
    }
}

pub(crate) fn volume(volume: &ec2::Volume) -> Volume {
    Volume {
        id: volume.volume_id().unwrap_or_default().to_string(),
        state: volume
            .state()
            .map(|s| VolumeState::parse(s.as_str()))
            .unwrap_or_default(),
        size: volume.size(),
        availability_zone: volume.availability_zone().map(str::to_string),
        attachments: volume
            .attachments()
            .iter()
            .map(|a| VolumeAttachment {
                instance_id: a.instance_id().unwrap_or_default().to_string(),
                device: a.device().unwrap_or_default().to_string(),
                state: a
                    .state()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_device_mapping_has_no_ebs() {
        let mapping = block_device_mapping(&BlockDeviceMapping {
            device_name: "/dev/sdb".into(),
            no_device: true,
            ebs: Some(EbsBlockDevice::default()),
            ..Default::default()
        });

        assert_eq!(mapping.no_device(), Some(""));
        assert!(mapping.ebs().is_none());
    }

    #[test]
    fn test_image_conversion_keeps_snapshots() {
        let sdk = ec2::Image::builder()
            .image_id("ami-123")
            .name("golden")
            .state(ec2::ImageState::Available)
            .root_device_name("/dev/xvda")
            .root_device_type(ec2::DeviceType::Ebs)
            .block_device_mappings(
                ec2::BlockDeviceMapping::builder()
                    .device_name("/dev/xvda")
                    .ebs(ec2::EbsBlockDevice::builder().snapshot_id("snap-1").build())
                    .build(),
            )
            .build();

        let image = image(&sdk);
        assert_eq!(image.state, ImageState::Available);
        assert!(image.is_ebs_backed());
        assert_eq!(image.snapshot_ids(), vec!["snap-1".to_string()]);
    }

    #[test]
    fn test_empty_filters_are_omitted() {
        assert!(filters(&[]).is_none());
        let built = filters(&[Filter::new("name", vec!["ubuntu/*".into()])]).unwrap();
        assert_eq!(built[0].name(), Some("name"));
    }
}
