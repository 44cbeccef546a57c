mod common;

use amiflow_build::{SURROGATE_BUILDER_ID, SurrogateBuilder, run};
use amiflow_cloud::fake::FakeCloud;
use amiflow_cloud::{BufferUi, CancellationToken};
use amiflow_config::{
    AmiConfig, BlockDevice, CommConfig, RootDeviceConfig, RunConfig, SourceConfig,
    SurrogateConfig,
};
use common::{REGION, RecordingShell, access, context, seed_source};
use std::sync::Arc;

fn surrogate_config(source_ami: String) -> SurrogateConfig {
    SurrogateConfig {
        access: access(),
        ami: AmiConfig {
            ami_name: "surrogate-image".into(),
            ..Default::default()
        },
        run: RunConfig {
            source: SourceConfig {
                source_ami: Some(source_ami),
                source_ami_filter: None,
            },
            instance_type: "t3.micro".into(),
            comm: CommConfig {
                ssh_username: Some("ec2-user".into()),
                ..Default::default()
            },
            ..Default::default()
        },
        launch_block_device_mappings: vec![BlockDevice {
            device_name: "/dev/xvdf".into(),
            volume_size: Some(10),
            volume_type: Some("gp3".into()),
            delete_on_termination: Some(true),
            ..Default::default()
        }],
        ami_root_device: RootDeviceConfig {
            source_device_name: "/dev/xvdf".into(),
            device_name: "/dev/xvda".into(),
            delete_on_termination: true,
            volume_size: Some(10),
            volume_type: Some("gp3".into()),
            ..Default::default()
        },
        ami_architecture: "arm64".into(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_surrogate_volume_becomes_root() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    let shell = Arc::new(RecordingShell::new());

    let builder = SurrogateBuilder::new(surrogate_config(source));
    let artifact = run(
        &builder,
        context(
            &cloud,
            Arc::new(BufferUi::new()),
            shell.clone(),
            &["mkfs.ext4 /dev/xvdf"],
        ),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(artifact.builder_id, SURROGATE_BUILDER_ID);
    let image = cloud.image(&artifact.amis[REGION]).unwrap();
    assert_eq!(image.root_device_name.as_deref(), Some("/dev/xvda"));
    assert_eq!(image.architecture.as_deref(), Some("arm64"));
    let root = image.root_mapping().unwrap();
    let snapshot = root.snapshot_id().unwrap();
    assert!(cloud.snapshot_exists(snapshot));
    assert_eq!(artifact.snapshots[REGION], vec![snapshot.to_string()]);

    assert_eq!(cloud.count("CreateImage"), 0);
    assert_eq!(cloud.count("CreateSnapshot"), 1);
    assert!(cloud.live_instances().is_empty());
    assert!(cloud.key_pairs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_surrogate_create_image_swaps_volumes() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    let mut config = surrogate_config(source);
    config.use_create_image = true;

    let artifact = run(
        &SurrogateBuilder::new(config),
        context(
            &cloud,
            Arc::new(BufferUi::new()),
            Arc::new(RecordingShell::new()),
            &[],
        ),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
    .unwrap();

    let image = cloud.image(&artifact.amis[REGION]).unwrap();
    assert_eq!(cloud.count("RegisterImage"), 0);
    assert_eq!(cloud.count("CreateImage"), 1);
    assert!(image.block_device_mappings.iter().any(|m| m.device_name == "/dev/xvda"));

    let attach = cloud.calls_for("AttachVolume");
    assert_eq!(attach.len(), 1);
    assert!(attach[0].detail.ends_with("/dev/xvda"));
    assert!(cloud.live_instances().is_empty());
}
