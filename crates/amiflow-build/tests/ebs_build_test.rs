mod common;

use amiflow_build::{BuildError, EBS_BUILDER_ID, EbsBuilder, run};
use amiflow_cloud::fake::FakeCloud;
use amiflow_cloud::{BufferUi, CancellationToken, CloudError};
use amiflow_config::{AmiConfig, CommConfig, EbsConfig, RunConfig, SourceConfig};
use common::{REGION, RecordingShell, access, context, seed_source};
use std::sync::Arc;

fn ebs_config(source_ami: String) -> EbsConfig {
    EbsConfig {
        access: access(),
        ami: AmiConfig {
            ami_name: "web-server-image".into(),
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
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_ebs_build_leaves_only_the_image() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    let shell = Arc::new(RecordingShell::new());
    let ui = Arc::new(BufferUi::new());

    let builder = EbsBuilder::new(ebs_config(source));
    let artifact = run(
        &builder,
        context(&cloud, ui.clone(), shell.clone(), &["yum -y install nginx"]),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(artifact.builder_id, EBS_BUILDER_ID);
    let image_id = &artifact.amis[REGION];
    let image = cloud.image(image_id).unwrap();
    assert_eq!(image.name, "web-server-image");
    assert_eq!(artifact.snapshots[REGION], image.snapshot_ids());

    assert_eq!(shell.commands(), vec!["yum -y install nginx".to_string()]);
    assert!(cloud.key_pairs().is_empty());
    assert!(cloud.security_group_ids().is_empty());
    assert!(cloud.live_instances().is_empty());
    assert!(ui.errors().is_empty());

    let operations = cloud.operations();
    let stop = operations.iter().position(|o| *o == "StopInstances").unwrap();
    let create = operations.iter().position(|o| *o == "CreateImage").unwrap();
    assert!(stop < create);
}

#[tokio::test(start_paused = true)]
async fn test_failed_launch_halts_and_cleans_up() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    cloud.fail_next("RunInstances", "UnauthorizedOperation", "not allowed", 1);
    let shell = Arc::new(RecordingShell::new());

    let builder = EbsBuilder::new(ebs_config(source));
    let result = run(
        &builder,
        context(&cloud, Arc::new(BufferUi::new()), shell.clone(), &["true"]),
        &CancellationToken::new(),
    )
    .await;

    match result {
        Err(BuildError::Halted { step, source }) => {
            assert_eq!(step, "run_source_instance");
            assert!(source.is_code(&["UnauthorizedOperation"]));
        }
        other => panic!("expected a halted build, got {:?}", other),
    }
    assert!(shell.commands().is_empty());
    assert!(cloud.key_pairs().is_empty());
    assert!(cloud.security_group_ids().is_empty());
    assert_eq!(cloud.count("CreateImage"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_provisioning() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    let cancel = CancellationToken::new();
    let shell = Arc::new(RecordingShell::cancelling("first", cancel.clone()));

    let builder = EbsBuilder::new(ebs_config(source));
    let result = run(
        &builder,
        context(
            &cloud,
            Arc::new(BufferUi::new()),
            shell.clone(),
            &["echo first", "echo second"],
        ),
        &cancel,
    )
    .await;

    assert!(matches!(result, Err(BuildError::Cancelled)));
    assert_eq!(shell.commands(), vec!["echo first".to_string()]);
    assert!(cloud.live_instances().is_empty());
    assert!(cloud.key_pairs().is_empty());
    assert_eq!(cloud.images_in(REGION).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_skip_create_ami_has_no_artifact() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    let mut config = ebs_config(source);
    config.skip_create_ami = true;

    let result = run(
        &EbsBuilder::new(config),
        context(
            &cloud,
            Arc::new(BufferUi::new()),
            Arc::new(RecordingShell::new()),
            &[],
        ),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(result.is_none());
    assert_eq!(cloud.count("CreateImage"), 0);
    assert!(cloud.live_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_existing_name_is_rejected_up_front() {
    let cloud = FakeCloud::new(REGION);
    let source = seed_source(&cloud);
    cloud.seed_image(amiflow_cloud::Image {
        name: "web-server-image".into(),
        owner_id: Some("self".into()),
        ..Default::default()
    });

    let result = run(
        &EbsBuilder::new(ebs_config(source)),
        context(
            &cloud,
            Arc::new(BufferUi::new()),
            Arc::new(RecordingShell::new()),
            &[],
        ),
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(
        result,
        Err(BuildError::Halted {
            step: "pre_validate",
            source: CloudError::ResourceAlreadyExists(_),
        })
    ));
    assert_eq!(cloud.count("RunInstances"), 0);
}
