use amiflow_build::{BuildContext, CommandOutput, Communicator};
use amiflow_cloud::fake::FakeCloud;
use amiflow_cloud::{
    BlockDeviceMapping, BufferUi, CancellationToken, EbsBlockDevice, Image, Instance, Result,
};
use amiflow_config::{AccessConfig, PollingConfig};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub const REGION: &str = "us-east-1";

/// Shell that records every command and succeeds without running anything
#[derive(Default)]
pub struct RecordingShell {
    commands: Mutex<Vec<String>>,
    devices: String,
    cancel_on: Option<(String, CancellationToken)>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self {
            devices: "xvda\nxvda1\nnull".to_string(),
            ..Default::default()
        }
    }

    /// Cancel `token` when a command containing `needle` runs
    #[allow(dead_code)]
    pub fn cancelling(needle: &str, token: CancellationToken) -> Self {
        Self {
            cancel_on: Some((needle.to_string(), token)),
            ..Self::new()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Communicator for RecordingShell {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some((needle, token)) = &self.cancel_on {
            if command.contains(needle.as_str()) {
                token.cancel();
            }
        }
        let stdout = if command == "ls -1 /dev" {
            self.devices.clone()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

pub fn access() -> AccessConfig {
    AccessConfig {
        region: REGION.to_string(),
        aws_polling: Some(PollingConfig {
            delay_seconds: Some(1),
            max_attempts: Some(5),
        }),
        ..Default::default()
    }
}

pub fn context(
    cloud: &FakeCloud,
    ui: Arc<BufferUi>,
    shell: Arc<RecordingShell>,
    commands: &[&str],
) -> BuildContext {
    BuildContext {
        clients: cloud.clients(),
        ui,
        host_shell: shell.clone(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        communicator: Some(shell),
    }
}

/// EBS-backed source image with an 8 GiB root snapshot
pub fn seed_source(cloud: &FakeCloud) -> String {
    cloud.seed_image(Image {
        name: "base-linux".into(),
        architecture: Some("x86_64".into()),
        virtualization_type: Some("hvm".into()),
        root_device_type: Some("ebs".into()),
        root_device_name: Some("/dev/xvda".into()),
        ena_support: Some(true),
        block_device_mappings: vec![BlockDeviceMapping {
            device_name: "/dev/xvda".into(),
            ebs: Some(EbsBlockDevice {
                snapshot_id: Some("snap-base".into()),
                volume_size: Some(8),
                volume_type: Some("gp3".into()),
                delete_on_termination: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    })
}

#[allow(dead_code)]
pub fn seed_host(cloud: &FakeCloud) {
    cloud.seed_host_instance(Instance {
        id: "i-buildhost".into(),
        availability_zone: Some("us-east-1c".into()),
        ..Default::default()
    });
}
