//! Typed state shared by the steps of one build

use crate::communicator::{Communicator, run_checked};
use crate::template::{NameRenderer, render_with};
use amiflow_cloud::{
    CloudClients, CloudError, Image, Instance, PipelineState, Result, StepAction, Ui, Waiter,
};
use amiflow_config::Polling;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// SSH credentials produced by the key pair step
#[derive(Default, Clone)]
pub struct SshCredentials {
    pub key_pair_name: Option<String>,
    pub private_key: Option<String>,
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("key_pair_name", &self.key_pair_name)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn required<'a, T>(slot: &'a Option<T>, key: &'static str) -> Result<&'a T> {
    slot.as_ref().ok_or(CloudError::MissingState(key))
}

/// Build context passed by `&mut` to each step in turn
///
/// Steps write what they produce into the `Option` slots; consumers read
/// them through the getters, which fail with [`CloudError::MissingState`]
/// when no earlier step produced the value.
pub struct BuildState {
    pub ui: Arc<dyn Ui>,
    pub clients: CloudClients,
    pub polling: Polling,
    /// Whether launch and create calls can carry tags themselves
    pub tag_on_create: bool,
    pub names: NameRenderer,
    /// Runs commands on the machine driving the build (chroot builds)
    pub host_shell: Arc<dyn Communicator>,
    pub command_wrapper: String,

    pub source_image: Option<Image>,
    pub ami_name: Option<String>,
    pub ssh: SshCredentials,
    pub security_group_ids: Option<Vec<String>>,
    pub instance_profile: Option<String>,
    pub instance: Option<Instance>,
    pub communicator: Option<Arc<dyn Communicator>>,

    pub host_instance: Option<Instance>,
    /// Device name the volume is attached as (`/dev/sdf`)
    pub attach_device: Option<String>,
    /// Path the host kernel exposes the device at (`/dev/xvdf`)
    pub local_device: Option<String>,
    pub volume_id: Option<String>,
    pub mount_path: Option<PathBuf>,
    pub root_snapshot: Option<String>,
    /// Surrogate builds: launch device name to snapshot
    pub volume_snapshots: BTreeMap<String, String>,

    pub amis: BTreeMap<String, String>,
    pub snapshots: BTreeMap<String, Vec<String>>,

    error: Option<CloudError>,
    cancelled: bool,
    halted: bool,
}

impl BuildState {
    pub fn new(
        clients: CloudClients,
        ui: Arc<dyn Ui>,
        polling: Polling,
        host_shell: Arc<dyn Communicator>,
    ) -> Self {
        let region = clients.region().to_string();
        Self {
            ui,
            tag_on_create: tag_on_create(&region),
            names: NameRenderer::new(&region),
            clients,
            polling,
            host_shell,
            command_wrapper: "{{ command }}".to_string(),
            source_image: None,
            ami_name: None,
            ssh: SshCredentials::default(),
            security_group_ids: None,
            instance_profile: None,
            instance: None,
            communicator: None,
            host_instance: None,
            attach_device: None,
            local_device: None,
            volume_id: None,
            mount_path: None,
            root_snapshot: None,
            volume_snapshots: BTreeMap::new(),
            amis: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            error: None,
            cancelled: false,
            halted: false,
        }
    }

    pub fn region(&self) -> &str {
        self.clients.region()
    }

    /// Record why the build stops and tell the user
    pub fn halt(&mut self, error: CloudError) -> StepAction {
        self.ui.error(&error.to_string());
        self.error = Some(error);
        StepAction::Halt
    }

    pub fn error(&self) -> Option<&CloudError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<CloudError> {
        self.error.take()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The build will not produce an artifact; anything it made must go
    pub fn is_aborted(&self) -> bool {
        self.cancelled || self.halted
    }

    /// Waits using the template's polling settings
    pub fn waiter(&self) -> Waiter {
        Waiter::from_attempts(self.polling.delay, self.polling.max_attempts)
    }

    pub fn source_image(&self) -> Result<&Image> {
        required(&self.source_image, "source_image")
    }

    pub fn ami_name(&self) -> Result<&str> {
        required(&self.ami_name, "ami_name").map(String::as_str)
    }

    pub fn instance(&self) -> Result<&Instance> {
        required(&self.instance, "instance")
    }

    pub fn host_instance(&self) -> Result<&Instance> {
        required(&self.host_instance, "host_instance")
    }

    pub fn attach_device(&self) -> Result<&str> {
        required(&self.attach_device, "attach_device").map(String::as_str)
    }

    pub fn local_device(&self) -> Result<&str> {
        required(&self.local_device, "local_device").map(String::as_str)
    }

    pub fn volume_id(&self) -> Result<&str> {
        required(&self.volume_id, "volume_id").map(String::as_str)
    }

    pub fn mount_path(&self) -> Result<&PathBuf> {
        required(&self.mount_path, "mount_path")
    }

    pub fn root_snapshot(&self) -> Result<&str> {
        required(&self.root_snapshot, "root_snapshot").map(String::as_str)
    }

    pub fn communicator(&self) -> Result<Arc<dyn Communicator>> {
        required(&self.communicator, "communicator").cloned()
    }

    pub fn build_image(&self) -> Result<&str> {
        self.amis
            .get(self.region())
            .map(String::as_str)
            .ok_or(CloudError::MissingState("amis"))
    }

    /// Run a command on the build host through the command wrapper
    pub async fn host_run(&self, command: &str) -> Result<String> {
        let wrapped = render_with(&self.command_wrapper, &[("command", command)])?;
        run_checked(self.host_shell.as_ref(), &wrapped).await
    }
}

impl PipelineState for BuildState {
    fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    fn mark_halted(&mut self) {
        self.halted = true;
    }
}

/// Restricted partitions reject tags on launch and create requests
pub fn tag_on_create(region: &str) -> bool {
    !(region.starts_with("us-gov-") || region.starts_with("cn-"))
}
