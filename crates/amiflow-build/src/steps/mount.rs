use super::provision::run_commands;
use super::{finish, first_error, keep_first};
use crate::communicator::{ChrootShell, shell_escape};
use crate::state::BuildState;
use crate::template::render_with;
use amiflow_cloud::{CancellationToken, Result, SharedStep, Step, StepAction};
use amiflow_config::ChrootConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn path_arg(path: &Path) -> String {
    shell_escape(&path.to_string_lossy())
}

/// `dest` inside the chroot root
fn inside(root: &Path, dest: &str) -> PathBuf {
    root.join(dest.trim_start_matches('/'))
}

/// Mount the attached volume, running the pre and post mount hooks
pub struct StepMountDevice {
    mount_path: String,
    partition: String,
    options: Vec<String>,
    pre_mount_commands: Vec<String>,
    post_mount_commands: Vec<String>,
    mounted: Option<PathBuf>,
}

impl StepMountDevice {
    pub fn new(config: &ChrootConfig) -> Self {
        Self {
            mount_path: config.mount_path.clone(),
            partition: config.mount_partition.clone(),
            options: config.mount_options.clone(),
            pre_mount_commands: config.pre_mount_commands.clone(),
            post_mount_commands: config.post_mount_commands.clone(),
            mounted: None,
        }
    }

    fn partition_device(&self, device: &str) -> String {
        if self.partition == "0" {
            device.to_string()
        } else if device.starts_with("/dev/nvme") {
            format!("{}p{}", device, self.partition)
        } else {
            format!("{}{}", device, self.partition)
        }
    }

    async fn hooks(
        &self,
        commands: &[String],
        device: &str,
        mount_path: &str,
        state: &BuildState,
    ) -> Result<()> {
        for command in commands {
            let rendered = render_with(command, &[("device", device), ("mount_path", mount_path)])?;
            state.ui.message(&format!("Running: {}", rendered));
            state.host_run(&rendered).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, state: &mut BuildState) -> Result<()> {
        let device = state.local_device()?.to_string();
        let device_name = device.rsplit('/').next().unwrap_or(device.as_str()).to_string();
        let mount_path = render_with(&self.mount_path, &[("device", device_name.as_str())])?;
        let path = PathBuf::from(&mount_path);

        self.hooks(&self.pre_mount_commands, &device, &mount_path, state).await?;

        state.ui.say("Mounting the root device...");
        state
            .host_run(&format!("mkdir -m 755 -p {}", path_arg(&path)))
            .await?;
        let options = if self.options.is_empty() {
            String::new()
        } else {
            format!("-o {} ", shell_escape(&self.options.join(",")))
        };
        let partition = self.partition_device(&device);
        state
            .host_run(&format!(
                "mount {}{} {}",
                options,
                shell_escape(&partition),
                path_arg(&path)
            ))
            .await?;
        debug!(device = %partition, path = %path.display(), "Mounted root device");
        self.mounted = Some(path.clone());
        state.mount_path = Some(path);

        self.hooks(&self.post_mount_commands, &device, &mount_path, state).await
    }
}

#[async_trait]
impl Step<BuildState> for StepMountDevice {
    fn name(&self) -> &'static str {
        "mount_device"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(path) = self.mounted.take() else {
            return Ok(());
        };
        state.ui.say("Unmounting the root device...");
        let result = state
            .host_run(&format!("umount {}", path_arg(&path)))
            .await
            .map(|_| ());
        if let Err(e) = &result {
            warn!(path = %path.display(), error = %e, "Failed to unmount root device");
            state.ui.error(&format!("Error unmounting root device: {}", e));
        }
        result
    }
}

/// Mount proc, sys, dev and friends inside the chroot
pub struct StepMountExtra {
    mounts: Vec<[String; 3]>,
    mounted: Vec<PathBuf>,
}

impl StepMountExtra {
    pub fn new(mounts: Vec<[String; 3]>) -> Self {
        Self {
            mounts,
            mounted: Vec::new(),
        }
    }

    async fn execute(&mut self, state: &mut BuildState) -> Result<()> {
        let root = state.mount_path()?.clone();
        state.ui.say("Mounting additional paths within the chroot...");
        for [fstype, source, dest] in &self.mounts {
            let inner = inside(&root, dest);
            state.ui.message(&format!("Mounting: {}", dest));
            state
                .host_run(&format!("mkdir -m 755 -p {}", path_arg(&inner)))
                .await?;
            let kind = if fstype == "bind" {
                "--bind".to_string()
            } else {
                format!("-t {}", shell_escape(fstype))
            };
            state
                .host_run(&format!(
                    "mount {} {} {}",
                    kind,
                    shell_escape(source),
                    path_arg(&inner)
                ))
                .await?;
            self.mounted.push(inner);
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepMountExtra {
    fn name(&self) -> &'static str {
        "mount_extra"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let mut first = None;
        // Nested mounts (/dev/pts under /dev) come off first
        while let Some(path) = self.mounted.pop() {
            let result = state
                .host_run(&format!("umount {}", path_arg(&path)))
                .await
                .map(|_| ());
            if let Err(e) = &result {
                state
                    .ui
                    .error(&format!("Error unmounting {}: {}", path.display(), e));
            }
            keep_first(&mut first, result);
        }
        first_error(first)
    }
}

/// Copy host files such as resolv.conf into the chroot
pub struct StepCopyFiles {
    files: Vec<String>,
    copied: Vec<PathBuf>,
}

impl StepCopyFiles {
    pub fn new(files: Vec<String>) -> Self {
        Self {
            files,
            copied: Vec::new(),
        }
    }

    async fn execute(&mut self, state: &mut BuildState) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        let root = state.mount_path()?.clone();
        state.ui.say("Copying files from host to chroot...");
        for file in &self.files {
            let dest = inside(&root, file);
            state.ui.message(file);
            state
                .host_run(&format!(
                    "cp --remove-destination {} {}",
                    shell_escape(file),
                    path_arg(&dest)
                ))
                .await?;
            self.copied.push(dest);
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepCopyFiles {
    fn name(&self) -> &'static str {
        "copy_files"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let mut first = None;
        for dest in std::mem::take(&mut self.copied) {
            let result = state
                .host_run(&format!("rm -f {}", path_arg(&dest)))
                .await
                .map(|_| ());
            keep_first(&mut first, result);
        }
        first_error(first)
    }
}

/// Run the provisioners inside the chroot
pub struct StepChrootProvision {
    commands: Vec<String>,
}

impl StepChrootProvision {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    async fn execute(&self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let root = state.mount_path()?.clone();
        let shell = ChrootShell::new(root, state.host_shell.clone(), state.command_wrapper.clone());
        state.ui.say("Provisioning inside the chroot...");
        run_commands(cancel, state, &shell, &self.commands).await
    }
}

#[async_trait]
impl Step<BuildState> for StepChrootProvision {
    fn name(&self) -> &'static str {
        "chroot_provision"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

/// Run the given steps' cleanups ahead of the unwind
///
/// Steps are cleaned in the order given; pass them newest first.
pub struct StepEarlyCleanup {
    name: &'static str,
    steps: Vec<SharedStep<BuildState>>,
}

impl StepEarlyCleanup {
    pub fn new(name: &'static str, steps: Vec<SharedStep<BuildState>>) -> Self {
        Self { name, steps }
    }

    async fn execute(&self, state: &mut BuildState) -> Result<()> {
        for step in &self.steps {
            debug!(step = step.name(), "Cleaning up early");
            step.cleanup_now(state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepEarlyCleanup {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{RecordingShell, test_state};
    use amiflow_cloud::fake::FakeCloud;
    use std::sync::Arc;

    fn mounted_state(cloud: &FakeCloud, shell: &Arc<RecordingShell>) -> BuildState {
        let mut state = test_state(cloud);
        state.host_shell = shell.clone();
        state.local_device = Some("/dev/xvdf".into());
        state
    }

    #[tokio::test]
    async fn test_mount_device_runs_hooks_around_mount() {
        let cloud = FakeCloud::new("us-east-1");
        let shell = Arc::new(RecordingShell::default());
        let mut state = mounted_state(&cloud, &shell);
        let mut step = StepMountDevice::new(&ChrootConfig {
            mount_options: vec!["noatime".into()],
            pre_mount_commands: vec!["parted {{ device }} mklabel gpt".into()],
            post_mount_commands: vec!["ls {{ mount_path }}".into()],
            ..Default::default()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let path = "/mnt/amiflow-amazon-chroot-volumes/xvdf";
        assert_eq!(state.mount_path().unwrap(), &PathBuf::from(path));
        assert_eq!(
            shell.commands(),
            vec![
                "parted /dev/xvdf mklabel gpt".to_string(),
                format!("mkdir -m 755 -p {}", path),
                format!("mount -o noatime /dev/xvdf1 {}", path),
                format!("ls {}", path),
            ]
        );

        step.cleanup(&mut state).await.unwrap();
        step.cleanup(&mut state).await.unwrap();
        assert_eq!(shell.commands().last().unwrap(), &format!("umount {}", path));
        assert_eq!(shell.commands().iter().filter(|c| c.starts_with("umount")).count(), 1);
    }

    #[test]
    fn test_partition_device_names() {
        let mut step = StepMountDevice::new(&ChrootConfig::default());
        assert_eq!(step.partition_device("/dev/xvdf"), "/dev/xvdf1");
        assert_eq!(step.partition_device("/dev/nvme1n1"), "/dev/nvme1n1p1");
        step.partition = "0".into();
        assert_eq!(step.partition_device("/dev/xvdf"), "/dev/xvdf");
    }

    #[tokio::test]
    async fn test_extra_mounts_unmount_in_reverse() {
        let cloud = FakeCloud::new("us-east-1");
        let shell = Arc::new(RecordingShell::default());
        let mut state = mounted_state(&cloud, &shell);
        state.mount_path = Some(PathBuf::from("/mnt/root"));

        let mut step = StepMountExtra::new(ChrootConfig::default().chroot_mounts);
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert!(shell.commands().contains(&"mount --bind /dev /mnt/root/dev".to_string()));
        assert!(shell.commands().contains(&"mount -t proc proc /mnt/root/proc".to_string()));

        step.cleanup(&mut state).await.unwrap();
        let unmounts: Vec<String> = shell
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("umount"))
            .collect();
        assert_eq!(unmounts.len(), 5);
        assert_eq!(unmounts[0], "umount /mnt/root/proc/sys/fs/binfmt_misc");
        assert_eq!(unmounts[4], "umount /mnt/root/proc");
    }

    #[tokio::test]
    async fn test_copied_files_are_removed() {
        let cloud = FakeCloud::new("us-east-1");
        let shell = Arc::new(RecordingShell::default());
        let mut state = mounted_state(&cloud, &shell);
        state.mount_path = Some(PathBuf::from("/mnt/root"));

        let mut step = StepCopyFiles::new(vec!["/etc/resolv.conf".into()]);
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        step.cleanup(&mut state).await.unwrap();
        assert_eq!(
            shell.commands(),
            vec![
                "cp --remove-destination /etc/resolv.conf /mnt/root/etc/resolv.conf".to_string(),
                "rm -f /mnt/root/etc/resolv.conf".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_chroot_provision_wraps_commands() {
        let cloud = FakeCloud::new("us-east-1");
        let shell = Arc::new(RecordingShell::default());
        let mut state = mounted_state(&cloud, &shell);
        state.mount_path = Some(PathBuf::from("/mnt/root"));
        state.command_wrapper = "sudo {{ command }}".into();

        let mut step = StepChrootProvision::new(vec!["yum -y update".into()]);
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        assert_eq!(
            shell.commands(),
            vec!["sudo chroot /mnt/root /bin/sh -c 'yum -y update'".to_string()]
        );
    }

    #[tokio::test]
    async fn test_early_cleanup_makes_later_cleanup_a_noop() {
        let cloud = FakeCloud::new("us-east-1");
        let shell = Arc::new(RecordingShell::default());
        let mut state = mounted_state(&cloud, &shell);
        state.mount_path = Some(PathBuf::from("/mnt/root"));

        let mut copy = SharedStep::new(StepCopyFiles::new(vec!["/etc/hosts".into()]));
        let mut early = StepEarlyCleanup::new("early_cleanup", vec![copy.clone()]);
        let cancel = CancellationToken::new();

        assert_eq!(copy.run(&cancel, &mut state).await, StepAction::Continue);
        assert_eq!(early.run(&cancel, &mut state).await, StepAction::Continue);
        copy.cleanup(&mut state).await.unwrap();
        assert_eq!(shell.commands().iter().filter(|c| c.starts_with("rm")).count(), 1);
    }
}
