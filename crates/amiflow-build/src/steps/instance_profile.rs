use super::{finish, first_error, ignore_not_found, keep_first};
use crate::state::BuildState;
use amiflow_cloud::{CancellationToken, IdentityApi, Probe, Result, Step, StepAction, Tag, Waiter};
use amiflow_config::{PolicyDocument, RunConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const INLINE_POLICY_NAME: &str = "amiflow-policy";

const EC2_TRUST_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

/// What the step created, so cleanup can undo exactly that
#[derive(Debug, Default)]
struct Created {
    profile: Option<String>,
    role: Option<String>,
    inline_policy: bool,
    managed: Vec<String>,
    role_in_profile: bool,
}

/// Validate the configured instance profile, or create a temporary one
pub struct StepInstanceProfile {
    profile: Option<String>,
    policy: Option<PolicyDocument>,
    managed_policies: Vec<String>,
    created: Created,
}

impl StepInstanceProfile {
    pub fn new(run: &RunConfig) -> Self {
        Self {
            profile: run.iam_instance_profile.clone(),
            policy: run.temporary_iam_instance_profile_policy_document.clone(),
            managed_policies: run.temporary_iam_instance_profile_managed_policies.clone(),
            created: Created::default(),
        }
    }

    fn wants_temporary(&self) -> bool {
        self.policy.is_some() || !self.managed_policies.is_empty()
    }

    fn waiter() -> Waiter {
        Waiter::from_attempts(Duration::from_secs(2), 30).tolerate_not_found()
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let identity = state.clients.identity.clone();

        if let Some(name) = &self.profile {
            state
                .ui
                .say(&format!("Using existing instance profile {}", name));
            identity.get_instance_profile(name).await?;
            state.instance_profile = Some(name.clone());
            return Ok(());
        }
        if !self.wants_temporary() {
            return Ok(());
        }

        let name = format!("amiflow-{}", uuid::Uuid::new_v4());
        let tags = vec![Tag::new("CreatedBy", "amiflow")];

        state
            .ui
            .say(&format!("Creating temporary instance profile for this instance: {}", name));
        identity.create_instance_profile(&name, &tags).await?;
        self.created.profile = Some(name.clone());
        wait_for_profile(cancel, identity.as_ref(), &name).await?;

        state
            .ui
            .say(&format!("Creating temporary role for this instance: {}", name));
        identity.create_role(&name, EC2_TRUST_POLICY, &tags).await?;
        self.created.role = Some(name.clone());
        Self::waiter()
            .until(cancel, "role to exist", || async {
                identity.get_role(&name).await.map(Probe::Ready)
            })
            .await?;

        if let Some(policy) = &self.policy {
            state.ui.say("Attaching policy to the temporary role");
            let document = serde_json::to_string(policy)?;
            identity
                .put_role_policy(&name, INLINE_POLICY_NAME, &document)
                .await?;
            self.created.inline_policy = true;
        }
        for arn in &self.managed_policies {
            state
                .ui
                .say(&format!("Attaching managed policy {} to the temporary role", arn));
            identity.attach_role_policy(&name, arn).await?;
            self.created.managed.push(arn.clone());
        }

        identity.add_role_to_instance_profile(&name, &name).await?;
        self.created.role_in_profile = true;
        info!(profile = %name, "Created temporary instance profile");

        state.instance_profile = Some(name);
        Ok(())
    }

    /// Detach and delete in dependency order, attempting every part
    async fn remove(created: &mut Created, identity: &Arc<dyn IdentityApi>) -> Result<()> {
        let mut first = None;

        if let Some(role) = &created.role {
            if created.role_in_profile {
                if let Some(profile) = &created.profile {
                    let removed = identity.remove_role_from_instance_profile(profile, role).await;
                    keep_first(&mut first, ignore_not_found(removed));
                }
                created.role_in_profile = false;
            }
            for arn in std::mem::take(&mut created.managed) {
                keep_first(
                    &mut first,
                    ignore_not_found(identity.detach_role_policy(role, &arn).await),
                );
            }
            if created.inline_policy {
                keep_first(
                    &mut first,
                    ignore_not_found(identity.delete_role_policy(role, INLINE_POLICY_NAME).await),
                );
                created.inline_policy = false;
            }
        }
        if let Some(role) = created.role.take() {
            keep_first(&mut first, ignore_not_found(identity.delete_role(&role).await));
        }
        if let Some(profile) = created.profile.take() {
            keep_first(
                &mut first,
                ignore_not_found(identity.delete_instance_profile(&profile).await),
            );
        }

        first_error(first)
    }
}

async fn wait_for_profile(
    cancel: &CancellationToken,
    identity: &dyn IdentityApi,
    name: &str,
) -> Result<()> {
    StepInstanceProfile::waiter()
        .until(cancel, "instance profile to exist", || async {
            identity.get_instance_profile(name).await.map(|_| Probe::Ready(()))
        })
        .await
}

#[async_trait]
impl Step<BuildState> for StepInstanceProfile {
    fn name(&self) -> &'static str {
        "instance_profile"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        if self.created.profile.is_none() && self.created.role.is_none() {
            return Ok(());
        }
        state.ui.say("Deleting temporary instance profile and role...");
        let identity = state.clients.identity.clone();
        let result = Self::remove(&mut self.created, &identity).await;
        if let Err(e) = &result {
            state.ui.error(&format!(
                "Error cleaning up instance profile: {}. Please delete it manually.",
                e
            ));
        }
        result
    }
}
