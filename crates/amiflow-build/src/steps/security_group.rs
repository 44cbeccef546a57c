use super::finish;
use crate::state::BuildState;
use amiflow_cloud::{
    Backoff, CancellationToken, CloudError, Filter, IngressRule, Probe, Result, Retry,
    SecurityGroupQuery, Step, StepAction, Waiter,
};
use amiflow_config::RunConfig;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

const DELETE_ATTEMPTS: u32 = 5;
const DELETE_DELAY: Duration = Duration::from_secs(5);

/// Use the configured security groups, or create a temporary one
pub struct StepSecurityGroup {
    run: RunConfig,
    created: Option<String>,
}

impl StepSecurityGroup {
    pub fn new(run: RunConfig) -> Self {
        Self { run, created: None }
    }

    async fn vpc_id(&self, state: &BuildState) -> Result<Option<String>> {
        if self.run.vpc_id.is_some() {
            return Ok(self.run.vpc_id.clone());
        }
        match &self.run.subnet_id {
            Some(subnet) => Ok(Some(state.clients.compute.describe_subnet(subnet).await?.vpc_id)),
            None => Ok(None),
        }
    }

    async fn source_cidrs(&self, state: &BuildState) -> Result<Vec<String>> {
        if self.run.temporary_security_group_source_public_ip {
            let ip = state.clients.host.public_ip().await?;
            state
                .ui
                .message(&format!("Using public IP {} as the ingress source", ip));
            return Ok(vec![format!("{}/32", ip)]);
        }
        if self.run.temporary_security_group_source_cidrs.is_empty() {
            Ok(vec!["0.0.0.0/0".to_string()])
        } else {
            Ok(self.run.temporary_security_group_source_cidrs.clone())
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> Result<()> {
        let compute = state.clients.compute.clone();

        if !self.run.security_group_ids.is_empty() {
            state.ui.say("Using existing security groups");
            let query = SecurityGroupQuery {
                group_ids: self.run.security_group_ids.clone(),
                filters: Vec::new(),
            };
            compute.describe_security_groups(&query).await?;
            state.security_group_ids = Some(self.run.security_group_ids.clone());
            return Ok(());
        }

        if let Some(filter) = &self.run.security_group_filter {
            let mut filters: Vec<Filter> = filter
                .filters
                .iter()
                .map(|(name, value)| Filter::new(name.clone(), vec![value.clone()]))
                .collect();
            if let Some(vpc) = self.vpc_id(state).await? {
                filters.push(Filter::new("vpc-id", vec![vpc]));
            }
            let groups = compute
                .describe_security_groups(&SecurityGroupQuery {
                    group_ids: Vec::new(),
                    filters,
                })
                .await?;
            if groups.is_empty() {
                return Err(CloudError::ResourceNotFound(
                    "no security group matched security_group_filter".to_string(),
                ));
            }
            let ids: Vec<String> = groups.into_iter().map(|g| g.id).collect();
            state
                .ui
                .say(&format!("Found security group(s): {}", ids.join(", ")));
            state.security_group_ids = Some(ids);
            return Ok(());
        }

        let name = format!("amiflow_{}", uuid::Uuid::new_v4());
        state
            .ui
            .say(&format!("Creating temporary security group for this instance: {}", name));
        let vpc = self.vpc_id(state).await?;
        let group_id = compute
            .create_security_group(&name, "Temporary group for amiflow", vpc.as_deref())
            .await?;
        self.created = Some(group_id.clone());
        info!(group = %group_id, "Created temporary security group");

        // Newly created groups are not immediately describable
        let query = SecurityGroupQuery {
            group_ids: vec![group_id.clone()],
            filters: Vec::new(),
        };
        Waiter::from_attempts(Duration::from_secs(5), 40)
            .tolerate_not_found()
            .until(cancel, "security group to exist", || async {
                let groups = compute.describe_security_groups(&query).await?;
                Ok(if groups.is_empty() {
                    Probe::Pending("missing".to_string())
                } else {
                    Probe::Ready(())
                })
            })
            .await?;

        if self.run.comm.uses_ssh() {
            let rule = IngressRule {
                protocol: "tcp".to_string(),
                port: self.run.comm.ssh_port,
                cidr_blocks: self.source_cidrs(state).await?,
            };
            state.ui.message(&format!(
                "Authorizing access to port {} from {}",
                rule.port,
                rule.cidr_blocks.join(", ")
            ));
            compute.authorize_ingress(&group_id, &rule).await?;
        }

        state.security_group_ids = Some(vec![group_id]);
        Ok(())
    }
}

#[async_trait]
impl Step<BuildState> for StepSecurityGroup {
    fn name(&self) -> &'static str {
        "security_group"
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut BuildState) -> StepAction {
        let result = self.execute(cancel, state).await;
        finish(result, state)
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> Result<()> {
        let Some(group_id) = self.created.take() else {
            return Ok(());
        };
        state.ui.say("Deleting temporary security group...");

        // The instance's network interface can hold the group for a while after termination
        let retry = Retry::new(DELETE_ATTEMPTS)
            .backoff(Backoff::Constant(DELETE_DELAY))
            .retry_if(|e| e.is_code(&["DependencyViolation"]) || e.is_throttled());
        let compute = state.clients.compute.clone();
        let result = retry
            .run(&CancellationToken::new(), || compute.delete_security_group(&group_id))
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(group = %group_id, error = %e, "Failed to delete security group");
                state.ui.error(&format!(
                    "Error cleaning up security group {}: {}. Please delete it manually.",
                    group_id, e
                ));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_state;
    use amiflow_cloud::fake::FakeCloud;
    use amiflow_cloud::SecurityGroup;
    use amiflow_config::{CommConfig, SecurityGroupFilter};
    use std::collections::BTreeMap;

    fn run_config() -> RunConfig {
        RunConfig {
            comm: CommConfig {
                ssh_username: Some("ec2-user".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_existing_groups_short_circuit() {
        let cloud = FakeCloud::new("us-east-1");
        cloud.seed_security_group(SecurityGroup {
            id: "sg-existing".into(),
            name: "builders".into(),
            vpc_id: None,
        });
        let mut state = test_state(&cloud);
        let mut step = StepSecurityGroup::new(RunConfig {
            security_group_ids: vec!["sg-existing".into()],
            ..run_config()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let before = cloud.calls().len();
        step.cleanup(&mut state).await.unwrap();

        assert_eq!(state.security_group_ids, Some(vec!["sg-existing".to_string()]));
        assert_eq!(cloud.calls().len(), before);
        assert_eq!(cloud.count("CreateSecurityGroup"), 0);
    }

    #[tokio::test]
    async fn test_filter_without_match_halts() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let mut step = StepSecurityGroup::new(RunConfig {
            security_group_filter: Some(SecurityGroupFilter {
                filters: BTreeMap::from([("group-name".to_string(), "nothing-*".to_string())]),
            }),
            ..run_config()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Halt);
        assert!(state.error().is_some_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_temporary_group_scoped_to_public_ip() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let mut step = StepSecurityGroup::new(RunConfig {
            temporary_security_group_source_public_ip: true,
            ..run_config()
        });

        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);
        let ingress = cloud.calls_for("AuthorizeSecurityGroupIngress");
        assert_eq!(ingress.len(), 1);
        assert!(ingress[0].detail.ends_with("tcp/22 203.0.113.10/32"));

        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.security_group_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_retries_dependency_violation() {
        let cloud = FakeCloud::new("us-east-1");
        let mut state = test_state(&cloud);
        let mut step = StepSecurityGroup::new(run_config());
        assert_eq!(step.run(&CancellationToken::new(), &mut state).await, StepAction::Continue);

        cloud.fail_next("DeleteSecurityGroup", "DependencyViolation", "in use", 2);
        step.cleanup(&mut state).await.unwrap();

        assert_eq!(cloud.count("DeleteSecurityGroup"), 3);
        assert!(cloud.security_group_ids().is_empty());
    }
}
