//! IAM implementation of [`IdentityApi`]

use crate::error::{api_error, missing_field};
use amiflow_cloud::{CloudError, IdentityApi, InstanceProfile, Result, Tag};
use async_trait::async_trait;
use aws_sdk_iam::Client;

#[derive(Clone)]
pub struct IamIdentity {
    client: Client,
}

impl IamIdentity {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn iam_tags(tags: &[Tag]) -> Result<Option<Vec<aws_sdk_iam::types::Tag>>> {
    if tags.is_empty() {
        return Ok(None);
    }
    tags.iter()
        .map(|t| {
            aws_sdk_iam::types::Tag::builder()
                .key(&t.key)
                .value(&t.value)
                .build()
                .map_err(|e| CloudError::InvalidConfig(e.to_string()))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

#[async_trait]
impl IdentityApi for IamIdentity {
    async fn create_role(&self, name: &str, assume_role_policy: &str, tags: &[Tag]) -> Result<()> {
        self.client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(assume_role_policy)
            .description("Temporary role for an amiflow build")
            .set_tags(iam_tags(tags)?)
            .send()
            .await
            .map_err(|e| api_error("CreateRole", e))?;
        Ok(())
    }

    async fn get_role(&self, name: &str) -> Result<()> {
        self.client
            .get_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| api_error("GetRole", e))?;
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| api_error("DeleteRole", e))?;
        Ok(())
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> Result<()> {
        self.client
            .put_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(|e| api_error("PutRolePolicy", e))?;
        Ok(())
    }

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> Result<()> {
        self.client
            .delete_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| api_error("DeleteRolePolicy", e))?;
        Ok(())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.client
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| api_error("AttachRolePolicy", e))?;
        Ok(())
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.client
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| api_error("DetachRolePolicy", e))?;
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str, tags: &[Tag]) -> Result<()> {
        self.client
            .create_instance_profile()
            .instance_profile_name(name)
            .set_tags(iam_tags(tags)?)
            .send()
            .await
            .map_err(|e| api_error("CreateInstanceProfile", e))?;
        Ok(())
    }

    async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile> {
        let output = self
            .client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| api_error("GetInstanceProfile", e))?;

        let profile = output
            .instance_profile()
            .ok_or_else(|| missing_field("GetInstanceProfile", "instance profile"))?;
        Ok(InstanceProfile {
            name: profile.instance_profile_name().to_string(),
            arn: Some(profile.arn().to_string()),
            roles: profile
                .roles()
                .iter()
                .map(|r| r.role_name().to_string())
                .collect(),
        })
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<()> {
        self.client
            .add_role_to_instance_profile()
            .instance_profile_name(profile)
            .role_name(role)
            .send()
            .await
            .map_err(|e| api_error("AddRoleToInstanceProfile", e))?;
        Ok(())
    }

    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str) -> Result<()> {
        self.client
            .remove_role_from_instance_profile()
            .instance_profile_name(profile)
            .role_name(role)
            .send()
            .await
            .map_err(|e| api_error("RemoveRoleFromInstanceProfile", e))?;
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> Result<()> {
        self.client
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| api_error("DeleteInstanceProfile", e))?;
        Ok(())
    }
}
