use std::time::Duration;

use aws_sdk_ssoadmin::types::{PrincipalType, StatusValues, TargetType};
use aws_sdk_ssoadmin::Client;
use futures::future::try_join_all;

use super::error::{DirectoryError, DirectoryResult};
use super::types::{
    AccountAssignmentInfo, AwsAccount, PermissionSetInfo, SsoInstance, UserAccountAssignment,
};
use super::{classify, with_backoff};

const POLL_INITIAL_DELAY: Duration = Duration::from_secs(1);
const POLL_MAX_DELAY: Duration = Duration::from_secs(15);
const POLL_BUDGET: Duration = Duration::from_secs(300);

/// Result of a create-assignment call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationOutcome {
    Created { request_id: String },
    /// The control plane already holds an identical assignment.
    AlreadyExists,
}

/// Result of a delete-assignment call. Deleting an absent assignment is
/// success, which makes revocation retries converge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted { request_id: String },
    NotPresent,
}

/// Facade over the SSO Admin control plane for one SSO instance.
#[derive(Clone)]
pub struct SsoAdminFacade {
    client: Client,
    instance_arn: String,
}

impl SsoAdminFacade {
    pub fn new(client: Client, instance_arn: impl Into<String>) -> Self {
        Self { client, instance_arn: instance_arn.into() }
    }

    pub fn instance_arn(&self) -> &str {
        &self.instance_arn
    }

    /// Resolve the configured instance ARN to its identity store id.
    pub async fn describe_instance(&self) -> DirectoryResult<SsoInstance> {
        let instances = with_backoff("sso-admin list-instances", || async move {
            let mut out = Vec::new();
            let mut pages = self.client.list_instances().into_paginator().send();
            while let Some(page) = pages
                .try_next()
                .await
                .map_err(|e| classify("sso-admin list-instances", &e))?
            {
                out.extend(page.instances().iter().cloned());
            }
            Ok(out)
        })
        .await?;

        instances
            .into_iter()
            .find(|i| i.instance_arn() == Some(self.instance_arn.as_str()))
            .and_then(|i| {
                Some(SsoInstance {
                    arn: i.instance_arn()?.to_string(),
                    identity_store_id: i.identity_store_id()?.to_string(),
                })
            })
            .ok_or_else(|| DirectoryError::InstanceNotFound(self.instance_arn.clone()))
    }

    /// All permission sets of the instance, described to name + ARN.
    pub async fn list_permission_sets(&self) -> DirectoryResult<Vec<PermissionSetInfo>> {
        let arns = with_backoff("sso-admin list-permission-sets", || async move {
            let mut out = Vec::new();
            let mut items = self
                .client
                .list_permission_sets()
                .instance_arn(&self.instance_arn)
                .into_paginator()
                .items()
                .send();
            while let Some(arn) = items
                .try_next()
                .await
                .map_err(|e| classify("sso-admin list-permission-sets", &e))?
            {
                out.push(arn);
            }
            Ok(out)
        })
        .await?;

        try_join_all(arns.iter().map(|arn| self.describe_permission_set(arn))).await
    }

    pub async fn describe_permission_set(
        &self,
        permission_set_arn: &str,
    ) -> DirectoryResult<PermissionSetInfo> {
        with_backoff("sso-admin describe-permission-set", || async move {
            let out = self
                .client
                .describe_permission_set()
                .instance_arn(&self.instance_arn)
                .permission_set_arn(permission_set_arn)
                .send()
                .await
                .map_err(|e| classify("sso-admin describe-permission-set", &e))?;

            let ps = out.permission_set().ok_or(DirectoryError::Api {
                context: "sso-admin describe-permission-set",
                message: "response carried no permission set".to_string(),
                retryable: false,
            })?;
            Ok(PermissionSetInfo {
                arn: ps
                    .permission_set_arn()
                    .unwrap_or(permission_set_arn)
                    .to_string(),
                name: ps.name().unwrap_or_default().to_string(),
                description: ps.description().map(str::to_string),
            })
        })
        .await
    }

    /// Create a user-level account assignment and wait for the operation to
    /// reach a terminal state.
    pub async fn create_assignment_and_wait(
        &self,
        assignment: &UserAccountAssignment,
    ) -> DirectoryResult<CreationOutcome> {
        let result = self
            .client
            .create_account_assignment()
            .instance_arn(&assignment.instance_arn)
            .target_id(&assignment.account_id)
            .target_type(TargetType::AwsAccount)
            .permission_set_arn(&assignment.permission_set_arn)
            .principal_type(PrincipalType::User)
            .principal_id(&assignment.principal_id)
            .send()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_conflict_exception() {
                    return Ok(CreationOutcome::AlreadyExists);
                }
                return Err(DirectoryError::Api {
                    context: "sso-admin create-account-assignment",
                    message: service_error.to_string(),
                    retryable: false,
                });
            }
        };

        let request_id = out
            .account_assignment_creation_status()
            .and_then(|s| s.request_id())
            .ok_or(DirectoryError::Api {
                context: "sso-admin create-account-assignment",
                message: "creation status carried no request id".to_string(),
                retryable: false,
            })?
            .to_string();

        self.wait_for_creation(&request_id).await?;
        Ok(CreationOutcome::Created { request_id })
    }

    /// Delete a user-level account assignment and wait for the operation to
    /// reach a terminal state. Absent assignments are success.
    pub async fn delete_assignment_and_wait(
        &self,
        assignment: &UserAccountAssignment,
    ) -> DirectoryResult<DeletionOutcome> {
        let result = self
            .client
            .delete_account_assignment()
            .instance_arn(&assignment.instance_arn)
            .target_id(&assignment.account_id)
            .target_type(TargetType::AwsAccount)
            .permission_set_arn(&assignment.permission_set_arn)
            .principal_type(PrincipalType::User)
            .principal_id(&assignment.principal_id)
            .send()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    return Ok(DeletionOutcome::NotPresent);
                }
                return Err(DirectoryError::Api {
                    context: "sso-admin delete-account-assignment",
                    message: service_error.to_string(),
                    retryable: false,
                });
            }
        };

        let request_id = out
            .account_assignment_deletion_status()
            .and_then(|s| s.request_id())
            .ok_or(DirectoryError::Api {
                context: "sso-admin delete-account-assignment",
                message: "deletion status carried no request id".to_string(),
                retryable: false,
            })?
            .to_string();

        match self.wait_for_deletion(&request_id).await {
            Ok(()) => Ok(DeletionOutcome::Deleted { request_id }),
            // The control plane reports deletion of an assignment that is
            // already gone as a failed operation; that is success for us.
            Err(DirectoryError::OperationFailed { reason, .. })
                if reason.to_ascii_lowercase().contains("not found") =>
            {
                Ok(DeletionOutcome::NotPresent)
            }
            Err(err) => Err(err),
        }
    }

    async fn wait_for_creation(&self, request_id: &str) -> DirectoryResult<()> {
        self.poll_terminal_state(request_id, true).await
    }

    async fn wait_for_deletion(&self, request_id: &str) -> DirectoryResult<()> {
        self.poll_terminal_state(request_id, false).await
    }

    async fn poll_terminal_state(&self, request_id: &str, creation: bool) -> DirectoryResult<()> {
        let started = tokio::time::Instant::now();
        let mut delay = POLL_INITIAL_DELAY;

        loop {
            let (status, failure_reason) = if creation {
                let out = self
                    .client
                    .describe_account_assignment_creation_status()
                    .instance_arn(&self.instance_arn)
                    .account_assignment_creation_request_id(request_id)
                    .send()
                    .await
                    .map_err(|e| classify("sso-admin describe-creation-status", &e))?;
                let s = out.account_assignment_creation_status();
                (
                    s.and_then(|s| s.status().cloned()),
                    s.and_then(|s| s.failure_reason()).map(str::to_string),
                )
            } else {
                let out = self
                    .client
                    .describe_account_assignment_deletion_status()
                    .instance_arn(&self.instance_arn)
                    .account_assignment_deletion_request_id(request_id)
                    .send()
                    .await
                    .map_err(|e| classify("sso-admin describe-deletion-status", &e))?;
                let s = out.account_assignment_deletion_status();
                (
                    s.and_then(|s| s.status().cloned()),
                    s.and_then(|s| s.failure_reason()).map(str::to_string),
                )
            };

            match status {
                Some(StatusValues::Succeeded) => return Ok(()),
                Some(StatusValues::Failed) => {
                    return Err(DirectoryError::OperationFailed {
                        request_id: request_id.to_string(),
                        reason: failure_reason.unwrap_or_else(|| "unspecified".to_string()),
                    });
                }
                _ => {
                    if started.elapsed() > POLL_BUDGET {
                        return Err(DirectoryError::PollBudgetExhausted(POLL_BUDGET));
                    }
                    tracing::debug!(request_id, "Assignment operation still in progress");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(POLL_MAX_DELAY);
                }
            }
        }
    }

    /// Every user-level assignment across the given accounts and permission
    /// sets. Group-principal assignments are filtered out here so callers
    /// can never touch them by accident.
    pub async fn list_user_assignments(
        &self,
        accounts: &[&AwsAccount],
        permission_sets: &[PermissionSetInfo],
    ) -> DirectoryResult<Vec<AccountAssignmentInfo>> {
        let mut assignments = Vec::new();
        for account in accounts {
            for permission_set in permission_sets {
                let mut items = self
                    .client
                    .list_account_assignments()
                    .instance_arn(&self.instance_arn)
                    .account_id(&account.id)
                    .permission_set_arn(&permission_set.arn)
                    .into_paginator()
                    .items()
                    .send();
                while let Some(assignment) = items
                    .try_next()
                    .await
                    .map_err(|e| classify("sso-admin list-account-assignments", &e))?
                {
                    let Some(principal_id) = assignment.principal_id() else {
                        continue;
                    };
                    let principal_is_user =
                        assignment.principal_type() == Some(&PrincipalType::User);
                    if !principal_is_user {
                        continue;
                    }
                    assignments.push(AccountAssignmentInfo {
                        account_id: assignment
                            .account_id()
                            .unwrap_or(account.id.as_str())
                            .to_string(),
                        permission_set_arn: assignment
                            .permission_set_arn()
                            .unwrap_or(permission_set.arn.as_str())
                            .to_string(),
                        principal_id: principal_id.to_string(),
                        principal_is_user,
                    });
                }
            }
        }
        Ok(assignments)
    }
}
