//! Grant and revoke execution.
//!
//! The executor owns the strict step ordering the rest of the system
//! relies on: grant, then schedule, then audit; revoke, then
//! schedule-delete, then audit. A crash between any two steps leaves a
//! state the reconciler corrects on its next sweep. Everything here is
//! idempotent: an existing schedule refuses a duplicate grant, an absent
//! assignment makes a revoke succeed without a second audit row.

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::audit::{
    AuditEntry, AuditEntryType, AuditLogWriter, OperationState, OperationType,
    AUDIT_SCHEMA_VERSION,
};
use crate::aws::types::{GroupAssignment, UserAccountAssignment};
use crate::aws::{
    CreationOutcome, DeletionOutcome, DirectoryError, IdentityStoreFacade, OrganizationsFacade,
    SsoAdminFacade,
};
use crate::events::{AccountRevokePayload, GroupRevokePayload};
use crate::schedule::{RevocationScheduler, ScheduleError};
use crate::slack::{messages, Notifier};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted,
    /// A revocation schedule for this assignment and request already
    /// exists, so the grant has already happened.
    AlreadyGranted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    NotPresent,
}

/// Everything needed to grant account access once a decision permits it.
#[derive(Debug, Clone)]
pub struct AccountGrant {
    pub assignment: UserAccountAssignment,
    pub permission_set_name: String,
    pub request_id: String,
    pub requester_email: String,
    pub sso_user_email: String,
    pub approver_email: Option<String>,
    pub reason: String,
    pub duration: Duration,
    pub secondary_domain_was_used: bool,
}

/// Everything needed to grant group membership.
#[derive(Debug, Clone)]
pub struct GroupGrant {
    pub identity_store_id: String,
    pub group_id: String,
    pub group_name: String,
    pub user_id: String,
    pub request_id: String,
    pub requester_email: String,
    pub sso_user_email: String,
    pub approver_email: Option<String>,
    pub reason: String,
    pub duration: Duration,
    pub secondary_domain_was_used: bool,
}

/// Audit context for a revocation.
#[derive(Debug, Clone)]
pub struct RevokeContext {
    pub request_id: String,
    pub requester_email: String,
    pub approver_email: Option<String>,
    pub reason: String,
    pub permission_duration: Option<Duration>,
    pub secondary_domain_was_used: bool,
    /// Schedule to clean up after the revoke; `None` for reconciler
    /// revocations, which by definition have no governing schedule.
    pub schedule_name: Option<String>,
}

impl RevokeContext {
    /// Context for revocations initiated by the reconciler, where the
    /// original actors are unknown.
    pub fn reconciler(reason: impl Into<String>) -> Self {
        Self {
            request_id: AuditEntry::NA.to_string(),
            requester_email: AuditEntry::NA.to_string(),
            approver_email: None,
            reason: reason.into(),
            permission_duration: None,
            secondary_domain_was_used: false,
            schedule_name: None,
        }
    }
}

#[derive(Clone)]
pub struct GrantExecutor {
    sso: SsoAdminFacade,
    identity: IdentityStoreFacade,
    organizations: OrganizationsFacade,
    scheduler: RevocationScheduler,
    audit: AuditLogWriter,
    notifier: Notifier,
}

impl GrantExecutor {
    pub fn new(
        sso: SsoAdminFacade,
        identity: IdentityStoreFacade,
        organizations: OrganizationsFacade,
        scheduler: RevocationScheduler,
        audit: AuditLogWriter,
        notifier: Notifier,
    ) -> Self {
        Self { sso, identity, organizations, scheduler, audit, notifier }
    }

    /// Audit failures never roll back the business action; the reconciler
    /// provides eventual correctness and the loss is logged for operators.
    async fn record_best_effort(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.record(&entry).await {
            tracing::error!(
                request_id = %entry.request_id,
                error = %err,
                "Audit record lost; operator attention required"
            );
        }
    }

    /// Grant account access: create the assignment, schedule its
    /// revocation, write the audit trail.
    pub async fn grant_account(&self, grant: &AccountGrant) -> ExecutorResult<GrantOutcome> {
        let schedule_name =
            RevocationScheduler::account_schedule_name(&grant.assignment, &grant.request_id);
        if self.scheduler.exists(&schedule_name).await? {
            tracing::info!(
                request_id = %grant.request_id,
                schedule = %schedule_name,
                "Revocation schedule already exists; refusing duplicate grant"
            );
            return Ok(GrantOutcome::AlreadyGranted);
        }

        match self.sso.create_assignment_and_wait(&grant.assignment).await {
            Ok(CreationOutcome::Created { request_id }) => {
                tracing::debug!(
                    request_id = %grant.request_id,
                    operation_request_id = %request_id,
                    "Account assignment created"
                );
            }
            Ok(CreationOutcome::AlreadyExists) => {
                tracing::info!(
                    request_id = %grant.request_id,
                    "Assignment already present; continuing to schedule and audit"
                );
            }
            Err(err) => {
                self.record_best_effort(self.account_entry(
                    grant,
                    OperationType::Grant,
                    Some(OperationState::Failed),
                ))
                .await;
                return Err(err.into());
            }
        }

        self.record_best_effort(self.account_entry(grant, OperationType::Grant, None))
            .await;

        let payload = AccountRevokePayload {
            schedule_name: schedule_name.clone(),
            assignment: grant.assignment.clone(),
            request_id: grant.request_id.clone(),
            requester_email: grant.requester_email.clone(),
            approver_email: grant.approver_email.clone(),
            permission_duration_secs: grant.duration.num_seconds(),
            secondary_domain_was_used: grant.secondary_domain_was_used,
        };
        if let Err(err) = self
            .scheduler
            .schedule_account_revocation(payload, Utc::now() + grant.duration)
            .await
        {
            // Access exists but nothing governs it; the audit row flags the
            // failure and the reconciler revokes on its next sweep.
            self.record_best_effort(self.account_entry(
                grant,
                OperationType::Grant,
                Some(OperationState::Failed),
            ))
            .await;
            return Err(err.into());
        }

        Ok(GrantOutcome::Granted)
    }

    /// Grant group membership, mirroring the account path.
    pub async fn grant_group(&self, grant: &GroupGrant) -> ExecutorResult<GrantOutcome> {
        let mut assignment = GroupAssignment {
            identity_store_id: grant.identity_store_id.clone(),
            group_id: grant.group_id.clone(),
            group_name: grant.group_name.clone(),
            membership_id: String::new(),
            user_principal_id: grant.user_id.clone(),
        };
        let schedule_name =
            RevocationScheduler::group_schedule_name(&assignment, &grant.request_id);
        if self.scheduler.exists(&schedule_name).await? {
            tracing::info!(
                request_id = %grant.request_id,
                schedule = %schedule_name,
                "Revocation schedule already exists; refusing duplicate grant"
            );
            return Ok(GrantOutcome::AlreadyGranted);
        }

        let membership_id = match self
            .identity
            .create_group_membership(&grant.group_id, &grant.user_id)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                self.record_best_effort(self.group_entry(
                    grant,
                    OperationType::Grant,
                    Some(OperationState::Failed),
                ))
                .await;
                return Err(err.into());
            }
        };
        assignment.membership_id = membership_id;

        self.record_best_effort(self.group_entry(grant, OperationType::Grant, None))
            .await;

        let payload = GroupRevokePayload {
            schedule_name: schedule_name.clone(),
            assignment,
            request_id: grant.request_id.clone(),
            requester_email: grant.requester_email.clone(),
            approver_email: grant.approver_email.clone(),
            permission_duration_secs: grant.duration.num_seconds(),
            secondary_domain_was_used: grant.secondary_domain_was_used,
        };
        if let Err(err) = self
            .scheduler
            .schedule_group_revocation(payload, Utc::now() + grant.duration)
            .await
        {
            self.record_best_effort(self.group_entry(
                grant,
                OperationType::Grant,
                Some(OperationState::Failed),
            ))
            .await;
            return Err(err.into());
        }

        Ok(GrantOutcome::Granted)
    }

    /// Revoke an account assignment. Absent assignments succeed silently:
    /// no audit row, no notification, no error.
    pub async fn revoke_account(
        &self,
        assignment: &UserAccountAssignment,
        ctx: &RevokeContext,
    ) -> ExecutorResult<RevokeOutcome> {
        let outcome = self.sso.delete_assignment_and_wait(assignment).await?;

        if let Some(schedule_name) = &ctx.schedule_name {
            if let Err(err) = self.scheduler.delete(schedule_name).await {
                tracing::warn!(schedule = %schedule_name, error = %err, "Failed to delete schedule");
            }
        }

        let DeletionOutcome::Deleted { request_id: operation_request_id } = outcome else {
            tracing::info!(
                account_id = %assignment.account_id,
                principal_id = %assignment.principal_id,
                "Assignment already absent; revoke is a no-op"
            );
            return Ok(RevokeOutcome::NotPresent);
        };
        tracing::debug!(operation_request_id = %operation_request_id, "Account assignment deleted");

        let permission_set = self
            .sso
            .describe_permission_set(&assignment.permission_set_arn)
            .await;
        let role_name = permission_set
            .as_ref()
            .map(|ps| ps.name.clone())
            .unwrap_or_else(|_| assignment.permission_set_arn.clone());

        self.record_best_effort(AuditEntry {
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Account,
            operation_type: OperationType::Revoke,
            request_id: ctx.request_id.clone(),
            role_name: Some(role_name.clone()),
            account_id: Some(assignment.account_id.clone()),
            group_name: None,
            group_id: None,
            requester_email: ctx.requester_email.clone(),
            approver_email: ctx.approver_email.clone(),
            sso_user_email: ctx.requester_email.clone(),
            sso_user_principal_id: assignment.principal_id.clone(),
            reason: ctx.reason.clone(),
            permission_duration: AuditEntry::duration_field(ctx.permission_duration),
            matched_attributes: None,
            state: None,
            version: AUDIT_SCHEMA_VERSION,
            secondary_domain_was_used: ctx.secondary_domain_was_used,
        })
        .await;

        if self.notifier.post_update_on_revoke() {
            let account_name = match self
                .organizations
                .describe_account(&assignment.account_id)
                .await
            {
                Ok(account) => account.name,
                Err(_) => assignment.account_id.clone(),
            };
            let mention = self
                .notifier
                .mention_by_principal(&self.identity, &assignment.principal_id)
                .await;
            let text = messages::with_banner(
                ctx.secondary_domain_was_used,
                &ctx.requester_email,
                messages::account_revoked_text(&mention, &role_name, &account_name),
            );
            self.notifier.notify_channel(&text).await;
        }

        Ok(RevokeOutcome::Revoked)
    }

    /// Revoke a group membership granted through a request.
    pub async fn revoke_group(
        &self,
        assignment: &GroupAssignment,
        ctx: &RevokeContext,
    ) -> ExecutorResult<RevokeOutcome> {
        let existed = self
            .identity
            .delete_group_membership(&assignment.membership_id)
            .await?;

        if let Some(schedule_name) = &ctx.schedule_name {
            if let Err(err) = self.scheduler.delete(schedule_name).await {
                tracing::warn!(schedule = %schedule_name, error = %err, "Failed to delete schedule");
            }
        }

        if !existed {
            tracing::info!(
                group_id = %assignment.group_id,
                membership_id = %assignment.membership_id,
                "Membership already absent; revoke is a no-op"
            );
            return Ok(RevokeOutcome::NotPresent);
        }

        self.record_best_effort(AuditEntry {
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Group,
            operation_type: OperationType::Revoke,
            request_id: ctx.request_id.clone(),
            role_name: None,
            account_id: None,
            group_name: Some(assignment.group_name.clone()),
            group_id: Some(assignment.group_id.clone()),
            requester_email: ctx.requester_email.clone(),
            approver_email: ctx.approver_email.clone(),
            sso_user_email: ctx.requester_email.clone(),
            sso_user_principal_id: assignment.user_principal_id.clone(),
            reason: ctx.reason.clone(),
            permission_duration: AuditEntry::duration_field(ctx.permission_duration),
            matched_attributes: None,
            state: None,
            version: AUDIT_SCHEMA_VERSION,
            secondary_domain_was_used: ctx.secondary_domain_was_used,
        })
        .await;

        if self.notifier.post_update_on_revoke() {
            let mention = self
                .notifier
                .mention_by_principal(&self.identity, &assignment.user_principal_id)
                .await;
            let text = messages::with_banner(
                ctx.secondary_domain_was_used,
                &ctx.requester_email,
                messages::group_revoked_text(&mention, &assignment.group_name),
            );
            self.notifier.notify_channel(&text).await;
        }

        Ok(RevokeOutcome::Revoked)
    }

    fn account_entry(
        &self,
        grant: &AccountGrant,
        operation_type: OperationType,
        state: Option<OperationState>,
    ) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Account,
            operation_type,
            request_id: grant.request_id.clone(),
            role_name: Some(grant.permission_set_name.clone()),
            account_id: Some(grant.assignment.account_id.clone()),
            group_name: None,
            group_id: None,
            requester_email: grant.requester_email.clone(),
            approver_email: grant.approver_email.clone(),
            sso_user_email: grant.sso_user_email.clone(),
            sso_user_principal_id: grant.assignment.principal_id.clone(),
            reason: grant.reason.clone(),
            permission_duration: AuditEntry::duration_field(Some(grant.duration)),
            matched_attributes: None,
            state,
            version: AUDIT_SCHEMA_VERSION,
            secondary_domain_was_used: grant.secondary_domain_was_used,
        }
    }

    fn group_entry(
        &self,
        grant: &GroupGrant,
        operation_type: OperationType,
        state: Option<OperationState>,
    ) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            audit_entry_type: AuditEntryType::Group,
            operation_type,
            request_id: grant.request_id.clone(),
            role_name: None,
            account_id: None,
            group_name: Some(grant.group_name.clone()),
            group_id: Some(grant.group_id.clone()),
            requester_email: grant.requester_email.clone(),
            approver_email: grant.approver_email.clone(),
            sso_user_email: grant.sso_user_email.clone(),
            sso_user_principal_id: grant.user_id.clone(),
            reason: grant.reason.clone(),
            permission_duration: AuditEntry::duration_field(Some(grant.duration)),
            matched_attributes: None,
            state,
            version: AUDIT_SCHEMA_VERSION,
            secondary_domain_was_used: grant.secondary_domain_was_used,
        }
    }
}
