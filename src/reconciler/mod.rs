//! The reconciling sweep.
//!
//! Coverage invariant: every user-level assignment created by a grant has a
//! live revocation schedule governing it. The sweep enumerates live
//! assignments inside the policy's account scope, lists the live schedules,
//! and treats the difference as orphans. The warn sweep runs often and only
//! notifies; the revoke sweep runs less often and deletes. Group-principal
//! assignments are never touched; permanent access is granted to groups, so
//! filtering principals to users is what keeps it invisible here.

use crate::aws::types::{AccountAssignmentInfo, GroupAssignment, UserAccountAssignment};
use crate::aws::{
    IdentityStoreFacade, OrganizationsFacade, SsoAdminFacade,
};
use crate::events::RevokerEvent;
use crate::executor::{GrantExecutor, RevokeContext};
use crate::policy::{accounts_in_scope, PolicyConfiguration};
use crate::schedule::RevocationScheduler;
use crate::slack::{messages, Notifier};

/// What one sweep saw and did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub assignments_scanned: usize,
    pub group_assignments_scanned: usize,
    pub orphaned: usize,
    pub warned: usize,
    pub revoked: usize,
    pub errors: Vec<String>,
}

/// Account assignments with no governing schedule. Pure; the sweep
/// wrappers feed it live listings.
pub fn orphaned_assignments<'a>(
    live: &'a [AccountAssignmentInfo],
    scheduled: &[UserAccountAssignment],
) -> Vec<&'a AccountAssignmentInfo> {
    live.iter()
        .filter(|assignment| assignment.principal_is_user)
        .filter(|assignment| {
            !scheduled.iter().any(|governed| {
                governed.account_id == assignment.account_id
                    && governed.permission_set_arn == assignment.permission_set_arn
                    && governed.principal_id == assignment.principal_id
            })
        })
        .collect()
}

/// Group memberships with no governing schedule, restricted to the groups
/// named by group statements. Membership identity is (group, user): the
/// membership id differs between grant and listing.
pub fn orphaned_group_assignments<'a>(
    live: &'a [GroupAssignment],
    scheduled: &[GroupAssignment],
) -> Vec<&'a GroupAssignment> {
    live.iter()
        .filter(|membership| {
            !scheduled.iter().any(|governed| {
                governed.group_id == membership.group_id
                    && governed.user_principal_id == membership.user_principal_id
            })
        })
        .collect()
}

pub struct Reconciler {
    sso: SsoAdminFacade,
    identity: IdentityStoreFacade,
    organizations: OrganizationsFacade,
    scheduler: RevocationScheduler,
    executor: GrantExecutor,
    notifier: Notifier,
    policy: PolicyConfiguration,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sso: SsoAdminFacade,
        identity: IdentityStoreFacade,
        organizations: OrganizationsFacade,
        scheduler: RevocationScheduler,
        executor: GrantExecutor,
        notifier: Notifier,
        policy: PolicyConfiguration,
    ) -> Self {
        Self { sso, identity, organizations, scheduler, executor, notifier, policy }
    }

    async fn collect_state(
        &self,
    ) -> Result<
        (Vec<AccountAssignmentInfo>, Vec<GroupAssignment>, Vec<UserAccountAssignment>, Vec<GroupAssignment>),
        String,
    > {
        let accounts = self
            .organizations
            .list_accounts()
            .await
            .map_err(|e| format!("listing accounts: {e}"))?;
        let in_scope = accounts_in_scope(&self.policy, &accounts);
        let permission_sets = self
            .sso
            .list_permission_sets()
            .await
            .map_err(|e| format!("listing permission sets: {e}"))?;
        let live = self
            .sso
            .list_user_assignments(&in_scope, &permission_sets)
            .await
            .map_err(|e| format!("listing assignments: {e}"))?;

        let mut live_groups = Vec::new();
        for group_id in self.policy.referenced_group_ids() {
            let group = match self.identity.describe_group(group_id).await {
                Ok(group) => group,
                Err(err) => {
                    tracing::warn!(group_id, error = %err, "Skipping unresolvable group");
                    continue;
                }
            };
            match self.identity.list_group_memberships(group_id).await {
                Ok(memberships) => {
                    live_groups.extend(memberships.into_iter().map(|m| GroupAssignment {
                        identity_store_id: self.identity.identity_store_id().to_string(),
                        group_id: m.group_id,
                        group_name: group.name.clone(),
                        membership_id: m.membership_id,
                        user_principal_id: m.user_id,
                    }));
                }
                Err(err) => {
                    tracing::warn!(group_id, error = %err, "Skipping group membership listing");
                }
            }
        }

        let events = self
            .scheduler
            .list_revocation_events()
            .await
            .map_err(|e| format!("listing schedules: {e}"))?;
        let mut governed_accounts = Vec::new();
        let mut governed_groups = Vec::new();
        for event in events {
            match event {
                RevokerEvent::ScheduledRevoke { revoke } => {
                    governed_accounts.push(revoke.assignment)
                }
                RevokerEvent::ScheduledGroupRevoke { revoke } => {
                    governed_groups.push(revoke.assignment)
                }
                _ => {}
            }
        }

        Ok((live, live_groups, governed_accounts, governed_groups))
    }

    /// Approximate human notice of when the next revoke sweep lands.
    fn next_sweep_notice() -> String {
        " The next scheduled revocation sweep will remove it.".to_string()
    }

    /// High-frequency sweep: warn about every orphan, mutate nothing.
    pub async fn warn_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let (live, live_groups, governed_accounts, governed_groups) =
            match self.collect_state().await {
                Ok(state) => state,
                Err(err) => {
                    report.errors.push(err);
                    return report;
                }
            };
        report.assignments_scanned = live.len();
        report.group_assignments_scanned = live_groups.len();

        for orphan in orphaned_assignments(&live, &governed_accounts) {
            report.orphaned += 1;
            report.warned += 1;
            tracing::warn!(
                account_id = %orphan.account_id,
                principal_id = %orphan.principal_id,
                permission_set_arn = %orphan.permission_set_arn,
                "Found an ungoverned account assignment"
            );
            let account_name = match self.organizations.describe_account(&orphan.account_id).await
            {
                Ok(account) => account.name,
                Err(_) => orphan.account_id.clone(),
            };
            let mention = self
                .notifier
                .mention_by_principal(&self.identity, &orphan.principal_id)
                .await;
            self.notifier
                .notify_channel(&messages::inconsistent_assignment_text(
                    &account_name,
                    &orphan.account_id,
                    &mention,
                    &Self::next_sweep_notice(),
                ))
                .await;
        }

        for orphan in orphaned_group_assignments(&live_groups, &governed_groups) {
            report.orphaned += 1;
            report.warned += 1;
            tracing::warn!(
                group_id = %orphan.group_id,
                principal_id = %orphan.user_principal_id,
                "Found an ungoverned group membership"
            );
            let mention = self
                .notifier
                .mention_by_principal(&self.identity, &orphan.user_principal_id)
                .await;
            self.notifier
                .notify_channel(&messages::inconsistent_group_assignment_text(
                    &orphan.group_name,
                    &orphan.group_id,
                    &mention,
                    &Self::next_sweep_notice(),
                ))
                .await;
        }

        report
    }

    /// Low-frequency sweep: revoke every orphan. Per-item failures are
    /// recorded and the sweep continues.
    pub async fn revoke_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let (live, live_groups, governed_accounts, governed_groups) =
            match self.collect_state().await {
                Ok(state) => state,
                Err(err) => {
                    report.errors.push(err);
                    return report;
                }
            };
        report.assignments_scanned = live.len();
        report.group_assignments_scanned = live_groups.len();

        let ctx = RevokeContext::reconciler("reconciler");

        for orphan in orphaned_assignments(&live, &governed_accounts) {
            report.orphaned += 1;
            let assignment = UserAccountAssignment {
                instance_arn: self.sso.instance_arn().to_string(),
                account_id: orphan.account_id.clone(),
                permission_set_arn: orphan.permission_set_arn.clone(),
                principal_id: orphan.principal_id.clone(),
            };
            match self.executor.revoke_account(&assignment, &ctx).await {
                Ok(_) => report.revoked += 1,
                Err(err) => {
                    tracing::error!(
                        account_id = %orphan.account_id,
                        principal_id = %orphan.principal_id,
                        error = %err,
                        "Failed to revoke ungoverned assignment"
                    );
                    report.errors.push(format!(
                        "revoking {}/{}: {err}",
                        orphan.account_id, orphan.principal_id
                    ));
                }
            }
        }

        for orphan in orphaned_group_assignments(&live_groups, &governed_groups) {
            report.orphaned += 1;
            match self.executor.revoke_group(orphan, &ctx).await {
                Ok(_) => report.revoked += 1,
                Err(err) => {
                    tracing::error!(
                        group_id = %orphan.group_id,
                        principal_id = %orphan.user_principal_id,
                        error = %err,
                        "Failed to revoke ungoverned group membership"
                    );
                    report.errors.push(format!(
                        "removing {} from {}: {err}",
                        orphan.user_principal_id, orphan.group_id
                    ));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(account: &str, ps: &str, principal: &str, is_user: bool) -> AccountAssignmentInfo {
        AccountAssignmentInfo {
            account_id: account.to_string(),
            permission_set_arn: ps.to_string(),
            principal_id: principal.to_string(),
            principal_is_user: is_user,
        }
    }

    fn governed(account: &str, ps: &str, principal: &str) -> UserAccountAssignment {
        UserAccountAssignment {
            instance_arn: "arn:aws:sso:::instance/i-1".to_string(),
            account_id: account.to_string(),
            permission_set_arn: ps.to_string(),
            principal_id: principal.to_string(),
        }
    }

    #[test]
    fn governed_assignments_are_never_orphans() {
        let live = vec![live("111111111111", "ps-1", "u-1", true)];
        let scheduled = vec![governed("111111111111", "ps-1", "u-1")];
        assert!(orphaned_assignments(&live, &scheduled).is_empty());
    }

    #[test]
    fn ungoverned_user_assignments_are_orphans() {
        let rows = vec![
            live("111111111111", "ps-1", "u-1", true),
            live("222222222222", "ps-1", "u-2", true),
        ];
        let scheduled = vec![governed("111111111111", "ps-1", "u-1")];
        let orphans = orphaned_assignments(&rows, &scheduled);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].principal_id, "u-2");
    }

    #[test]
    fn group_principal_assignments_are_ignored() {
        let rows = vec![live("111111111111", "ps-1", "g-1", false)];
        assert!(orphaned_assignments(&rows, &[]).is_empty());
    }

    #[test]
    fn schedule_must_match_the_full_assignment_identity() {
        let rows = vec![live("111111111111", "ps-1", "u-1", true)];
        // Same principal and account, different permission set: not governed.
        let scheduled = vec![governed("111111111111", "ps-2", "u-1")];
        assert_eq!(orphaned_assignments(&rows, &scheduled).len(), 1);
    }

    fn membership(group: &str, user: &str, membership_id: &str) -> GroupAssignment {
        GroupAssignment {
            identity_store_id: "d-1".to_string(),
            group_id: group.to_string(),
            group_name: format!("name-{group}"),
            membership_id: membership_id.to_string(),
            user_principal_id: user.to_string(),
        }
    }

    #[test]
    fn group_membership_identity_ignores_membership_id() {
        let rows = vec![membership("g-1", "u-1", "m-listed")];
        let scheduled = vec![membership("g-1", "u-1", "m-granted")];
        assert!(orphaned_group_assignments(&rows, &scheduled).is_empty());

        let ungoverned = vec![membership("g-1", "u-2", "m-2")];
        assert_eq!(orphaned_group_assignments(&ungoverned, &scheduled).len(), 1);
    }

    #[test]
    fn second_sweep_after_revocation_finds_nothing() {
        // After the revoke sweep deletes the orphan, the next listing no
        // longer contains it; the sweep is a no-op.
        let scheduled: Vec<UserAccountAssignment> = Vec::new();
        let after: Vec<AccountAssignmentInfo> = Vec::new();
        assert!(orphaned_assignments(&after, &scheduled).is_empty());
    }
}
