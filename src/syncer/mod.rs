//! Attribute-based group sync.
//!
//! A periodic pass that keeps an explicit set of managed groups in line
//! with attribute mapping rules: users whose attributes match a rule are
//! added, members no rule justifies are warned about or removed depending
//! on the policy. Groups outside the managed set are never read or
//! mutated. Per-user and per-group failures are collected and reported in
//! the run summary; nothing aborts the pass.

mod mapper;
mod state;

pub use mapper::{AttributeCondition, AttributeMapper, AttributeMappingRule};
pub use state::{compute_sync_actions, ManagedGroupState, SyncAction, SyncActionKind};

use chrono::Utc;
use uuid::Uuid;

use crate::audit::{
    AuditEntry, AuditEntryType, AuditLogWriter, OperationType, AUDIT_SCHEMA_VERSION,
};
use crate::aws::IdentityStoreFacade;
use crate::config::SyncSettings;
use crate::slack::{messages, Notifier};

/// Counters and errors from one sync pass.
#[derive(Debug, Default)]
pub struct SyncRunResult {
    pub users_evaluated: usize,
    pub groups_processed: usize,
    pub users_added: usize,
    pub users_removed: usize,
    pub manual_assignments_detected: usize,
    pub errors: Vec<String>,
}

impl SyncRunResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct AttributeSyncer {
    identity: IdentityStoreFacade,
    audit: AuditLogWriter,
    notifier: Notifier,
    settings: SyncSettings,
}

impl AttributeSyncer {
    pub fn new(
        identity: IdentityStoreFacade,
        audit: AuditLogWriter,
        notifier: Notifier,
        settings: SyncSettings,
    ) -> Self {
        Self { identity, audit, notifier, settings }
    }

    /// Run one pass. The run id ties all audit rows of the pass together.
    pub async fn run(&self) -> SyncRunResult {
        let mut result = SyncRunResult::default();
        if !self.settings.enabled {
            tracing::info!("Attribute sync is disabled; nothing to do");
            return result;
        }
        let run_id = Uuid::now_v7().to_string();
        tracing::info!(run_id, "Attribute sync pass started");

        // Resolve managed group names against the directory. Unresolvable
        // names are warnings, not failures: the rest of the set still syncs.
        let directory_groups = match self.identity.list_groups().await {
            Ok(groups) => groups,
            Err(err) => {
                result.errors.push(format!("listing groups: {err}"));
                return result;
            }
        };
        let mut managed = Vec::new();
        for name in &self.settings.managed_groups {
            match directory_groups.iter().find(|g| &g.name == name) {
                Some(group) => managed.push(group.clone()),
                None => {
                    tracing::warn!(group = %name, "Managed group not found in the directory; skipping");
                    result
                        .errors
                        .push(format!("managed group {name:?} not found in the directory"));
                }
            }
        }

        let mapper = self.build_mapper(&managed);

        let users = match self.identity.list_users().await {
            Ok(users) => users,
            Err(err) => {
                result.errors.push(format!("listing users: {err}"));
                return result;
            }
        };
        result.users_evaluated = users.len();

        let mut groups = Vec::new();
        for group in &managed {
            match self.identity.list_group_memberships(&group.group_id).await {
                Ok(memberships) => {
                    groups.push(ManagedGroupState {
                        group_id: group.group_id.clone(),
                        group_name: group.name.clone(),
                        members: memberships
                            .into_iter()
                            .map(|m| (m.user_id, m.membership_id))
                            .collect(),
                    });
                }
                Err(err) => {
                    tracing::warn!(group = %group.name, error = %err, "Skipping group; membership listing failed");
                    result
                        .errors
                        .push(format!("listing members of {}: {err}", group.name));
                }
            }
        }
        result.groups_processed = groups.len();

        let actions = compute_sync_actions(
            &users,
            &groups,
            &mapper,
            self.settings.manual_assignment_policy,
        );
        tracing::info!(run_id, actions = actions.len(), "Computed sync actions");

        for action in &actions {
            self.execute_action(action, &run_id, &mut result).await;
        }

        self.notifier
            .notify_channel(&messages::sync_summary_text(&result))
            .await;
        tracing::info!(
            run_id,
            success = result.ok(),
            users_added = result.users_added,
            users_removed = result.users_removed,
            manual_assignments_detected = result.manual_assignments_detected,
            error_count = result.errors.len(),
            "Attribute sync pass finished"
        );
        result
    }

    fn build_mapper(&self, managed: &[crate::aws::types::SsoGroup]) -> AttributeMapper {
        let mut rules = Vec::new();
        for rule in &self.settings.rules {
            let Some(group) = managed.iter().find(|g| g.name == rule.group_name) else {
                // Already reported while resolving managed groups.
                continue;
            };
            rules.push(AttributeMappingRule {
                group_name: rule.group_name.clone(),
                group_id: group.group_id.clone(),
                conditions: rule
                    .attributes
                    .iter()
                    .map(|(name, value)| AttributeCondition {
                        attribute_name: name.clone(),
                        expected_value: value.clone(),
                    })
                    .collect(),
            });
        }
        AttributeMapper::new(rules)
    }

    async fn execute_action(&self, action: &SyncAction, run_id: &str, result: &mut SyncRunResult) {
        match action.kind {
            SyncActionKind::Add => {
                match self
                    .identity
                    .create_group_membership(&action.group_id, &action.user_id)
                    .await
                {
                    Ok(_) => {
                        result.users_added += 1;
                        self.record(action, run_id, AuditEntryType::SyncAdd, OperationType::Grant)
                            .await;
                        let matched = action
                            .matched_attributes
                            .as_ref()
                            .map(format_attributes)
                            .unwrap_or_else(|| "none".to_string());
                        self.notifier
                            .notify_channel(&messages::sync_user_added_text(
                                &action.user_email,
                                &action.group_name,
                                &matched,
                            ))
                            .await;
                    }
                    Err(err) => {
                        tracing::error!(
                            user = %action.user_email,
                            group = %action.group_name,
                            error = %err,
                            "Failed to add user to group"
                        );
                        result.errors.push(format!(
                            "adding {} to {}: {err}",
                            action.user_email, action.group_name
                        ));
                    }
                }
            }
            SyncActionKind::Remove => {
                let Some(membership_id) = &action.membership_id else {
                    result.errors.push(format!(
                        "no membership id for {} in {}",
                        action.user_email, action.group_name
                    ));
                    return;
                };
                match self.identity.delete_group_membership(membership_id).await {
                    Ok(_) => {
                        result.users_removed += 1;
                        result.manual_assignments_detected += 1;
                        self.record(
                            action,
                            run_id,
                            AuditEntryType::SyncRemove,
                            OperationType::Revoke,
                        )
                        .await;
                        self.notifier
                            .notify_channel(&messages::sync_user_removed_text(
                                &action.user_email,
                                &action.group_name,
                            ))
                            .await;
                    }
                    Err(err) => {
                        tracing::error!(
                            user = %action.user_email,
                            group = %action.group_name,
                            error = %err,
                            "Failed to remove user from group"
                        );
                        result.errors.push(format!(
                            "removing {} from {}: {err}",
                            action.user_email, action.group_name
                        ));
                    }
                }
            }
            SyncActionKind::Warn => {
                result.manual_assignments_detected += 1;
                self.record(
                    action,
                    run_id,
                    AuditEntryType::ManualDetected,
                    OperationType::Detect,
                )
                .await;
                self.notifier
                    .notify_channel(&messages::manual_assignment_text(
                        &action.user_email,
                        &action.group_name,
                    ))
                    .await;
            }
        }
    }

    async fn record(
        &self,
        action: &SyncAction,
        run_id: &str,
        audit_entry_type: AuditEntryType,
        operation_type: OperationType,
    ) {
        let reason = match action.kind {
            SyncActionKind::Add => "attribute mapping rule matched",
            SyncActionKind::Remove => "membership not justified by any mapping rule",
            SyncActionKind::Warn => "manual assignment detected in managed group",
        };
        let entry = AuditEntry {
            timestamp: Utc::now(),
            audit_entry_type,
            operation_type,
            request_id: run_id.to_string(),
            role_name: None,
            account_id: None,
            group_name: Some(action.group_name.clone()),
            group_id: Some(action.group_id.clone()),
            requester_email: AuditEntry::NA.to_string(),
            approver_email: None,
            sso_user_email: action.user_email.clone(),
            sso_user_principal_id: action.user_id.clone(),
            reason: reason.to_string(),
            permission_duration: AuditEntry::NA.to_string(),
            matched_attributes: action.matched_attributes.clone(),
            state: None,
            version: AUDIT_SCHEMA_VERSION,
            secondary_domain_was_used: false,
        };
        if let Err(err) = self.audit.record(&entry).await {
            tracing::error!(error = %err, "Audit record lost for sync action");
        }
    }
}

fn format_attributes(attributes: &std::collections::BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
