use std::collections::BTreeMap;

use crate::aws::types::SsoUser;
use crate::config::ManualAssignmentPolicy;

use super::mapper::AttributeMapper;

/// A managed group with its current memberships, snapshot at the start of
/// a run.
#[derive(Debug, Clone)]
pub struct ManagedGroupState {
    pub group_id: String,
    pub group_name: String,
    /// user id -> membership id
    pub members: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncActionKind {
    Add,
    Remove,
    Warn,
}

/// One action the syncer decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAction {
    pub kind: SyncActionKind,
    pub user_id: String,
    pub user_email: String,
    pub group_id: String,
    pub group_name: String,
    /// Present on removals and warnings; the membership to delete.
    pub membership_id: Option<String>,
    /// Present on adds; the attribute values that justified them.
    pub matched_attributes: Option<BTreeMap<String, String>>,
}

/// Decide what the directory should look like and diff it against what it
/// does look like. Pure; only the caller touches the control plane.
///
/// Containment holds by construction: only the groups handed in here (the
/// managed set) can appear in any action. Members of a managed group whose
/// attributes match no rule are manual assignments, warned about or removed
/// according to the policy. Users unknown to the directory snapshot are
/// treated as manual too.
pub fn compute_sync_actions(
    users: &[SsoUser],
    groups: &[ManagedGroupState],
    mapper: &AttributeMapper,
    policy: ManualAssignmentPolicy,
) -> Vec<SyncAction> {
    let mut actions = Vec::new();

    let desired: BTreeMap<&str, std::collections::BTreeSet<String>> = users
        .iter()
        .map(|user| {
            (
                user.user_id.as_str(),
                mapper.target_groups_for_user(&user.attributes),
            )
        })
        .collect();

    for group in groups {
        // Adds: users whose attributes call for membership but who are not
        // members yet.
        for user in users {
            let wants = desired
                .get(user.user_id.as_str())
                .map(|groups| groups.contains(&group.group_id))
                .unwrap_or(false);
            if wants && !group.members.contains_key(&user.user_id) {
                let matched = mapper
                    .rule_for_group(&group.group_id)
                    .map(|rule| rule.matched_attributes(&user.attributes));
                actions.push(SyncAction {
                    kind: SyncActionKind::Add,
                    user_id: user.user_id.clone(),
                    user_email: email_of(user),
                    group_id: group.group_id.clone(),
                    group_name: group.group_name.clone(),
                    membership_id: None,
                    matched_attributes: matched,
                });
            }
        }

        // Manual assignments: members the rules do not justify.
        for (user_id, membership_id) in &group.members {
            let justified = desired
                .get(user_id.as_str())
                .map(|groups| groups.contains(&group.group_id))
                .unwrap_or(false);
            if justified {
                continue;
            }
            let kind = match policy {
                ManualAssignmentPolicy::Warn => SyncActionKind::Warn,
                ManualAssignmentPolicy::Remove => SyncActionKind::Remove,
            };
            actions.push(SyncAction {
                kind,
                user_id: user_id.clone(),
                user_email: users
                    .iter()
                    .find(|u| &u.user_id == user_id)
                    .map(email_of)
                    .unwrap_or_else(|| user_id.clone()),
                group_id: group.group_id.clone(),
                group_name: group.group_name.clone(),
                membership_id: Some(membership_id.clone()),
                matched_attributes: None,
            });
        }
    }

    actions
}

fn email_of(user: &SsoUser) -> String {
    user.email.clone().unwrap_or_else(|| user.user_name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::mapper::{AttributeCondition, AttributeMappingRule};

    fn user(id: &str, email: &str, attrs: &[(&str, &str)]) -> SsoUser {
        SsoUser {
            user_id: id.to_string(),
            user_name: email.to_string(),
            email: Some(email.to_string()),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn group(id: &str, members: &[(&str, &str)]) -> ManagedGroupState {
        ManagedGroupState {
            group_id: id.to_string(),
            group_name: format!("name-{id}"),
            members: members
                .iter()
                .map(|(user, membership)| (user.to_string(), membership.to_string()))
                .collect(),
        }
    }

    fn engineering_mapper(group_id: &str) -> AttributeMapper {
        AttributeMapper::new(vec![AttributeMappingRule {
            group_name: format!("name-{group_id}"),
            group_id: group_id.to_string(),
            conditions: vec![AttributeCondition {
                attribute_name: "department".to_string(),
                expected_value: "Eng".to_string(),
            }],
        }])
    }

    #[test]
    fn adds_matching_nonmembers_and_warns_on_manual_members() {
        // u1 matches but is not in G1; u2 does not match but is in G1;
        // u3 matches and sits in unmanaged G2, which must stay invisible.
        let users = vec![
            user("u1", "u1@example.com", &[("department", "Eng")]),
            user("u2", "u2@example.com", &[("department", "Sales")]),
            user("u3", "u3@example.com", &[("department", "Eng")]),
        ];
        let groups = vec![group("G1", &[("u2", "m-2")])];
        let actions = compute_sync_actions(
            &users,
            &groups,
            &engineering_mapper("G1"),
            ManualAssignmentPolicy::Warn,
        );

        assert_eq!(actions.len(), 2);
        let add = actions.iter().find(|a| a.kind == SyncActionKind::Add).unwrap();
        assert_eq!(add.user_id, "u1");
        assert_eq!(add.group_id, "G1");
        assert_eq!(
            add.matched_attributes.as_ref().unwrap().get("department"),
            Some(&"Eng".to_string())
        );

        let warn = actions.iter().find(|a| a.kind == SyncActionKind::Warn).unwrap();
        assert_eq!(warn.user_id, "u2");
        assert_eq!(warn.membership_id.as_deref(), Some("m-2"));

        // Containment: no action mentions anything but the managed group.
        assert!(actions.iter().all(|a| a.group_id == "G1"));
    }

    #[test]
    fn remove_policy_turns_warnings_into_removals() {
        let users = vec![user("u2", "u2@example.com", &[("department", "Sales")])];
        let groups = vec![group("G1", &[("u2", "m-2")])];
        let actions = compute_sync_actions(
            &users,
            &groups,
            &engineering_mapper("G1"),
            ManualAssignmentPolicy::Remove,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, SyncActionKind::Remove);
        assert_eq!(actions[0].membership_id.as_deref(), Some("m-2"));
    }

    #[test]
    fn settled_state_produces_no_actions() {
        let users = vec![user("u1", "u1@example.com", &[("department", "Eng")])];
        let groups = vec![group("G1", &[("u1", "m-1")])];
        let actions = compute_sync_actions(
            &users,
            &groups,
            &engineering_mapper("G1"),
            ManualAssignmentPolicy::Remove,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn rerun_after_applying_actions_is_idempotent() {
        let users = vec![
            user("u1", "u1@example.com", &[("department", "Eng")]),
            user("u2", "u2@example.com", &[("department", "Sales")]),
        ];
        let mapper = engineering_mapper("G1");

        let before = vec![group("G1", &[("u2", "m-2")])];
        let first =
            compute_sync_actions(&users, &before, &mapper, ManualAssignmentPolicy::Remove);
        assert_eq!(first.len(), 2);

        // Apply: u1 added, u2 removed.
        let after = vec![group("G1", &[("u1", "m-new")])];
        let second =
            compute_sync_actions(&users, &after, &mapper, ManualAssignmentPolicy::Remove);
        assert!(second.is_empty());
    }

    #[test]
    fn managed_group_without_rule_still_sweeps_manual_members() {
        let users = vec![user("u1", "u1@example.com", &[("department", "Eng")])];
        // G9 is managed but no rule targets it.
        let groups = vec![group("G9", &[("u1", "m-1")])];
        let actions = compute_sync_actions(
            &users,
            &groups,
            &engineering_mapper("G1"),
            ManualAssignmentPolicy::Warn,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, SyncActionKind::Warn);
        assert_eq!(actions[0].group_id, "G9");
    }

    #[test]
    fn unknown_members_are_treated_as_manual() {
        // The member is not in the user snapshot at all.
        let users: Vec<SsoUser> = Vec::new();
        let groups = vec![group("G1", &[("ghost", "m-9")])];
        let actions = compute_sync_actions(
            &users,
            &groups,
            &engineering_mapper("G1"),
            ManualAssignmentPolicy::Warn,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].user_email, "ghost");
    }
}
