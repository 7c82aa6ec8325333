use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::aws::types::AwsAccount;

/// Wildcard marker accepted in account and permission-set positions.
pub const ANY: &str = "*";

/// A single account-level approval statement.
///
/// `resources` holds twelve-digit account ids (or [`ANY`]); `permission_sets`
/// holds permission-set names (or [`ANY`]). The two tristate flags stay
/// `None` when the statement does not take a position, which matters for the
/// explicit-deny aggregation in the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub resources: BTreeSet<String>,
    pub permission_sets: BTreeSet<String>,
    pub approvers: BTreeSet<String>,
    pub allow_self_approval: Option<bool>,
    pub approval_not_required: Option<bool>,
}

impl Statement {
    /// Whether this statement covers the given account / permission-set pair.
    ///
    /// A wildcard only matches resources that exist in the snapshot: a
    /// request for an account the directory does not know is never matched
    /// by `*`.
    pub fn affects(&self, account_id: &str, permission_set: &str, snapshot: &ResourceSnapshot) -> bool {
        let account_match = self.resources.contains(account_id)
            || (self.resources.contains(ANY) && snapshot.account_ids.contains(account_id));
        let permission_set_match = self.permission_sets.contains(permission_set)
            || (self.permission_sets.contains(ANY)
                && snapshot.permission_set_names.contains(permission_set));
        account_match && permission_set_match
    }

    /// Whether any resource position carries the wildcard.
    pub fn has_account_wildcard(&self) -> bool {
        self.resources.contains(ANY)
    }
}

/// A group-level approval statement. Group ids are always explicit; there is
/// no wildcard form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatement {
    pub resources: BTreeSet<String>,
    pub approvers: BTreeSet<String>,
    pub allow_self_approval: Option<bool>,
    pub approval_not_required: Option<bool>,
}

impl GroupStatement {
    pub fn affects(&self, group_id: &str) -> bool {
        self.resources.contains(group_id)
    }
}

/// The parsed approval-policy document: an ordered sequence of statements.
/// Duplicates are allowed; evaluation is set-wise over the matching subset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfiguration {
    pub statements: Vec<Statement>,
    pub group_statements: Vec<GroupStatement>,
}

impl PolicyConfiguration {
    /// Group ids referenced by any group statement.
    pub fn referenced_group_ids(&self) -> BTreeSet<&str> {
        self.group_statements
            .iter()
            .flat_map(|s| s.resources.iter().map(String::as_str))
            .collect()
    }
}

/// Point-in-time view of the valid accounts and permission-set names used
/// for wildcard expansion. Built from directory listings before evaluation;
/// downstream actions tolerate the snapshot aging because executor calls are
/// idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub account_ids: BTreeSet<String>,
    pub permission_set_names: BTreeSet<String>,
}

impl ResourceSnapshot {
    pub fn new(
        account_ids: impl IntoIterator<Item = String>,
        permission_set_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            account_ids: account_ids.into_iter().collect(),
            permission_set_names: permission_set_names.into_iter().collect(),
        }
    }
}

/// Accounts the reconciler must sweep: every account named explicitly by a
/// statement, plus all known accounts when any statement carries the
/// wildcard. Accounts covered by no statement are skipped entirely.
pub fn accounts_in_scope<'a>(
    config: &PolicyConfiguration,
    all_accounts: &'a [AwsAccount],
) -> Vec<&'a AwsAccount> {
    if config.statements.iter().any(Statement::has_account_wildcard) {
        return all_accounts.iter().collect();
    }

    let explicit: BTreeSet<&str> = config
        .statements
        .iter()
        .flat_map(|s| s.resources.iter().map(String::as_str))
        .collect();

    all_accounts
        .iter()
        .filter(|account| explicit.contains(account.id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot::new(
            ["111111111111".to_string(), "222222222222".to_string()],
            ["ReadOnly".to_string(), "Admin".to_string()],
        )
    }

    fn statement(resources: &[&str], permission_sets: &[&str]) -> Statement {
        Statement {
            resources: resources.iter().map(|s| s.to_string()).collect(),
            permission_sets: permission_sets.iter().map(|s| s.to_string()).collect(),
            approvers: BTreeSet::new(),
            allow_self_approval: None,
            approval_not_required: None,
        }
    }

    #[test]
    fn explicit_resource_and_permission_set_match() {
        let s = statement(&["111111111111"], &["ReadOnly"]);
        assert!(s.affects("111111111111", "ReadOnly", &snapshot()));
        assert!(!s.affects("222222222222", "ReadOnly", &snapshot()));
        assert!(!s.affects("111111111111", "Admin", &snapshot()));
    }

    #[test]
    fn wildcard_matches_only_known_resources() {
        let s = statement(&[ANY], &[ANY]);
        assert!(s.affects("222222222222", "Admin", &snapshot()));
        // An account or permission set the directory does not know is not
        // matched by the wildcard.
        assert!(!s.affects("333333333333", "Admin", &snapshot()));
        assert!(!s.affects("111111111111", "Billing", &snapshot()));
    }

    #[test]
    fn group_statement_is_explicit_only() {
        let s = GroupStatement {
            resources: ["g-1".to_string()].into_iter().collect(),
            approvers: BTreeSet::new(),
            allow_self_approval: None,
            approval_not_required: None,
        };
        assert!(s.affects("g-1"));
        assert!(!s.affects("g-2"));
    }

    #[test]
    fn scope_is_explicit_accounts_without_wildcard() {
        let accounts = vec![
            AwsAccount { id: "111111111111".into(), name: "prod".into() },
            AwsAccount { id: "222222222222".into(), name: "dev".into() },
        ];
        let config = PolicyConfiguration {
            statements: vec![statement(&["111111111111"], &["ReadOnly"])],
            group_statements: vec![],
        };
        let in_scope = accounts_in_scope(&config, &accounts);
        assert_eq!(in_scope.len(), 1);
        assert_eq!(in_scope[0].id, "111111111111");
    }

    #[test]
    fn scope_is_everything_with_wildcard() {
        let accounts = vec![
            AwsAccount { id: "111111111111".into(), name: "prod".into() },
            AwsAccount { id: "222222222222".into(), name: "dev".into() },
        ];
        let config = PolicyConfiguration {
            statements: vec![statement(&[ANY], &["ReadOnly"])],
            group_statements: vec![],
        };
        assert_eq!(accounts_in_scope(&config, &accounts).len(), 2);
    }
}
