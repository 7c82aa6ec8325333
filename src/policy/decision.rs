use std::collections::BTreeSet;

use serde::Serialize;

use super::statement::{GroupStatement, PolicyConfiguration, ResourceSnapshot, Statement};

/// What the policy permits for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permit {
    /// Grant without waiting for a human.
    Auto,
    /// Grant only after one of the carried approvers approves.
    NeedsApproval,
    Deny,
}

/// Why the evaluator decided what it decided. Drives message composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ApprovalNotRequired,
    SelfApproval,
    RequiresApproval,
    NoApprovers,
    NoStatements,
    /// The policy document could not be loaded or resolved; non-retryable.
    ConfigurationError,
}

/// Pure output of the evaluator for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub permit: Permit,
    pub reason: DecisionReason,
    /// Union of the approvers of every matching statement. Empty only when
    /// the permit is `Auto` via approval-not-required, or `Deny`.
    pub approvers: BTreeSet<String>,
    pub allow_self_approval: bool,
    pub approval_not_required: bool,
}

impl Decision {
    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            permit: Permit::Deny,
            reason,
            approvers: BTreeSet::new(),
            allow_self_approval: false,
            approval_not_required: false,
        }
    }

    /// A decision that needs approval but has nobody who could legally give
    /// it: every approver is the requester, and self-approval is denied.
    /// Legal but unusable; the request flow reports it to the requester.
    pub fn is_unsatisfiable(&self, requester_email: &str) -> bool {
        self.permit == Permit::NeedsApproval
            && !self.allow_self_approval
            && self.approvers.iter().all(|a| a == requester_email)
    }
}

/// Tristate aggregation shared by both flags: any explicit `false` in a
/// matching statement wins over any `true`; all-undecided collapses to
/// `false`.
fn aggregate_flag(values: impl Iterator<Item = Option<bool>>) -> bool {
    let mut any_true = false;
    for value in values {
        match value {
            Some(false) => return false,
            Some(true) => any_true = true,
            None => {}
        }
    }
    any_true
}

struct Aggregate {
    matched: usize,
    approvers: BTreeSet<String>,
    allow_self_approval: bool,
    approval_not_required: bool,
}

fn aggregate<'a, S: 'a>(
    matching: impl Iterator<Item = &'a S> + Clone,
    approvers_of: impl Fn(&S) -> &BTreeSet<String>,
    self_approval_of: impl Fn(&S) -> Option<bool>,
    not_required_of: impl Fn(&S) -> Option<bool>,
) -> Aggregate {
    Aggregate {
        matched: matching.clone().count(),
        approvers: matching
            .clone()
            .flat_map(|s| approvers_of(s).iter().cloned())
            .collect(),
        allow_self_approval: aggregate_flag(matching.clone().map(|s| self_approval_of(s))),
        approval_not_required: aggregate_flag(matching.map(|s| not_required_of(s))),
    }
}

fn decide(requester_email: &str, agg: Aggregate) -> Decision {
    if agg.matched == 0 {
        return Decision::deny(DecisionReason::NoStatements);
    }

    if agg.approval_not_required {
        return Decision {
            permit: Permit::Auto,
            reason: DecisionReason::ApprovalNotRequired,
            approvers: agg.approvers,
            allow_self_approval: agg.allow_self_approval,
            approval_not_required: true,
        };
    }

    if agg.allow_self_approval && agg.approvers.contains(requester_email) {
        return Decision {
            permit: Permit::Auto,
            reason: DecisionReason::SelfApproval,
            approvers: agg.approvers,
            allow_self_approval: true,
            approval_not_required: false,
        };
    }

    if !agg.approvers.is_empty() {
        return Decision {
            permit: Permit::NeedsApproval,
            reason: DecisionReason::RequiresApproval,
            approvers: agg.approvers,
            allow_self_approval: agg.allow_self_approval,
            approval_not_required: false,
        };
    }

    Decision::deny(DecisionReason::NoApprovers)
}

/// Evaluate an account-access request against the policy.
///
/// Deterministic and side-effect free: the same configuration, request and
/// snapshot always produce the same decision.
pub fn evaluate_account_request(
    config: &PolicyConfiguration,
    snapshot: &ResourceSnapshot,
    account_id: &str,
    permission_set_name: &str,
    requester_email: &str,
) -> Decision {
    let matching = config
        .statements
        .iter()
        .filter(|s| s.affects(account_id, permission_set_name, snapshot));
    let agg = aggregate(
        matching,
        |s: &Statement| &s.approvers,
        |s| s.allow_self_approval,
        |s| s.approval_not_required,
    );
    decide(requester_email, agg)
}

/// Evaluate a group-access request against the policy.
pub fn evaluate_group_request(
    config: &PolicyConfiguration,
    group_id: &str,
    requester_email: &str,
) -> Decision {
    let matching = config.group_statements.iter().filter(|s| s.affects(group_id));
    let agg = aggregate(
        matching,
        |s: &GroupStatement| &s.approvers,
        |s| s.allow_self_approval,
        |s| s.approval_not_required,
    );
    decide(requester_email, agg)
}

fn authorize(agg: Aggregate, approver_email: &str, requester_email: &str) -> bool {
    if !agg.approvers.contains(approver_email) {
        return false;
    }
    approver_email != requester_email || agg.allow_self_approval
}

/// Whether `approver_email` may approve the given account request. Used when
/// a decision button is clicked: the click carries an identity that must be
/// re-checked against the policy, not trusted from the message.
pub fn authorize_account_approval(
    config: &PolicyConfiguration,
    snapshot: &ResourceSnapshot,
    account_id: &str,
    permission_set_name: &str,
    approver_email: &str,
    requester_email: &str,
) -> bool {
    let matching = config
        .statements
        .iter()
        .filter(|s| s.affects(account_id, permission_set_name, snapshot));
    let agg = aggregate(
        matching,
        |s: &Statement| &s.approvers,
        |s| s.allow_self_approval,
        |s| s.approval_not_required,
    );
    authorize(agg, approver_email, requester_email)
}

/// Whether `approver_email` may approve the given group request.
pub fn authorize_group_approval(
    config: &PolicyConfiguration,
    group_id: &str,
    approver_email: &str,
    requester_email: &str,
) -> bool {
    let matching = config.group_statements.iter().filter(|s| s.affects(group_id));
    let agg = aggregate(
        matching,
        |s: &GroupStatement| &s.approvers,
        |s| s.allow_self_approval,
        |s| s.approval_not_required,
    );
    authorize(agg, approver_email, requester_email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ANY;

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot::new(
            [
                "111111111111".to_string(),
                "222222222222".to_string(),
                "333333333333".to_string(),
            ],
            ["ReadOnly".to_string(), "Admin".to_string(), "Billing".to_string()],
        )
    }

    fn statement(
        resources: &[&str],
        permission_sets: &[&str],
        approvers: &[&str],
        allow_self_approval: Option<bool>,
        approval_not_required: Option<bool>,
    ) -> Statement {
        Statement {
            resources: resources.iter().map(|s| s.to_string()).collect(),
            permission_sets: permission_sets.iter().map(|s| s.to_string()).collect(),
            approvers: approvers.iter().map(|s| s.to_string()).collect(),
            allow_self_approval,
            approval_not_required,
        }
    }

    fn config(statements: Vec<Statement>) -> PolicyConfiguration {
        PolicyConfiguration { statements, group_statements: vec![] }
    }

    #[test]
    fn auto_approve_when_approval_not_required() {
        let cfg = config(vec![statement(&[ANY], &["ReadOnly"], &[], None, Some(true))]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "111111111111", "ReadOnly", "a@x");
        assert_eq!(decision.permit, Permit::Auto);
        assert_eq!(decision.reason, DecisionReason::ApprovalNotRequired);
        assert!(decision.approvers.is_empty());
    }

    #[test]
    fn self_approval_when_requester_is_approver() {
        let cfg = config(vec![statement(
            &["111111111111"],
            &["Billing"],
            &["a@x"],
            Some(true),
            None,
        )]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "111111111111", "Billing", "a@x");
        assert_eq!(decision.permit, Permit::Auto);
        assert_eq!(decision.reason, DecisionReason::SelfApproval);
        assert_eq!(decision.approvers.len(), 1);
        assert!(decision.approvers.contains("a@x"));
    }

    #[test]
    fn approvers_aggregate_across_matching_statements() {
        let cfg = config(vec![
            statement(&[ANY], &[ANY], &["cto@x"], Some(true), None),
            statement(&["222222222222"], &["Admin"], &["mgr@x"], None, None),
        ]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "222222222222", "Admin", "dev@x");
        assert_eq!(decision.permit, Permit::NeedsApproval);
        let expected: BTreeSet<String> = ["cto@x", "mgr@x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(decision.approvers, expected);
    }

    #[test]
    fn explicit_self_approval_deny_wins() {
        let cfg = config(vec![
            statement(&[ANY], &[ANY], &["cto@x"], Some(true), None),
            statement(&["333333333333"], &["Admin"], &[], Some(false), None),
        ]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "333333333333", "Admin", "cto@x");
        // The wildcard statement would allow self-approval, but the explicit
        // false on the targeted statement dominates.
        assert_eq!(decision.permit, Permit::NeedsApproval);
        assert!(!decision.allow_self_approval);
        assert!(decision.approvers.contains("cto@x"));
        assert!(decision.is_unsatisfiable("cto@x"));
        assert!(!decision.is_unsatisfiable("dev@x"));
    }

    #[test]
    fn explicit_approval_not_required_deny_wins() {
        let cfg = config(vec![
            statement(&[ANY], &[ANY], &["sec@x"], None, Some(true)),
            statement(&["333333333333"], &["Admin"], &[], None, Some(false)),
        ]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "333333333333", "Admin", "dev@x");
        // Not auto-approved; falls through to the approver path.
        assert_eq!(decision.permit, Permit::NeedsApproval);
        assert!(!decision.approval_not_required);
    }

    #[test]
    fn deny_when_no_statements_match() {
        let cfg = config(vec![statement(&["111111111111"], &["ReadOnly"], &["a@x"], None, None)]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "222222222222", "Admin", "dev@x");
        assert_eq!(decision.permit, Permit::Deny);
        assert_eq!(decision.reason, DecisionReason::NoStatements);
    }

    #[test]
    fn deny_when_no_approvers_exist() {
        let cfg = config(vec![statement(&["111111111111"], &["ReadOnly"], &[], None, None)]);
        let decision =
            evaluate_account_request(&cfg, &snapshot(), "111111111111", "ReadOnly", "dev@x");
        assert_eq!(decision.permit, Permit::Deny);
        assert_eq!(decision.reason, DecisionReason::NoApprovers);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let cfg = config(vec![
            statement(&[ANY], &[ANY], &["cto@x"], Some(true), None),
            statement(&["222222222222"], &["Admin"], &["mgr@x"], None, None),
        ]);
        let first =
            evaluate_account_request(&cfg, &snapshot(), "222222222222", "Admin", "dev@x");
        for _ in 0..10 {
            let again =
                evaluate_account_request(&cfg, &snapshot(), "222222222222", "Admin", "dev@x");
            assert_eq!(first, again);
        }
    }

    #[test]
    fn widening_to_wildcard_never_shrinks_approvers() {
        let narrow = config(vec![statement(
            &["222222222222"],
            &["Admin"],
            &["mgr@x"],
            None,
            None,
        )]);
        let wide = config(vec![statement(&[ANY], &[ANY], &["mgr@x"], None, None)]);
        let from_narrow =
            evaluate_account_request(&narrow, &snapshot(), "222222222222", "Admin", "dev@x");
        let from_wide =
            evaluate_account_request(&wide, &snapshot(), "222222222222", "Admin", "dev@x");
        assert!(from_narrow.approvers.is_subset(&from_wide.approvers));
    }

    #[test]
    fn group_requests_use_group_statements() {
        let cfg = PolicyConfiguration {
            statements: vec![],
            group_statements: vec![GroupStatement {
                resources: ["g-1".to_string()].into_iter().collect(),
                approvers: ["lead@x".to_string()].into_iter().collect(),
                allow_self_approval: None,
                approval_not_required: None,
            }],
        };
        let decision = evaluate_group_request(&cfg, "g-1", "dev@x");
        assert_eq!(decision.permit, Permit::NeedsApproval);
        assert!(decision.approvers.contains("lead@x"));

        let miss = evaluate_group_request(&cfg, "g-2", "dev@x");
        assert_eq!(miss.reason, DecisionReason::NoStatements);
    }

    #[test]
    fn approval_authorization_requires_listed_approver() {
        let cfg = config(vec![statement(
            &["111111111111"],
            &["Admin"],
            &["mgr@x"],
            None,
            None,
        )]);
        let snap = snapshot();
        assert!(authorize_account_approval(&cfg, &snap, "111111111111", "Admin", "mgr@x", "dev@x"));
        assert!(!authorize_account_approval(
            &cfg, &snap, "111111111111", "Admin", "other@x", "dev@x"
        ));
        // Self-approval attempt without an explicit allowance.
        assert!(!authorize_account_approval(
            &cfg, &snap, "111111111111", "Admin", "mgr@x", "mgr@x"
        ));
    }

    #[test]
    fn approval_authorization_allows_self_when_permitted() {
        let cfg = config(vec![statement(
            &["111111111111"],
            &["Admin"],
            &["mgr@x"],
            Some(true),
            None,
        )]);
        assert!(authorize_account_approval(
            &cfg,
            &snapshot(),
            "111111111111",
            "Admin",
            "mgr@x",
            "mgr@x"
        ));
    }
}
