//! Message composition for every notification the system sends.
//!
//! Pure string building; the notifier decides where each message goes.
//! Whenever a request was resolved through a secondary email domain, the
//! banner from [`fallback_domain_banner`] is prepended so the risk is
//! visible in every user-facing message about that request.

use chrono::Duration;

use crate::policy::{Decision, DecisionReason};
use crate::syncer::SyncRunResult;

/// Mention markup for a chat user id.
pub fn mention(user_id: &str) -> String {
    format!("<@{user_id}>")
}

/// Warning banner shown whenever the requester was resolved through a
/// fallback email domain.
pub fn fallback_domain_banner(email_used: &str) -> String {
    format!(
        ":warning: The requester was matched through a secondary email domain \
         ({email_used}). Verify this is the intended person before approving."
    )
}

/// Prepend the fallback-domain banner when the flag is set; otherwise the
/// body passes through untouched. Every message about a fallback-resolved
/// request goes through here.
pub fn with_banner(secondary_domain_was_used: bool, email_used: &str, body: String) -> String {
    if secondary_domain_was_used {
        format!("{}\n{body}", fallback_domain_banner(email_used))
    } else {
        body
    }
}

/// Human-readable duration, hours and minutes.
pub fn humanize_duration(duration: Duration) -> String {
    let minutes = duration.num_minutes();
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("{m} minute(s)"),
        (h, 0) => format!("{h} hour(s)"),
        (h, m) => format!("{h} hour(s) {m} minute(s)"),
    }
}

/// The root message for a new account-access request.
#[allow(clippy::too_many_arguments)]
pub fn account_request_message(
    status_emoji: &str,
    requester_mention: &str,
    account_name: &str,
    account_id: &str,
    permission_set_name: &str,
    reason: &str,
    duration: Duration,
    secondary_domain_was_used: bool,
    email_used: &str,
) -> String {
    let body = format!(
        "{status_emoji} {requester_mention} requests *{permission_set_name}* in \
         *{account_name}* ({account_id}) for {}.\n>Reason: {reason}",
        humanize_duration(duration)
    );
    with_banner(secondary_domain_was_used, email_used, body)
}

/// The root message for a new group-access request.
pub fn group_request_message(
    status_emoji: &str,
    requester_mention: &str,
    group_name: &str,
    group_id: &str,
    reason: &str,
    duration: Duration,
    secondary_domain_was_used: bool,
    email_used: &str,
) -> String {
    let body = format!(
        "{status_emoji} {requester_mention} requests membership of *{group_name}* \
         ({group_id}) for {}.\n>Reason: {reason}",
        humanize_duration(duration)
    );
    with_banner(secondary_domain_was_used, email_used, body)
}

/// Thread reply describing the decision, and the DM variant of it.
pub fn decision_texts(decision: &Decision, approver_mentions: &str) -> (String, String) {
    match decision.reason {
        DecisionReason::ApprovalNotRequired => (
            "Approval for this resource is not required. Request will be approved automatically."
                .to_string(),
            "Approval for this resource is not required. Your request will be approved \
             automatically."
                .to_string(),
        ),
        DecisionReason::SelfApproval => (
            "Self approval is allowed and requester is an approver. Request will be approved \
             automatically."
                .to_string(),
            "Self approval is allowed and you are an approver. Your request will be approved \
             automatically."
                .to_string(),
        ),
        DecisionReason::RequiresApproval => (
            format!("{approver_mentions} there is a request waiting for the approval."),
            format!("Your request is waiting for the approval from {approver_mentions}."),
        ),
        DecisionReason::NoApprovers => (
            "Nobody can approve this request.".to_string(),
            "Nobody can approve this request.".to_string(),
        ),
        DecisionReason::NoStatements => (
            "No policy covers this resource.".to_string(),
            "No policy covers this resource.".to_string(),
        ),
        DecisionReason::ConfigurationError => (
            "The approval policy could not be loaded; this request cannot proceed.".to_string(),
            "The approval policy could not be loaded; your request cannot proceed.".to_string(),
        ),
    }
}

/// Told to the requester when the only possible approver is themselves and
/// self-approval is denied.
pub fn unsatisfiable_request_text() -> String {
    "This request cannot be satisfied: you are the only configured approver and \
     self-approval is not allowed for this resource."
        .to_string()
}

pub fn request_approved_text(requester_mention: &str, approver_mention: &str) -> String {
    format!("Permissions granted to {requester_mention} by {approver_mention}.")
}

pub fn request_denied_text(approver_mention: &str) -> String {
    format!("Request was discarded by {approver_mention}.")
}

pub fn denied_dm_text(approver_mention: &str) -> String {
    format!("Your request was discarded by {approver_mention}.")
}

pub fn cannot_approve_text(approver_mention: &str) -> String {
    format!("{approver_mention} you can not approve this request.")
}

pub fn duplicate_in_flight_text(approver_mention: &str) -> String {
    format!("{approver_mention} request is already in progress, please wait for the result.")
}

pub fn grant_succeeded_text(requester_mention: &str) -> String {
    format!("Permissions granted to {requester_mention}.")
}

pub fn grant_failed_text(requester_mention: &str) -> String {
    format!(
        "{requester_mention} your request failed while granting access. Operators have been \
         notified; see the audit log for details."
    )
}

pub fn account_revoked_text(user_mention: &str, role_name: &str, account_name: &str) -> String {
    format!("Revoked role {role_name} for user {user_mention} in account {account_name}.")
}

pub fn group_revoked_text(user_mention: &str, group_name: &str) -> String {
    format!("User {user_mention} has been removed from the group {group_name}.")
}

pub fn request_expired_text(expiration_hours: u64) -> String {
    format!("Request expired after {expiration_hours} hour(s).")
}

pub fn renotification_text(next_wait: Duration) -> String {
    format!(
        "The request is still awaiting approval. The next reminder will be sent in {}, unless \
         the request is approved or discarded beforehand.",
        humanize_duration(next_wait)
    )
}

/// Warn-sweep notice for an ungoverned account assignment.
pub fn inconsistent_assignment_text(
    account_name: &str,
    account_id: &str,
    user_mention: &str,
    next_sweep_notice: &str,
) -> String {
    format!(
        "Inconsistent account assignment detected in {account_name}-{account_id} for \
         {user_mention}. The unidentified assignment will be automatically \
         revoked.{next_sweep_notice}"
    )
}

/// Warn-sweep notice for an ungoverned group membership.
pub fn inconsistent_group_assignment_text(
    group_name: &str,
    group_id: &str,
    user_mention: &str,
    next_sweep_notice: &str,
) -> String {
    format!(
        "Inconsistent group assignment detected in {group_name}-{group_id} for user \
         {user_mention}. The unidentified assignment will be automatically \
         revoked.{next_sweep_notice}"
    )
}

pub fn sync_user_added_text(user_email: &str, group_name: &str, matched: &str) -> String {
    format!("Added {user_email} to group {group_name} (matched attributes: {matched}).")
}

pub fn sync_user_removed_text(user_email: &str, group_name: &str) -> String {
    format!(
        "Removed {user_email} from group {group_name}: membership is not justified by any \
         attribute mapping rule."
    )
}

pub fn manual_assignment_text(user_email: &str, group_name: &str) -> String {
    format!(
        "Manual assignment detected: {user_email} is a member of managed group {group_name} \
         but no attribute mapping rule justifies it."
    )
}

/// End-of-run summary for an attribute sync pass.
pub fn sync_summary_text(result: &SyncRunResult) -> String {
    let mut text = format!(
        "Attribute sync finished: {} users evaluated across {} groups; {} added, {} removed, \
         {} manual assignment(s) detected.",
        result.users_evaluated,
        result.groups_processed,
        result.users_added,
        result.users_removed,
        result.manual_assignments_detected,
    );
    if !result.errors.is_empty() {
        text.push_str(&format!("\n{} error(s); first few:", result.errors.len()));
        for error in result.errors.iter().take(5) {
            text.push_str(&format!("\n• {error}"));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::policy::Permit;

    #[test]
    fn banner_is_prepended_when_fallback_domain_used() {
        let text = account_request_message(
            ":hourglass:",
            "<@U1>",
            "prod",
            "111111111111",
            "ReadOnly",
            "deploy",
            Duration::hours(1),
            true,
            "dev@fallback.example",
        );
        assert!(text.starts_with(":warning:"));
        assert!(text.contains("dev@fallback.example"));
    }

    #[test]
    fn no_banner_without_fallback_domain() {
        let text = account_request_message(
            ":hourglass:",
            "<@U1>",
            "prod",
            "111111111111",
            "ReadOnly",
            "deploy",
            Duration::hours(1),
            false,
            "dev@example.com",
        );
        assert!(text.starts_with(":hourglass:"));
    }

    #[test]
    fn decision_texts_cover_every_reason() {
        for reason in [
            DecisionReason::ApprovalNotRequired,
            DecisionReason::SelfApproval,
            DecisionReason::RequiresApproval,
            DecisionReason::NoApprovers,
            DecisionReason::NoStatements,
            DecisionReason::ConfigurationError,
        ] {
            let decision = Decision {
                permit: Permit::Deny,
                reason,
                approvers: BTreeSet::new(),
                allow_self_approval: false,
                approval_not_required: false,
            };
            let (channel, dm) = decision_texts(&decision, "<@U2>");
            assert!(!channel.is_empty());
            assert!(!dm.is_empty());
        }
    }

    #[test]
    fn durations_humanize() {
        assert_eq!(humanize_duration(Duration::minutes(45)), "45 minute(s)");
        assert_eq!(humanize_duration(Duration::hours(2)), "2 hour(s)");
        assert_eq!(
            humanize_duration(Duration::minutes(90)),
            "1 hour(s) 30 minute(s)"
        );
    }
}
