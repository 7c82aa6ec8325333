//! Payloads carried by one-shot scheduler jobs into the revoker process.
//!
//! Every schedule created by this crate targets the revoker entry point and
//! carries one of these variants as its JSON input. The `action` tag is the
//! discriminator, so unknown or hand-made inputs fail to parse instead of
//! being misrouted.

use serde::{Deserialize, Serialize};

use crate::aws::types::{GroupAssignment, UserAccountAssignment};

/// Context for a scheduled account-assignment revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRevokePayload {
    pub schedule_name: String,
    pub assignment: UserAccountAssignment,
    pub request_id: String,
    pub requester_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_email: Option<String>,
    pub permission_duration_secs: i64,
    #[serde(default)]
    pub secondary_domain_was_used: bool,
}

/// Context for a scheduled group-membership revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRevokePayload {
    pub schedule_name: String,
    pub assignment: GroupAssignment,
    pub request_id: String,
    pub requester_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_email: Option<String>,
    pub permission_duration_secs: i64,
    #[serde(default)]
    pub secondary_domain_was_used: bool,
}

/// Everything the revoker process can be invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RevokerEvent {
    /// A revocation schedule fired for an account assignment.
    ScheduledRevoke { revoke: AccountRevokePayload },
    /// A revocation schedule fired for a group membership.
    ScheduledGroupRevoke { revoke: GroupRevokePayload },
    /// High-frequency sweep: warn about ungoverned assignments, mutate nothing.
    CheckInconsistency {},
    /// Low-frequency sweep: revoke ungoverned assignments.
    ScheduledRevocation {},
    /// Remind approvers about a still-pending request, then re-arm.
    ApproverNotification {
        schedule_name: String,
        channel_id: String,
        message_ts: String,
        time_to_wait_secs: u64,
    },
    /// A pending request passed its expiration window.
    ButtonExpiry {
        schedule_name: String,
        channel_id: String,
        message_ts: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tag_discriminates_variants() {
        let event = RevokerEvent::ScheduledRevoke {
            revoke: AccountRevokePayload {
                schedule_name: "rev-abc".to_string(),
                assignment: UserAccountAssignment {
                    instance_arn: "arn:aws:sso:::instance/i-1".to_string(),
                    account_id: "111111111111".to_string(),
                    permission_set_arn: "arn:aws:sso:::permissionSet/i-1/ps-1".to_string(),
                    principal_id: "u-1".to_string(),
                },
                request_id: "r-1".to_string(),
                requester_email: "dev@example.com".to_string(),
                approver_email: Some("mgr@example.com".to_string()),
                permission_duration_secs: 3600,
                secondary_domain_was_used: false,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "scheduled_revoke");

        let parsed: RevokerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn sweep_events_round_trip() {
        for (event, tag) in [
            (RevokerEvent::CheckInconsistency {}, "check_inconsistency"),
            (RevokerEvent::ScheduledRevocation {}, "scheduled_revocation"),
        ] {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["action"], tag);
            assert_eq!(serde_json::from_value::<RevokerEvent>(json).unwrap(), event);
        }
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_str::<RevokerEvent>(r#"{"action": "drop_tables"}"#);
        assert!(err.is_err());
    }
}
