use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A member account of the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsAccount {
    pub id: String,
    pub name: String,
}

/// A permission set in the SSO instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSetInfo {
    pub arn: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The SSO instance this deployment governs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoInstance {
    pub arn: String,
    pub identity_store_id: String,
}

/// A user in the identity store, with the attribute map the syncer
/// evaluates mapping rules against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoUser {
    pub user_id: String,
    pub user_name: String,
    pub email: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// A group in the identity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoGroup {
    pub group_id: String,
    pub name: String,
    #[allow(dead_code)]
    pub description: Option<String>,
}

/// One membership row of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembershipInfo {
    pub membership_id: String,
    pub group_id: String,
    pub user_id: String,
}

/// The result of resolving a requester's chat email to a directory user.
/// `secondary_domain_was_used` must be surfaced by every audit row and
/// notification for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrincipal {
    pub user_id: String,
    pub email_used: String,
    pub secondary_domain_was_used: bool,
}

/// Identity of a user-level account assignment, as created by the grant
/// executor and carried by revocation schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccountAssignment {
    pub instance_arn: String,
    pub account_id: String,
    pub permission_set_arn: String,
    pub principal_id: String,
}

/// A live account assignment as listed from the control plane; the
/// principal may be a user or a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAssignmentInfo {
    pub account_id: String,
    pub permission_set_arn: String,
    pub principal_id: String,
    pub principal_is_user: bool,
}

/// Identity of a group membership granted through a request, carried by
/// group revocation schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub identity_store_id: String,
    pub group_id: String,
    pub group_name: String,
    pub membership_id: String,
    pub user_principal_id: String,
}
