//! The approval-policy document.
//!
//! A JSON object `{"statements": [...], "group_statements": [...]}` stored
//! in the config bucket. `Resource`, `PermissionSet` and `Approvers` each
//! accept a single string or a list; `"*"` marks the wildcard in account
//! and permission-set positions. Unknown keys are ignored so the document
//! can grow; malformed entries fail the load with an error naming the
//! entry. Whether referenced groups still exist is checked at enforcement
//! time, where a miss is a warning and a skip, never an abort.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use validator::ValidateEmail;

use super::{ConfigError, ConfigResult};
use crate::policy::{GroupStatement, PolicyConfiguration, Statement, ANY};

static ACCOUNT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{12}$").expect("static pattern"));
static PERMISSION_SET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+=,.@-]{1,32}$").expect("static pattern"));
static GROUP_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-f]{10}-)?[A-Fa-f0-9]{8}-[A-Fa-f0-9]{4}-[A-Fa-f0-9]{4}-[A-Fa-f0-9]{4}-[A-Fa-f0-9]{12}$")
        .expect("static pattern")
});

/// A value position that accepts one string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            OneOrMany::One(value) => [value].into_iter().collect(),
            OneOrMany::Many(values) => values.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPolicyDocument {
    #[serde(default, alias = "Statements")]
    statements: Vec<RawStatement>,
    #[serde(default, alias = "GroupStatements")]
    group_statements: Vec<RawGroupStatement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStatement {
    #[serde(default)]
    resource_type: Option<String>,
    resource: OneOrMany,
    permission_set: OneOrMany,
    #[serde(default)]
    approvers: Option<OneOrMany>,
    #[serde(default)]
    allow_self_approval: Option<bool>,
    #[serde(default)]
    approval_is_not_required: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawGroupStatement {
    resource: OneOrMany,
    #[serde(default)]
    approvers: Option<OneOrMany>,
    #[serde(default)]
    allow_self_approval: Option<bool>,
    #[serde(default)]
    approval_is_not_required: Option<bool>,
}

/// Parse and validate the policy document.
pub fn parse_policy_document(bytes: &[u8]) -> ConfigResult<PolicyConfiguration> {
    let raw: RawPolicyDocument = serde_json::from_slice(bytes)
        .map_err(|e| ConfigError::PolicyParse(e.to_string()))?;

    let mut statements = Vec::with_capacity(raw.statements.len());
    for (i, raw_statement) in raw.statements.into_iter().enumerate() {
        statements.push(convert_statement(i, raw_statement)?);
    }

    let mut group_statements = Vec::with_capacity(raw.group_statements.len());
    for (i, raw_statement) in raw.group_statements.into_iter().enumerate() {
        group_statements.push(convert_group_statement(i, raw_statement)?);
    }

    Ok(PolicyConfiguration { statements, group_statements })
}

fn convert_statement(index: usize, raw: RawStatement) -> ConfigResult<Statement> {
    if let Some(resource_type) = &raw.resource_type {
        if resource_type != "Account" {
            return Err(ConfigError::PolicyParse(format!(
                "statement {index}: unsupported ResourceType {resource_type:?}"
            )));
        }
    }

    let resources = raw.resource.into_set();
    for resource in &resources {
        if resource != ANY && !ACCOUNT_ID_PATTERN.is_match(resource) {
            return Err(ConfigError::PolicyParse(format!(
                "statement {index}: {resource:?} is not a twelve-digit account id or \"*\""
            )));
        }
    }

    let permission_sets = raw.permission_set.into_set();
    for name in &permission_sets {
        if name != ANY && !PERMISSION_SET_PATTERN.is_match(name) {
            return Err(ConfigError::PolicyParse(format!(
                "statement {index}: {name:?} is not a valid permission set name or \"*\""
            )));
        }
    }

    Ok(Statement {
        resources,
        permission_sets,
        approvers: validated_approvers(index, raw.approvers)?,
        allow_self_approval: raw.allow_self_approval,
        approval_not_required: raw.approval_is_not_required,
    })
}

fn convert_group_statement(index: usize, raw: RawGroupStatement) -> ConfigResult<GroupStatement> {
    let resources = raw.resource.into_set();
    for group_id in &resources {
        if !GROUP_ID_PATTERN.is_match(group_id) {
            return Err(ConfigError::PolicyParse(format!(
                "group statement {index}: {group_id:?} is not a group id; wildcards are not \
                 supported for groups"
            )));
        }
    }

    Ok(GroupStatement {
        resources,
        approvers: validated_approvers(index, raw.approvers)?,
        allow_self_approval: raw.allow_self_approval,
        approval_not_required: raw.approval_is_not_required,
    })
}

fn validated_approvers(
    index: usize,
    approvers: Option<OneOrMany>,
) -> ConfigResult<BTreeSet<String>> {
    let approvers = approvers.map(OneOrMany::into_set).unwrap_or_default();
    for email in &approvers {
        if !email.validate_email() {
            return Err(ConfigError::PolicyParse(format!(
                "statement {index}: approver {email:?} is not a valid email address"
            )));
        }
    }
    Ok(approvers)
}

/// Where the policy document lives and how to fetch it.
#[derive(Clone)]
pub struct PolicyDocumentSource {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
}

impl PolicyDocumentSource {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Fetch and parse the current policy document.
    pub async fn load(&self) -> ConfigResult<PolicyConfiguration> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| ConfigError::PolicyFetch(e.into_service_error().to_string()))?;
        let bytes = out
            .body
            .collect()
            .await
            .map_err(|e| ConfigError::PolicyFetch(e.to_string()))?
            .into_bytes();
        let config = parse_policy_document(&bytes)?;
        tracing::info!(
            statements = config.statements.len(),
            group_statements = config.group_statements.len(),
            "Loaded approval policy document"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_strings_and_lists_both_parse() {
        let doc = br#"{
            "statements": [
                {
                    "ResourceType": "Account",
                    "Resource": "*",
                    "PermissionSet": ["ReadOnly", "Billing"],
                    "Approvers": "cto@example.com",
                    "AllowSelfApproval": true
                },
                {
                    "Resource": ["111111111111"],
                    "PermissionSet": "*",
                    "ApprovalIsNotRequired": true
                }
            ]
        }"#;
        let config = parse_policy_document(doc).unwrap();
        assert_eq!(config.statements.len(), 2);
        assert!(config.statements[0].resources.contains("*"));
        assert_eq!(config.statements[0].permission_sets.len(), 2);
        assert_eq!(config.statements[0].allow_self_approval, Some(true));
        assert_eq!(config.statements[0].approval_not_required, None);
        assert_eq!(config.statements[1].approval_not_required, Some(true));
        assert!(config.statements[1].approvers.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let doc = br#"{
            "statements": [{
                "Resource": "111111111111",
                "PermissionSet": "ReadOnly",
                "Comment": "temporary",
                "TicketRef": 42
            }]
        }"#;
        let config = parse_policy_document(doc).unwrap();
        assert_eq!(config.statements.len(), 1);
    }

    #[test]
    fn malformed_account_id_fails_with_context() {
        let doc = br#"{
            "statements": [{ "Resource": "not-an-account", "PermissionSet": "*" }]
        }"#;
        match parse_policy_document(doc) {
            Err(ConfigError::PolicyParse(message)) => {
                assert!(message.contains("statement 0"));
                assert!(message.contains("not-an-account"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_approver_email_fails() {
        let doc = br#"{
            "statements": [{
                "Resource": "111111111111",
                "PermissionSet": "ReadOnly",
                "Approvers": ["not-an-email"]
            }]
        }"#;
        assert!(matches!(
            parse_policy_document(doc),
            Err(ConfigError::PolicyParse(_))
        ));
    }

    #[test]
    fn group_statements_reject_wildcards() {
        let doc = br#"{
            "group_statements": [{ "Resource": "*", "Approvers": "lead@example.com" }]
        }"#;
        assert!(matches!(
            parse_policy_document(doc),
            Err(ConfigError::PolicyParse(_))
        ));
    }

    #[test]
    fn group_statement_with_valid_ids_parses() {
        let doc = br#"{
            "group_statements": [{
                "Resource": ["9067639464-9039c8fc-c296-4863-a233-a59111da7aa3"],
                "Approvers": ["lead@example.com"],
                "AllowSelfApproval": false
            }]
        }"#;
        let config = parse_policy_document(doc).unwrap();
        assert_eq!(config.group_statements.len(), 1);
        assert_eq!(config.group_statements[0].allow_self_approval, Some(false));
    }

    #[test]
    fn duplicate_statements_are_preserved() {
        let doc = br#"{
            "statements": [
                { "Resource": "111111111111", "PermissionSet": "ReadOnly" },
                { "Resource": "111111111111", "PermissionSet": "ReadOnly" }
            ]
        }"#;
        assert_eq!(parse_policy_document(doc).unwrap().statements.len(), 2);
    }
}
