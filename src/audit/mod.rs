//! Append-only audit trail in the object store.
//!
//! One JSON object per record under a date-partitioned prefix. The writer
//! only ever issues PUTs with collision-free object names; immutability is
//! finished off by bucket versioning/object-lock on the infrastructure
//! side. Records carry a `version` field so readers can evolve; readers
//! must tolerate unknown fields and absent optional fields.

use std::collections::BTreeMap;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Bumped when record fields change meaning; additive fields do not bump.
pub const AUDIT_SCHEMA_VERSION: u32 = 2;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to serialize audit record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write audit record after {attempts} attempts: {message}")]
    Write { attempts: u32, message: String },
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    Account,
    Group,
    SyncAdd,
    SyncRemove,
    ManualDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Grant,
    Revoke,
    Detect,
}

/// Marks rows written for operations that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Failed,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub audit_entry_type: AuditEntryType,
    pub operation_type: OperationType,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub requester_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_email: Option<String>,
    pub sso_user_email: String,
    pub sso_user_principal_id: String,
    pub reason: String,
    /// Seconds of granted access, or `"NA"` for revocations and detections.
    pub permission_duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_attributes: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OperationState>,
    pub version: u32,
    pub secondary_domain_was_used: bool,
}

impl AuditEntry {
    /// Canonical "not applicable" marker used where the original actor is
    /// unknown, e.g. reconciler-initiated revocations.
    pub const NA: &'static str = "NA";

    pub fn duration_field(duration: Option<chrono::Duration>) -> String {
        match duration {
            Some(d) => d.num_seconds().to_string(),
            None => Self::NA.to_string(),
        }
    }
}

/// PUT-only writer for the audit prefix.
#[derive(Clone)]
pub struct AuditLogWriter {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl AuditLogWriter {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Append one record, retrying transient failures. The caller decides
    /// whether an exhausted retry budget aborts the business action; for
    /// every flow in this crate it does not.
    pub async fn record(&self, entry: &AuditEntry) -> AuditResult<()> {
        let key = object_key(&self.prefix, entry);
        let body = serde_json::to_vec(entry)?;
        tracing::debug!(key, request_id = %entry.request_id, "Writing audit record");

        let mut last_error = String::new();
        for attempt in 1..=WRITE_ATTEMPTS {
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(body.clone()))
                .content_type("application/json")
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(err) => {
                    last_error = err.into_service_error().to_string();
                    tracing::warn!(
                        key,
                        attempt,
                        error = %last_error,
                        "Audit record write failed"
                    );
                    if attempt < WRITE_ATTEMPTS {
                        tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }

        Err(AuditError::Write { attempts: WRITE_ATTEMPTS, message: last_error })
    }
}

/// Object key: `{prefix}/{YYYY}/{MM}/{DD}/{request_id}-{nonce}.json`. The
/// nonce is a v7 UUID, so names from one writer sort in write order and
/// never collide across writers.
fn object_key(prefix: &str, entry: &AuditEntry) -> String {
    let t = entry.timestamp;
    format!(
        "{}/{:04}/{:02}/{:02}/{}-{}.json",
        prefix.trim_end_matches('/'),
        t.year(),
        t.month(),
        t.day(),
        entry.request_id,
        Uuid::now_v7().simple(),
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn entry() -> AuditEntry {
        AuditEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 7, 12, 30, 0).unwrap(),
            audit_entry_type: AuditEntryType::Account,
            operation_type: OperationType::Grant,
            request_id: "01hxyz".to_string(),
            role_name: Some("ReadOnly".to_string()),
            account_id: Some("111111111111".to_string()),
            group_name: None,
            group_id: None,
            requester_email: "dev@example.com".to_string(),
            approver_email: Some("mgr@example.com".to_string()),
            sso_user_email: "dev@example.com".to_string(),
            sso_user_principal_id: "u-1".to_string(),
            reason: "deploy".to_string(),
            permission_duration: "3600".to_string(),
            matched_attributes: None,
            state: None,
            version: AUDIT_SCHEMA_VERSION,
            secondary_domain_was_used: false,
        }
    }

    #[test]
    fn serialized_record_uses_wire_names() {
        let json = serde_json::to_value(entry()).unwrap();
        assert_eq!(json["audit_entry_type"], "account");
        assert_eq!(json["operation_type"], "grant");
        assert_eq!(json["version"], AUDIT_SCHEMA_VERSION);
        // Absent optionals are omitted entirely, not serialized as null.
        assert!(json.get("group_name").is_none());
        assert!(json.get("state").is_none());
    }

    #[test]
    fn readers_tolerate_unknown_and_absent_fields() {
        let json = r#"{
            "timestamp": "2024-03-07T12:30:00Z",
            "audit_entry_type": "sync_add",
            "operation_type": "grant",
            "request_id": "r-1",
            "requester_email": "NA",
            "sso_user_email": "u@example.com",
            "sso_user_principal_id": "u-1",
            "reason": "attribute sync",
            "permission_duration": "NA",
            "version": 3,
            "secondary_domain_was_used": false,
            "some_future_field": {"nested": true}
        }"#;
        let entry: AuditEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.audit_entry_type, AuditEntryType::SyncAdd);
        assert!(entry.approver_email.is_none());
    }

    #[test]
    fn object_keys_are_date_partitioned_and_unique() {
        let e = entry();
        let first = object_key("audit/elevate", &e);
        let second = object_key("audit/elevate/", &e);
        assert!(first.starts_with("audit/elevate/2024/03/07/01hxyz-"));
        assert!(second.starts_with("audit/elevate/2024/03/07/01hxyz-"));
        assert!(first.ends_with(".json"));
        assert_ne!(first, second);
    }

    #[test]
    fn duration_field_formats_seconds_or_na() {
        assert_eq!(
            AuditEntry::duration_field(Some(chrono::Duration::hours(1))),
            "3600"
        );
        assert_eq!(AuditEntry::duration_field(None), "NA");
    }
}
