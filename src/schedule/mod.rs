//! One-shot revocation schedules on the EventBridge scheduler.
//!
//! Every schedule lives in one named group, targets the revoker entry
//! point, and carries a [`RevokerEvent`] as JSON input. Revocation schedule
//! names are a deterministic hash of the assignment identity and request id,
//! which is what makes crashed grants recoverable: a retry computes the same
//! name, sees the existing schedule, and refuses to double-grant.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use aws_sdk_scheduler::types::{
    ActionAfterCompletion, FlexibleTimeWindow, FlexibleTimeWindowMode, ScheduleState, Target,
};
use aws_sdk_scheduler::Client;

use crate::aws::types::{GroupAssignment, UserAccountAssignment};
use crate::events::RevokerEvent;

/// Scheduler names cap at 64 characters; `rev-`/`grv-` plus 40 hex chars
/// stays comfortably inside while keeping 160 bits of the digest.
const NAME_HASH_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Failed to encode schedule payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Scheduler request invalid: {0}")]
    Request(String),

    #[error("Scheduler error: {0}")]
    Api(String),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Whether a create call made a new schedule or found the deterministic
/// name already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Wrapper over the scheduler control plane for one schedule group.
#[derive(Clone)]
pub struct RevocationScheduler {
    client: Client,
    group_name: String,
    target_arn: String,
    role_arn: String,
}

impl RevocationScheduler {
    pub fn new(
        client: Client,
        group_name: impl Into<String>,
        target_arn: impl Into<String>,
        role_arn: impl Into<String>,
    ) -> Self {
        Self {
            client,
            group_name: group_name.into(),
            target_arn: target_arn.into(),
            role_arn: role_arn.into(),
        }
    }

    /// Deterministic name for an account-assignment revocation schedule.
    pub fn account_schedule_name(assignment: &UserAccountAssignment, request_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(assignment.instance_arn.as_bytes());
        hasher.update(b"\x00");
        hasher.update(assignment.account_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(assignment.permission_set_arn.as_bytes());
        hasher.update(b"\x00");
        hasher.update(assignment.principal_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(request_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("rev-{}", &digest[..NAME_HASH_LEN])
    }

    /// Deterministic name for a group-membership revocation schedule.
    pub fn group_schedule_name(assignment: &GroupAssignment, request_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(assignment.identity_store_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(assignment.group_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(assignment.user_principal_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(request_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("grv-{}", &digest[..NAME_HASH_LEN])
    }

    /// `at(...)` expression for a UTC fire time, to scheduler resolution.
    fn at_expression(when: DateTime<Utc>) -> String {
        format!("at({})", when.format("%Y-%m-%dT%H:%M:%S"))
    }

    /// Whether a schedule with this name currently exists.
    pub async fn exists(&self, name: &str) -> ScheduleResult<bool> {
        let result = self
            .client
            .get_schedule()
            .group_name(&self.group_name)
            .name(name)
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    Ok(false)
                } else {
                    Err(ScheduleError::Api(service_error.to_string()))
                }
            }
        }
    }

    /// Create a one-shot schedule firing `event` at `when`. A name conflict
    /// means the job already exists; the existing job wins.
    pub async fn create_one_shot(
        &self,
        name: &str,
        when: DateTime<Utc>,
        event: &RevokerEvent,
    ) -> ScheduleResult<CreateOutcome> {
        let input = serde_json::to_string(event)?;
        let target = Target::builder()
            .arn(&self.target_arn)
            .role_arn(&self.role_arn)
            .input(input)
            .build()
            .map_err(|e| ScheduleError::Request(e.to_string()))?;
        let window = FlexibleTimeWindow::builder()
            .mode(FlexibleTimeWindowMode::Off)
            .build()
            .map_err(|e| ScheduleError::Request(e.to_string()))?;

        let result = self
            .client
            .create_schedule()
            .group_name(&self.group_name)
            .name(name)
            .schedule_expression(Self::at_expression(when))
            .state(ScheduleState::Enabled)
            .action_after_completion(ActionAfterCompletion::Delete)
            .flexible_time_window(window)
            .target(target)
            .send()
            .await;

        match result {
            Ok(_) => {
                tracing::info!(schedule = name, fire_at = %when, "Created one-shot schedule");
                Ok(CreateOutcome::Created)
            }
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_conflict_exception() {
                    tracing::info!(schedule = name, "Schedule already exists; keeping it");
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(ScheduleError::Api(service_error.to_string()))
                }
            }
        }
    }

    /// Schedule the revocation of an account assignment.
    pub async fn schedule_account_revocation(
        &self,
        payload: crate::events::AccountRevokePayload,
        when: DateTime<Utc>,
    ) -> ScheduleResult<CreateOutcome> {
        let name = payload.schedule_name.clone();
        self.create_one_shot(&name, when, &RevokerEvent::ScheduledRevoke { revoke: payload })
            .await
    }

    /// Schedule the revocation of a group membership.
    pub async fn schedule_group_revocation(
        &self,
        payload: crate::events::GroupRevokePayload,
        when: DateTime<Utc>,
    ) -> ScheduleResult<CreateOutcome> {
        let name = payload.schedule_name.clone();
        self.create_one_shot(&name, when, &RevokerEvent::ScheduledGroupRevoke { revoke: payload })
            .await
    }

    /// Arm an approver reminder for a pending request message.
    pub async fn schedule_approver_notification(
        &self,
        channel_id: &str,
        message_ts: &str,
        wait: Duration,
    ) -> ScheduleResult<String> {
        let name = format!("ntf-{}", Uuid::new_v4().simple());
        let event = RevokerEvent::ApproverNotification {
            schedule_name: name.clone(),
            channel_id: channel_id.to_string(),
            message_ts: message_ts.to_string(),
            time_to_wait_secs: wait.num_seconds().max(0) as u64,
        };
        self.create_one_shot(&name, Utc::now() + wait, &event).await?;
        Ok(name)
    }

    /// Arm the expiry of a pending request message.
    pub async fn schedule_button_expiry(
        &self,
        channel_id: &str,
        message_ts: &str,
        when: DateTime<Utc>,
    ) -> ScheduleResult<String> {
        let name = format!("exp-{}", Uuid::new_v4().simple());
        let event = RevokerEvent::ButtonExpiry {
            schedule_name: name.clone(),
            channel_id: channel_id.to_string(),
            message_ts: message_ts.to_string(),
        };
        self.create_one_shot(&name, when, &event).await?;
        Ok(name)
    }

    /// Delete a schedule. Returns `false` when it was already gone, which
    /// is success for every caller (fired one-shots delete themselves).
    pub async fn delete(&self, name: &str) -> ScheduleResult<bool> {
        let result = self
            .client
            .delete_schedule()
            .group_name(&self.group_name)
            .name(name)
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    Ok(false)
                } else {
                    Err(ScheduleError::Api(service_error.to_string()))
                }
            }
        }
    }

    /// Every live revocation event in the group. Schedules whose payload
    /// does not parse as a revocation are skipped with a warning; the
    /// reconciler must keep working even if a foreign schedule lands in the
    /// group.
    pub async fn list_revocation_events(&self) -> ScheduleResult<Vec<RevokerEvent>> {
        let mut names = Vec::new();
        let mut pages = self
            .client
            .list_schedules()
            .group_name(&self.group_name)
            .into_paginator()
            .send();
        while let Some(page) = pages
            .try_next()
            .await
            .map_err(|e| ScheduleError::Api(e.into_service_error().to_string()))?
        {
            for summary in page.schedules() {
                if let Some(name) = summary.name() {
                    names.push(name.to_string());
                }
            }
        }

        let mut events = Vec::new();
        for name in names {
            let out = self
                .client
                .get_schedule()
                .group_name(&self.group_name)
                .name(&name)
                .send()
                .await;
            let out = match out {
                Ok(out) => out,
                Err(err) => {
                    let service_error = err.into_service_error();
                    // Fired one-shots self-delete between list and get.
                    if service_error.is_resource_not_found_exception() {
                        continue;
                    }
                    return Err(ScheduleError::Api(service_error.to_string()));
                }
            };
            let Some(input) = out.target().and_then(|t| t.input()) else {
                continue;
            };
            match serde_json::from_str::<RevokerEvent>(input) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(schedule = %name, error = %err, "Skipping unparsable schedule payload");
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> UserAccountAssignment {
        UserAccountAssignment {
            instance_arn: "arn:aws:sso:::instance/i-1".to_string(),
            account_id: "111111111111".to_string(),
            permission_set_arn: "arn:aws:sso:::permissionSet/i-1/ps-1".to_string(),
            principal_id: "u-1".to_string(),
        }
    }

    #[test]
    fn account_schedule_names_are_deterministic() {
        let a = RevocationScheduler::account_schedule_name(&assignment(), "r-1");
        let b = RevocationScheduler::account_schedule_name(&assignment(), "r-1");
        assert_eq!(a, b);
        assert!(a.starts_with("rev-"));
        assert!(a.len() <= 64);
    }

    #[test]
    fn schedule_names_differ_per_request_and_assignment() {
        let base = RevocationScheduler::account_schedule_name(&assignment(), "r-1");
        let other_request = RevocationScheduler::account_schedule_name(&assignment(), "r-2");
        assert_ne!(base, other_request);

        let mut other_assignment = assignment();
        other_assignment.account_id = "222222222222".to_string();
        let other = RevocationScheduler::account_schedule_name(&other_assignment, "r-1");
        assert_ne!(base, other);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        // Concatenation without separators would collide these two.
        let mut left = assignment();
        left.account_id = "11111111111".to_string();
        left.permission_set_arn = "1x".to_string();
        let mut right = assignment();
        right.account_id = "111111111111".to_string();
        right.permission_set_arn = "x".to_string();
        assert_ne!(
            RevocationScheduler::account_schedule_name(&left, "r-1"),
            RevocationScheduler::account_schedule_name(&right, "r-1"),
        );
    }

    #[test]
    fn at_expression_has_no_subseconds_or_offset() {
        let when = DateTime::parse_from_rfc3339("2024-03-07T12:30:45.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            RevocationScheduler::at_expression(when),
            "at(2024-03-07T12:30:45)"
        );
    }

    #[test]
    fn group_schedule_names_use_their_own_prefix() {
        let name = RevocationScheduler::group_schedule_name(
            &GroupAssignment {
                identity_store_id: "d-1".to_string(),
                group_id: "g-1".to_string(),
                group_name: "Engineers".to_string(),
                membership_id: "m-1".to_string(),
                user_principal_id: "u-1".to_string(),
            },
            "r-1",
        );
        assert!(name.starts_with("grv-"));
        assert!(name.len() <= 64);
    }
}
