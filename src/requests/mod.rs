//! Request lifecycle.
//!
//! There is deliberately no request database: the authoritative facts live
//! in the chat thread and the audit log, and in-flight state is
//! reconstructed from the inbound event plus the message it references.
//! What this module owns is the pure transition function over
//! [`RequestState`], the renotification backoff math, and the in-process
//! guard against double-handling concurrent button clicks.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::slack::MessageRef;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("requested duration must be positive")]
    NonPositiveDuration,

    #[error("requested duration {requested_hours}h exceeds the maximum of {max_hours}h")]
    DurationTooLong { requested_hours: i64, max_hours: i64 },
}

/// Lifecycle states of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Denied,
    Expired,
    Granted,
    Revoked,
    Failed,
}

/// Events that can hit a request. Anything not listed for the current
/// state is ignored, which is what makes UI retries harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Approve { approver_email: String },
    Deny { approver_email: String },
    Expire,
    GrantSucceeded,
    GrantFailed,
    RevokeFired,
}

/// Outcome of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: RequestState, to: RequestState },
    /// The event does not apply in the current state; nothing happened.
    Ignored,
}

/// The allowed-transition table. Anything not listed is a no-op.
pub fn transition(state: RequestState, event: &RequestEvent) -> Option<RequestState> {
    use RequestEvent as E;
    use RequestState as S;

    match (state, event) {
        (S::Pending, E::Approve { .. }) => Some(S::Approved),
        (S::Pending, E::Deny { .. }) => Some(S::Denied),
        (S::Pending, E::Expire) => Some(S::Expired),
        (S::Approved, E::GrantSucceeded) => Some(S::Granted),
        (S::Approved, E::GrantFailed) => Some(S::Failed),
        (S::Granted, E::RevokeFired) => Some(S::Revoked),
        _ => None,
    }
}

/// What a request is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedResource {
    Account { account_id: String, permission_set_name: String },
    Group { group_id: String },
}

impl RequestedResource {
    /// Key used by the duplicate-request guard.
    pub fn dedup_key(&self) -> String {
        match self {
            RequestedResource::Account { account_id, permission_set_name } => {
                format!("account/{account_id}/{permission_set_name}")
            }
            RequestedResource::Group { group_id } => format!("group/{group_id}"),
        }
    }
}

/// One in-flight access request.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub id: Uuid,
    pub requester_email: String,
    pub resource: RequestedResource,
    pub reason: String,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
    pub state: RequestState,
    pub approver_email: Option<String>,
    /// The chat message the request lives in.
    pub thread: Option<MessageRef>,
}

impl AccessRequest {
    /// Create a new pending request; the id is time-ordered.
    pub fn new(
        requester_email: impl Into<String>,
        resource: RequestedResource,
        reason: impl Into<String>,
        duration: Duration,
        max_duration: Duration,
    ) -> Result<Self, RequestError> {
        if duration <= Duration::zero() {
            return Err(RequestError::NonPositiveDuration);
        }
        if duration > max_duration {
            return Err(RequestError::DurationTooLong {
                requested_hours: duration.num_hours(),
                max_hours: max_duration.num_hours(),
            });
        }
        Ok(Self {
            id: Uuid::now_v7(),
            requester_email: requester_email.into(),
            resource,
            reason: reason.into(),
            duration,
            created_at: Utc::now(),
            state: RequestState::Pending,
            approver_email: None,
            thread: None,
        })
    }

    /// Rebuild an in-flight request from the context a chat event carries.
    /// This is the recovery path the design leans on instead of a request
    /// database: the thread and its payloads are the persistence.
    pub fn rehydrate(
        id: Uuid,
        requester_email: impl Into<String>,
        resource: RequestedResource,
        reason: impl Into<String>,
        duration: Duration,
        state: RequestState,
        thread: Option<MessageRef>,
    ) -> Self {
        Self {
            id,
            requester_email: requester_email.into(),
            resource,
            reason: reason.into(),
            duration,
            created_at: Utc::now(),
            state,
            approver_email: None,
            thread,
        }
    }

    /// Apply an event. Pure in everything but the two fields it updates.
    pub fn apply(&mut self, event: RequestEvent) -> Transition {
        let from = self.state;
        let Some(to) = transition(from, &event) else {
            return Transition::Ignored;
        };

        match event {
            RequestEvent::Approve { approver_email } | RequestEvent::Deny { approver_email } => {
                self.approver_email = Some(approver_email);
            }
            _ => {}
        }
        self.state = to;
        Transition::Changed { from, to }
    }

    /// Wall-clock expiry deadline; process restarts do not move it.
    pub fn expires_at(&self, expiration: Duration) -> DateTime<Utc> {
        self.created_at + expiration
    }
}

/// Backoff for approver reminders: `initial_wait * multiplier^k`. A zero
/// multiplier keeps the wait constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenotifyPolicy {
    pub initial_wait: Duration,
    pub multiplier: u32,
}

impl RenotifyPolicy {
    pub fn first_wait(&self) -> Duration {
        self.initial_wait
    }

    /// The wait that follows one of `current` length.
    pub fn next_wait(&self, current: Duration) -> Duration {
        if self.multiplier == 0 {
            current
        } else {
            current * self.multiplier as i32
        }
    }
}

/// In-process guard against handling two button clicks for the same
/// requester/resource pair at once. The scope is deliberately one process:
/// cross-process races converge through executor idempotency.
#[derive(Debug, Default)]
pub struct InFlightGuard {
    keys: Mutex<HashSet<String>>,
}

impl InFlightGuard {
    /// Try to take the slot. `false` means another handler holds it.
    pub fn begin(&self, requester_email: &str, resource: &RequestedResource) -> bool {
        let key = format!("{requester_email}|{}", resource.dedup_key());
        self.keys.lock().expect("guard mutex poisoned").insert(key)
    }

    pub fn finish(&self, requester_email: &str, resource: &RequestedResource) {
        let key = format!("{requester_email}|{}", resource.dedup_key());
        self.keys.lock().expect("guard mutex poisoned").remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AccessRequest {
        AccessRequest::new(
            "dev@example.com",
            RequestedResource::Account {
                account_id: "111111111111".to_string(),
                permission_set_name: "ReadOnly".to_string(),
            },
            "deploy",
            Duration::hours(1),
            Duration::hours(12),
        )
        .unwrap()
    }

    #[test]
    fn durations_are_bounded() {
        let too_long = AccessRequest::new(
            "dev@example.com",
            RequestedResource::Group { group_id: "g-1".to_string() },
            "reason",
            Duration::hours(24),
            Duration::hours(12),
        );
        assert_eq!(
            too_long.unwrap_err(),
            RequestError::DurationTooLong { requested_hours: 24, max_hours: 12 }
        );

        let non_positive = AccessRequest::new(
            "dev@example.com",
            RequestedResource::Group { group_id: "g-1".to_string() },
            "reason",
            Duration::zero(),
            Duration::hours(12),
        );
        assert_eq!(non_positive.unwrap_err(), RequestError::NonPositiveDuration);
    }

    #[test]
    fn happy_path_reaches_revoked() {
        let mut request = request();
        assert_eq!(
            request.apply(RequestEvent::Approve { approver_email: "mgr@example.com".into() }),
            Transition::Changed { from: RequestState::Pending, to: RequestState::Approved }
        );
        assert_eq!(request.approver_email.as_deref(), Some("mgr@example.com"));
        assert_eq!(
            request.apply(RequestEvent::GrantSucceeded),
            Transition::Changed { from: RequestState::Approved, to: RequestState::Granted }
        );
        assert_eq!(
            request.apply(RequestEvent::RevokeFired),
            Transition::Changed { from: RequestState::Granted, to: RequestState::Revoked }
        );
    }

    #[test]
    fn deny_and_expire_terminate_pending() {
        let mut denied = request();
        denied.apply(RequestEvent::Deny { approver_email: "mgr@example.com".into() });
        assert_eq!(denied.state, RequestState::Denied);

        let mut expired = request();
        expired.apply(RequestEvent::Expire);
        assert_eq!(expired.state, RequestState::Expired);
    }

    #[test]
    fn grant_failure_is_terminal_failed() {
        let mut request = request();
        request.apply(RequestEvent::Approve { approver_email: "mgr@example.com".into() });
        request.apply(RequestEvent::GrantFailed);
        assert_eq!(request.state, RequestState::Failed);
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        let mut request = request();
        // Revoke before grant, expire after approve, double-approve: all no-ops.
        assert_eq!(request.apply(RequestEvent::RevokeFired), Transition::Ignored);
        request.apply(RequestEvent::Approve { approver_email: "a@example.com".into() });
        assert_eq!(request.apply(RequestEvent::Expire), Transition::Ignored);
        assert_eq!(
            request.apply(RequestEvent::Approve { approver_email: "b@example.com".into() }),
            Transition::Ignored
        );
        // The original approver sticks.
        assert_eq!(request.approver_email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = request();
        let b = request();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn renotify_backoff_multiplies() {
        let policy = RenotifyPolicy { initial_wait: Duration::minutes(15), multiplier: 2 };
        let first = policy.first_wait();
        let second = policy.next_wait(first);
        let third = policy.next_wait(second);
        assert_eq!(first, Duration::minutes(15));
        assert_eq!(second, Duration::minutes(30));
        assert_eq!(third, Duration::minutes(60));
    }

    #[test]
    fn renotify_zero_multiplier_keeps_wait_constant() {
        let policy = RenotifyPolicy { initial_wait: Duration::minutes(10), multiplier: 0 };
        assert_eq!(policy.next_wait(policy.first_wait()), Duration::minutes(10));
    }

    #[test]
    fn in_flight_guard_blocks_duplicates() {
        let guard = InFlightGuard::default();
        let resource = RequestedResource::Group { group_id: "g-1".to_string() };
        assert!(guard.begin("dev@example.com", &resource));
        assert!(!guard.begin("dev@example.com", &resource));
        guard.finish("dev@example.com", &resource);
        assert!(guard.begin("dev@example.com", &resource));
    }
}
