//! The revoker process: scheduled events in, revocations and sweeps out.
//!
//! Invoked by the scheduler with a [`RevokerEvent`] payload. Scheduled
//! revocations go through the executor; the two sweep events delegate to
//! the reconciler; the reminder and expiry events manage pending request
//! messages, deciding "still pending" purely from the message itself
//! because there is no request database to consult.

use chrono::Duration;

use crate::config::AppConfig;
use crate::events::RevokerEvent;
use crate::executor::{ExecutorError, GrantExecutor, RevokeContext};
use crate::reconciler::{Reconciler, SweepReport};
use crate::requests::{transition, RenotifyPolicy, RequestEvent, RequestState};
use crate::schedule::RevocationScheduler;
use crate::slack::{messages, MessageRef, Notifier};

pub struct Revoker {
    config: AppConfig,
    executor: GrantExecutor,
    reconciler: Reconciler,
    scheduler: RevocationScheduler,
    notifier: Notifier,
}

impl Revoker {
    pub fn new(
        config: AppConfig,
        executor: GrantExecutor,
        reconciler: Reconciler,
        scheduler: RevocationScheduler,
        notifier: Notifier,
    ) -> Self {
        Self { config, executor, reconciler, scheduler, notifier }
    }

    /// Handle one revoker invocation. Returns the errors the invocation
    /// should report without having aborted on.
    pub async fn handle(&self, event: RevokerEvent) -> Result<Vec<String>, ExecutorError> {
        match event {
            RevokerEvent::ScheduledRevoke { revoke } => {
                tracing::info!(request_id = %revoke.request_id, "Handling scheduled revocation");
                let ctx = RevokeContext {
                    request_id: revoke.request_id.clone(),
                    requester_email: revoke.requester_email.clone(),
                    approver_email: revoke.approver_email.clone(),
                    reason: "scheduled_revocation".to_string(),
                    permission_duration: Some(Duration::seconds(revoke.permission_duration_secs)),
                    secondary_domain_was_used: revoke.secondary_domain_was_used,
                    schedule_name: Some(revoke.schedule_name.clone()),
                };
                self.executor.revoke_account(&revoke.assignment, &ctx).await?;
                if let Some(to) = transition(RequestState::Granted, &RequestEvent::RevokeFired) {
                    tracing::info!(request_id = %revoke.request_id, state = ?to, "Request transitioned");
                }
                Ok(Vec::new())
            }
            RevokerEvent::ScheduledGroupRevoke { revoke } => {
                tracing::info!(request_id = %revoke.request_id, "Handling scheduled group revocation");
                let ctx = RevokeContext {
                    request_id: revoke.request_id.clone(),
                    requester_email: revoke.requester_email.clone(),
                    approver_email: revoke.approver_email.clone(),
                    reason: "scheduled_revocation".to_string(),
                    permission_duration: Some(Duration::seconds(revoke.permission_duration_secs)),
                    secondary_domain_was_used: revoke.secondary_domain_was_used,
                    schedule_name: Some(revoke.schedule_name.clone()),
                };
                self.executor.revoke_group(&revoke.assignment, &ctx).await?;
                if let Some(to) = transition(RequestState::Granted, &RequestEvent::RevokeFired) {
                    tracing::info!(request_id = %revoke.request_id, state = ?to, "Request transitioned");
                }
                Ok(Vec::new())
            }
            RevokerEvent::CheckInconsistency {} => {
                let report = self.reconciler.warn_sweep().await;
                Self::log_report("warn sweep", &report);
                Ok(report.errors)
            }
            RevokerEvent::ScheduledRevocation {} => {
                let report = self.reconciler.revoke_sweep().await;
                Self::log_report("revoke sweep", &report);
                Ok(report.errors)
            }
            RevokerEvent::ApproverNotification {
                schedule_name,
                channel_id,
                message_ts,
                time_to_wait_secs,
            } => {
                self.handle_renotification(
                    &schedule_name,
                    &channel_id,
                    &message_ts,
                    Duration::seconds(time_to_wait_secs as i64),
                )
                .await;
                Ok(Vec::new())
            }
            RevokerEvent::ButtonExpiry { schedule_name, channel_id, message_ts } => {
                self.handle_expiry(&schedule_name, &channel_id, &message_ts).await;
                Ok(Vec::new())
            }
        }
    }

    fn log_report(sweep: &str, report: &SweepReport) {
        tracing::info!(
            sweep,
            assignments_scanned = report.assignments_scanned,
            group_assignments_scanned = report.group_assignments_scanned,
            orphaned = report.orphaned,
            warned = report.warned,
            revoked = report.revoked,
            error_count = report.errors.len(),
            "Reconciler sweep finished"
        );
    }

    /// Fetch the pending message; the fired one-shot is deleted either way.
    /// Returns `None` when the request is no longer pending.
    async fn pending_message(
        &self,
        schedule_name: &str,
        channel_id: &str,
        message_ts: &str,
    ) -> Option<(MessageRef, String)> {
        if let Err(err) = self.scheduler.delete(schedule_name).await {
            tracing::warn!(schedule = schedule_name, error = %err, "Failed to delete fired schedule");
        }
        let text = match self.notifier.client().get_message_text(channel_id, message_ts).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::warn!(channel_id, message_ts, "Request message no longer exists");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to fetch request message");
                return None;
            }
        };
        if !self.notifier.message_is_pending(&text) {
            tracing::info!(message_ts, "Request already settled; nothing to do");
            return None;
        }
        Some((
            MessageRef { channel: channel_id.to_string(), ts: message_ts.to_string() },
            text,
        ))
    }

    async fn handle_renotification(
        &self,
        schedule_name: &str,
        channel_id: &str,
        message_ts: &str,
        waited: Duration,
    ) {
        let Some((thread, _)) = self.pending_message(schedule_name, channel_id, message_ts).await
        else {
            return;
        };

        let policy = RenotifyPolicy {
            initial_wait: Duration::minutes(
                self.config.requests.approver_renotification_initial_wait_minutes as i64,
            ),
            multiplier: self.config.requests.approver_renotification_backoff_multiplier,
        };
        let next_wait = policy.next_wait(waited);

        self.notifier
            .notify_thread(&thread, &messages::renotification_text(next_wait))
            .await;

        if let Err(err) = self
            .scheduler
            .schedule_approver_notification(channel_id, message_ts, next_wait)
            .await
        {
            tracing::warn!(error = %err, "Failed to re-arm approver notification");
        }
    }

    async fn handle_expiry(&self, schedule_name: &str, channel_id: &str, message_ts: &str) {
        let Some((thread, text)) = self.pending_message(schedule_name, channel_id, message_ts).await
        else {
            return;
        };

        if let Some(to) = transition(RequestState::Pending, &RequestEvent::Expire) {
            tracing::info!(message_ts, state = ?to, "Pending request expired");
        }

        // Swap the status emoji in place; the rest of the message keeps the
        // original request context.
        let expired_text =
            text.replace(&self.notifier.waiting_emoji, &self.notifier.discarded_emoji);
        self.notifier.notify_update(&thread, &expired_text).await;
        self.notifier
            .notify_thread(
                &thread,
                &messages::request_expired_text(self.config.requests.request_expiration_hours),
            )
            .await;
    }
}
