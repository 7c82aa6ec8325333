//! The requester process: one inbound chat event in, one settled request
//! lifecycle step out.
//!
//! Signature verification happens before anything else; an unverified
//! event causes no state transition of any kind. The chat thread created
//! here is the authoritative carrier of request state, so posting the root
//! message is the only notification allowed to fail the flow.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::aws::types::{AwsAccount, PermissionSetInfo, ResolvedPrincipal, SsoInstance};
use crate::aws::{
    DirectoryError, IdentityStoreFacade, OrganizationsFacade, SsoAdminFacade,
};
use crate::cache::{read_through, CacheKeys, ObjectCache};
use crate::config::AppConfig;
use crate::executor::{AccountGrant, ExecutorError, GrantExecutor, GroupGrant};
use crate::policy::{
    authorize_account_approval, authorize_group_approval, evaluate_account_request,
    evaluate_group_request, Decision, Permit, PolicyConfiguration, ResourceSnapshot,
};
use crate::requests::{
    AccessRequest, InFlightGuard, RequestError, RequestEvent, RequestState, RequestedResource,
    Transition,
};
use crate::schedule::{RevocationScheduler, ScheduleError};
use crate::slack::signature::{self, SignatureError};
use crate::slack::{messages, MessageRef, Notifier, SlackError};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("event signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("event payload did not parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Slack(#[from] SlackError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

pub type FlowResult<T> = Result<T, FlowError>;

/// The signed wrapper every inbound event arrives in.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub timestamp: String,
    pub signature: String,
    /// The raw event body the signature covers.
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverAction {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourcePayload {
    Account { account_id: String, permission_set_name: String },
    Group { group_id: String },
}

/// A decision button click, carrying the request context the message was
/// built from. The approver identity is re-checked against the policy; the
/// payload is data, not authority.
#[derive(Debug, Clone, Deserialize)]
pub struct ButtonPayload {
    pub request_id: String,
    pub action: ApproverAction,
    pub approver_email: String,
    pub channel_id: String,
    pub message_ts: String,
    pub requester_email: String,
    #[serde(flatten)]
    pub resource: ResourcePayload,
    pub reason: String,
    pub duration_hours: i64,
    #[serde(default)]
    pub secondary_domain_was_used: bool,
}

/// Everything the requester process can be invoked with.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    AccountRequestSubmitted {
        requester_email: String,
        account_id: String,
        permission_set_name: String,
        reason: String,
        duration_hours: i64,
    },
    GroupRequestSubmitted {
        requester_email: String,
        group_id: String,
        reason: String,
        duration_hours: i64,
    },
    ApprovalButtonClicked(ButtonPayload),
}

pub struct Requester {
    config: AppConfig,
    policy: PolicyConfiguration,
    instance: SsoInstance,
    sso: SsoAdminFacade,
    identity: IdentityStoreFacade,
    organizations: OrganizationsFacade,
    cache: Option<Arc<dyn ObjectCache>>,
    scheduler: RevocationScheduler,
    executor: GrantExecutor,
    notifier: Notifier,
    guard: InFlightGuard,
}

impl Requester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        policy: PolicyConfiguration,
        instance: SsoInstance,
        sso: SsoAdminFacade,
        identity: IdentityStoreFacade,
        organizations: OrganizationsFacade,
        cache: Option<Arc<dyn ObjectCache>>,
        scheduler: RevocationScheduler,
        executor: GrantExecutor,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            policy,
            instance,
            sso,
            identity,
            organizations,
            cache,
            scheduler,
            executor,
            notifier,
            guard: InFlightGuard::default(),
        }
    }

    /// Verify and dispatch one inbound event.
    pub async fn handle(&self, envelope: &InboundEnvelope) -> FlowResult<()> {
        signature::verify(
            &self.config.slack.signing_secret,
            &envelope.timestamp,
            envelope.body.as_bytes(),
            &envelope.signature,
            Utc::now(),
        )?;
        let event: InboundEvent = serde_json::from_str(&envelope.body)?;

        match event {
            InboundEvent::AccountRequestSubmitted {
                requester_email,
                account_id,
                permission_set_name,
                reason,
                duration_hours,
            } => {
                self.handle_account_request(
                    &requester_email,
                    &account_id,
                    &permission_set_name,
                    &reason,
                    Duration::hours(duration_hours),
                )
                .await
            }
            InboundEvent::GroupRequestSubmitted {
                requester_email,
                group_id,
                reason,
                duration_hours,
            } => {
                self.handle_group_request(
                    &requester_email,
                    &group_id,
                    &reason,
                    Duration::hours(duration_hours),
                )
                .await
            }
            InboundEvent::ApprovalButtonClicked(payload) => self.handle_button(payload).await,
        }
    }

    fn cache_ref(&self) -> Option<&dyn ObjectCache> {
        self.cache.as_deref()
    }

    async fn load_accounts(&self) -> FlowResult<Vec<AwsAccount>> {
        Ok(read_through(self.cache_ref(), &CacheKeys::accounts(), async {
            self.organizations.list_accounts().await
        })
        .await?)
    }

    async fn load_permission_sets(&self) -> FlowResult<Vec<PermissionSetInfo>> {
        let key = CacheKeys::permission_sets(self.sso.instance_arn());
        Ok(read_through(self.cache_ref(), &key, async {
            self.sso.list_permission_sets().await
        })
        .await?)
    }

    async fn resolve_requester(&self, email: &str) -> FlowResult<Option<ResolvedPrincipal>> {
        match self
            .identity
            .find_user_by_email(
                email,
                &self.config.identity.secondary_fallback_email_domains,
            )
            .await
        {
            Ok(principal) => Ok(Some(principal)),
            Err(DirectoryError::UserNotFound { .. }) => {
                tracing::warn!(email, "Requester has no directory user");
                let mention = self.notifier.mention_by_email(email).await;
                self.notifier
                    .notify_channel(&format!(
                        "{mention} your request failed because no directory user matches your \
                         email. This often happens when your chat email differs from your SSO \
                         email."
                    ))
                    .await;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Post the decision into the thread, DM the requester when configured,
    /// and flag unsatisfiable decisions. All texts carry the fallback-domain
    /// banner when the principal was resolved through one.
    async fn announce_decision(
        &self,
        thread: &MessageRef,
        decision: &Decision,
        requester_email: &str,
        requester_slack_id: Option<&str>,
        principal: &ResolvedPrincipal,
    ) {
        let mut mentions = Vec::new();
        for approver in &decision.approvers {
            mentions.push(self.notifier.mention_by_email(approver).await);
        }
        let (text, dm_text) = messages::decision_texts(decision, &mentions.join(" "));
        let text = messages::with_banner(
            principal.secondary_domain_was_used,
            &principal.email_used,
            text,
        );
        self.notifier.notify_thread(thread, &text).await;
        if decision.is_unsatisfiable(requester_email) {
            self.notifier
                .notify_thread(thread, &messages::unsatisfiable_request_text())
                .await;
        }
        if let Some(user_id) = requester_slack_id {
            let dm_text = messages::with_banner(
                principal.secondary_domain_was_used,
                &principal.email_used,
                dm_text,
            );
            self.notifier.notify_requester_dm(user_id, &dm_text).await;
        }
    }

    async fn arm_pending_timers(&self, request: &AccessRequest) -> FlowResult<()> {
        let Some(thread) = &request.thread else {
            return Ok(());
        };
        let expires_at = request.expires_at(self.config.request_expiration());
        self.scheduler
            .schedule_button_expiry(&thread.channel, &thread.ts, expires_at)
            .await?;
        let renotify = crate::requests::RenotifyPolicy {
            initial_wait: Duration::minutes(
                self.config.requests.approver_renotification_initial_wait_minutes as i64,
            ),
            multiplier: self.config.requests.approver_renotification_backoff_multiplier,
        };
        self.scheduler
            .schedule_approver_notification(&thread.channel, &thread.ts, renotify.first_wait())
            .await?;
        Ok(())
    }

    async fn handle_account_request(
        &self,
        requester_email: &str,
        account_id: &str,
        permission_set_name: &str,
        reason: &str,
        duration: Duration,
    ) -> FlowResult<()> {
        tracing::info!(requester_email, account_id, permission_set_name, "Handling account request");

        let Some(principal) = self.resolve_requester(requester_email).await? else {
            return Ok(());
        };

        let mut request = match AccessRequest::new(
            requester_email,
            RequestedResource::Account {
                account_id: account_id.to_string(),
                permission_set_name: permission_set_name.to_string(),
            },
            reason,
            duration,
            self.config.max_permissions_duration(),
        ) {
            Ok(request) => request,
            Err(err @ RequestError::DurationTooLong { .. })
            | Err(err @ RequestError::NonPositiveDuration) => {
                let mention = self.notifier.mention_by_email(requester_email).await;
                self.notifier
                    .notify_channel(&format!("{mention} {err}."))
                    .await;
                return Ok(());
            }
        };

        let (accounts, permission_sets) =
            (self.load_accounts().await?, self.load_permission_sets().await?);
        let snapshot = ResourceSnapshot::new(
            accounts.iter().map(|a| a.id.clone()),
            permission_sets.iter().map(|ps| ps.name.clone()),
        );
        let account_name = accounts
            .iter()
            .find(|a| a.id == account_id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| account_id.to_string());

        let decision = evaluate_account_request(
            &self.policy,
            &snapshot,
            account_id,
            permission_set_name,
            requester_email,
        );
        tracing::info!(request_id = %request.id, permit = ?decision.permit, reason = ?decision.reason, "Decision made");

        let requester_slack = self.notifier.client().lookup_user_by_email(requester_email).await?;
        if let Some(user) = &requester_slack {
            tracing::debug!(requester = %user.real_name, "Resolved requester in the chat directory");
        }
        let requester_mention = requester_slack
            .as_ref()
            .map(|u| messages::mention(&u.id))
            .unwrap_or_else(|| requester_email.to_string());

        let status_emoji = match decision.permit {
            Permit::Auto => self.notifier.good_emoji.clone(),
            Permit::NeedsApproval => self.notifier.waiting_emoji.clone(),
            Permit::Deny => self.notifier.bad_emoji.clone(),
        };
        let thread = self
            .notifier
            .post_root(&messages::account_request_message(
                &status_emoji,
                &requester_mention,
                &account_name,
                account_id,
                permission_set_name,
                reason,
                duration,
                principal.secondary_domain_was_used,
                &principal.email_used,
            ))
            .await?;
        request.thread = Some(thread.clone());

        self.announce_decision(
            &thread,
            &decision,
            requester_email,
            requester_slack.as_ref().map(|u| u.id.as_str()),
            &principal,
        )
        .await;

        match decision.permit {
            Permit::Deny => Ok(()),
            Permit::NeedsApproval => self.arm_pending_timers(&request).await,
            Permit::Auto => {
                let Some(permission_set) =
                    permission_sets.iter().find(|ps| ps.name == permission_set_name)
                else {
                    self.notifier
                        .notify_thread(
                            &thread,
                            &format!("Permission set {permission_set_name} does not exist."),
                        )
                        .await;
                    return Ok(());
                };
                let approver_email = match decision.reason {
                    crate::policy::DecisionReason::SelfApproval => {
                        Some(requester_email.to_string())
                    }
                    _ => None,
                };
                let grant = AccountGrant {
                    assignment: crate::aws::types::UserAccountAssignment {
                        instance_arn: self.instance.arn.clone(),
                        account_id: account_id.to_string(),
                        permission_set_arn: permission_set.arn.clone(),
                        principal_id: principal.user_id.clone(),
                    },
                    permission_set_name: permission_set_name.to_string(),
                    request_id: request.id.to_string(),
                    requester_email: requester_email.to_string(),
                    sso_user_email: principal.email_used.clone(),
                    approver_email,
                    reason: reason.to_string(),
                    duration,
                    secondary_domain_was_used: principal.secondary_domain_was_used,
                };
                request.apply(RequestEvent::Approve {
                    approver_email: requester_email.to_string(),
                });
                let outcome = self.executor.grant_account(&grant).await;
                self.settle_grant_state(&mut request, outcome.is_ok());
                self.finish_grant(
                    &thread,
                    &requester_mention,
                    requester_slack.as_ref().map(|u| u.id.as_str()),
                    &principal,
                    outcome,
                )
                .await
            }
        }
    }

    /// Drive the request through its grant transition and log the result.
    fn settle_grant_state(&self, request: &mut AccessRequest, granted: bool) {
        let event = if granted {
            RequestEvent::GrantSucceeded
        } else {
            RequestEvent::GrantFailed
        };
        if let Transition::Changed { from, to } = request.apply(event) {
            tracing::info!(request_id = %request.id, ?from, ?to, "Request transitioned");
        }
    }

    async fn handle_group_request(
        &self,
        requester_email: &str,
        group_id: &str,
        reason: &str,
        duration: Duration,
    ) -> FlowResult<()> {
        tracing::info!(requester_email, group_id, "Handling group request");

        let Some(principal) = self.resolve_requester(requester_email).await? else {
            return Ok(());
        };

        let mut request = match AccessRequest::new(
            requester_email,
            RequestedResource::Group { group_id: group_id.to_string() },
            reason,
            duration,
            self.config.max_permissions_duration(),
        ) {
            Ok(request) => request,
            Err(err) => {
                let mention = self.notifier.mention_by_email(requester_email).await;
                self.notifier
                    .notify_channel(&format!("{mention} {err}."))
                    .await;
                return Ok(());
            }
        };

        let group = match self.identity.describe_group(group_id).await {
            Ok(group) => group,
            Err(DirectoryError::GroupNotFound(_)) => {
                let mention = self.notifier.mention_by_email(requester_email).await;
                self.notifier
                    .notify_channel(&format!("{mention} group {group_id} does not exist."))
                    .await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let decision = evaluate_group_request(&self.policy, group_id, requester_email);
        tracing::info!(request_id = %request.id, permit = ?decision.permit, reason = ?decision.reason, "Decision made");

        let requester_slack = self.notifier.client().lookup_user_by_email(requester_email).await?;
        let requester_mention = requester_slack
            .as_ref()
            .map(|u| messages::mention(&u.id))
            .unwrap_or_else(|| requester_email.to_string());

        let status_emoji = match decision.permit {
            Permit::Auto => self.notifier.good_emoji.clone(),
            Permit::NeedsApproval => self.notifier.waiting_emoji.clone(),
            Permit::Deny => self.notifier.bad_emoji.clone(),
        };
        let thread = self
            .notifier
            .post_root(&messages::group_request_message(
                &status_emoji,
                &requester_mention,
                &group.name,
                group_id,
                reason,
                duration,
                principal.secondary_domain_was_used,
                &principal.email_used,
            ))
            .await?;
        request.thread = Some(thread.clone());

        self.announce_decision(
            &thread,
            &decision,
            requester_email,
            requester_slack.as_ref().map(|u| u.id.as_str()),
            &principal,
        )
        .await;

        match decision.permit {
            Permit::Deny => Ok(()),
            Permit::NeedsApproval => self.arm_pending_timers(&request).await,
            Permit::Auto => {
                let approver_email = match decision.reason {
                    crate::policy::DecisionReason::SelfApproval => {
                        Some(requester_email.to_string())
                    }
                    _ => None,
                };
                let grant = GroupGrant {
                    identity_store_id: self.instance.identity_store_id.clone(),
                    group_id: group_id.to_string(),
                    group_name: group.name.clone(),
                    user_id: principal.user_id.clone(),
                    request_id: request.id.to_string(),
                    requester_email: requester_email.to_string(),
                    sso_user_email: principal.email_used.clone(),
                    approver_email,
                    reason: reason.to_string(),
                    duration,
                    secondary_domain_was_used: principal.secondary_domain_was_used,
                };
                request.apply(RequestEvent::Approve {
                    approver_email: requester_email.to_string(),
                });
                let outcome = self.executor.grant_group(&grant).await;
                self.settle_grant_state(&mut request, outcome.is_ok());
                self.finish_grant(
                    &thread,
                    &requester_mention,
                    requester_slack.as_ref().map(|u| u.id.as_str()),
                    &principal,
                    outcome,
                )
                .await
            }
        }
    }

    async fn finish_grant(
        &self,
        thread: &MessageRef,
        requester_mention: &str,
        requester_slack_id: Option<&str>,
        principal: &ResolvedPrincipal,
        outcome: Result<crate::executor::GrantOutcome, ExecutorError>,
    ) -> FlowResult<()> {
        let banner = |body: String| {
            messages::with_banner(principal.secondary_domain_was_used, &principal.email_used, body)
        };
        match outcome {
            Ok(_) => {
                self.notifier
                    .notify_thread(
                        thread,
                        &banner(messages::grant_succeeded_text(requester_mention)),
                    )
                    .await;
                if let Some(user_id) = requester_slack_id {
                    self.notifier
                        .notify_requester_dm(
                            user_id,
                            &banner("Your request was processed, permissions granted.".to_string()),
                        )
                        .await;
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Grant failed");
                self.notifier
                    .notify_thread(
                        thread,
                        &banner(messages::grant_failed_text(requester_mention)),
                    )
                    .await;
                Err(err.into())
            }
        }
    }

    async fn handle_button(&self, payload: ButtonPayload) -> FlowResult<()> {
        tracing::info!(
            request_id = %payload.request_id,
            action = ?payload.action,
            approver = %payload.approver_email,
            "Handling decision button"
        );

        let resource = match &payload.resource {
            ResourcePayload::Account { account_id, permission_set_name } => {
                RequestedResource::Account {
                    account_id: account_id.clone(),
                    permission_set_name: permission_set_name.clone(),
                }
            }
            ResourcePayload::Group { group_id } => {
                RequestedResource::Group { group_id: group_id.clone() }
            }
        };
        let thread = MessageRef {
            channel: payload.channel_id.clone(),
            ts: payload.message_ts.clone(),
        };
        let approver_mention = self.notifier.mention_by_email(&payload.approver_email).await;

        if !self.guard.begin(&payload.requester_email, &resource) {
            self.notifier
                .notify_thread(&thread, &messages::duplicate_in_flight_text(&approver_mention))
                .await;
            return Ok(());
        }
        let result = self.handle_button_inner(&payload, &resource, &thread, &approver_mention).await;
        self.guard.finish(&payload.requester_email, &resource);
        result
    }

    async fn handle_button_inner(
        &self,
        payload: &ButtonPayload,
        resource: &RequestedResource,
        thread: &MessageRef,
        approver_mention: &str,
    ) -> FlowResult<()> {
        let requester_slack = self
            .notifier
            .client()
            .lookup_user_by_email(&payload.requester_email)
            .await?;
        let requester_mention = requester_slack
            .as_ref()
            .map(|u| messages::mention(&u.id))
            .unwrap_or_else(|| payload.requester_email.clone());
        let duration = Duration::hours(payload.duration_hours);

        // The button payload is the persisted request state; rebuild the
        // in-flight request from it.
        let mut request = AccessRequest::rehydrate(
            Uuid::parse_str(&payload.request_id).unwrap_or_else(|_| Uuid::nil()),
            payload.requester_email.clone(),
            resource.clone(),
            payload.reason.clone(),
            duration,
            RequestState::Pending,
            Some(thread.clone()),
        );

        if payload.action == ApproverAction::Deny {
            if let Transition::Changed { from, to } = request.apply(RequestEvent::Deny {
                approver_email: payload.approver_email.clone(),
            }) {
                tracing::info!(request_id = %payload.request_id, ?from, ?to, "Request transitioned");
            }
            self.rewrite_root(payload, thread, &self.notifier.discarded_emoji.clone(), &requester_mention)
                .await;
            let text = messages::request_denied_text(approver_mention);
            self.notifier.notify_thread(thread, &text).await;
            if let Some(user) = &requester_slack {
                self.notifier
                    .notify_requester_dm(&user.id, &messages::denied_dm_text(approver_mention))
                    .await;
            }
            return Ok(());
        }

        // Approve: re-check the approver against the policy before touching
        // anything.
        let permitted = match resource {
            RequestedResource::Account { account_id, permission_set_name } => {
                let (accounts, permission_sets) =
                    (self.load_accounts().await?, self.load_permission_sets().await?);
                let snapshot = ResourceSnapshot::new(
                    accounts.iter().map(|a| a.id.clone()),
                    permission_sets.iter().map(|ps| ps.name.clone()),
                );
                authorize_account_approval(
                    &self.policy,
                    &snapshot,
                    account_id,
                    permission_set_name,
                    &payload.approver_email,
                    &payload.requester_email,
                )
            }
            RequestedResource::Group { group_id } => authorize_group_approval(
                &self.policy,
                group_id,
                &payload.approver_email,
                &payload.requester_email,
            ),
        };
        if !permitted {
            self.notifier
                .notify_thread(thread, &messages::cannot_approve_text(approver_mention))
                .await;
            return Ok(());
        }

        let Some(principal) = self.resolve_requester(&payload.requester_email).await? else {
            return Ok(());
        };

        request.apply(RequestEvent::Approve {
            approver_email: payload.approver_email.clone(),
        });

        let outcome = match resource {
            RequestedResource::Account { account_id, permission_set_name } => {
                let permission_sets = self.load_permission_sets().await?;
                let Some(permission_set) =
                    permission_sets.iter().find(|ps| &ps.name == permission_set_name)
                else {
                    self.notifier
                        .notify_thread(
                            thread,
                            &format!("Permission set {permission_set_name} does not exist."),
                        )
                        .await;
                    return Ok(());
                };
                let grant = AccountGrant {
                    assignment: crate::aws::types::UserAccountAssignment {
                        instance_arn: self.instance.arn.clone(),
                        account_id: account_id.clone(),
                        permission_set_arn: permission_set.arn.clone(),
                        principal_id: principal.user_id.clone(),
                    },
                    permission_set_name: permission_set_name.clone(),
                    request_id: payload.request_id.clone(),
                    requester_email: payload.requester_email.clone(),
                    sso_user_email: principal.email_used.clone(),
                    approver_email: Some(payload.approver_email.clone()),
                    reason: payload.reason.clone(),
                    duration,
                    secondary_domain_was_used: principal.secondary_domain_was_used
                        || payload.secondary_domain_was_used,
                };
                self.executor.grant_account(&grant).await
            }
            RequestedResource::Group { group_id } => {
                let group = self.identity.describe_group(group_id).await?;
                let grant = GroupGrant {
                    identity_store_id: self.instance.identity_store_id.clone(),
                    group_id: group_id.clone(),
                    group_name: group.name,
                    user_id: principal.user_id.clone(),
                    request_id: payload.request_id.clone(),
                    requester_email: payload.requester_email.clone(),
                    sso_user_email: principal.email_used.clone(),
                    approver_email: Some(payload.approver_email.clone()),
                    reason: payload.reason.clone(),
                    duration,
                    secondary_domain_was_used: principal.secondary_domain_was_used
                        || payload.secondary_domain_was_used,
                };
                self.executor.grant_group(&grant).await
            }
        };

        self.settle_grant_state(&mut request, outcome.is_ok());
        let fallback_used =
            principal.secondary_domain_was_used || payload.secondary_domain_was_used;
        let banner = |body: String| {
            messages::with_banner(fallback_used, &principal.email_used, body)
        };
        match outcome {
            Ok(crate::executor::GrantOutcome::AlreadyGranted) => {
                self.notifier
                    .notify_thread(
                        thread,
                        &banner(format!("{approver_mention} this request was already granted.")),
                    )
                    .await;
                Ok(())
            }
            Ok(crate::executor::GrantOutcome::Granted) => {
                self.rewrite_root(payload, thread, &self.notifier.good_emoji.clone(), &requester_mention)
                    .await;
                self.notifier
                    .notify_thread(
                        thread,
                        &banner(messages::request_approved_text(
                            &requester_mention,
                            approver_mention,
                        )),
                    )
                    .await;
                if let Some(user) = &requester_slack {
                    self.notifier
                        .notify_requester_dm(
                            &user.id,
                            &banner(format!(
                                "Your request was approved by {approver_mention}. Permissions \
                                 granted."
                            )),
                        )
                        .await;
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Grant failed after approval");
                self.notifier
                    .notify_thread(
                        thread,
                        &banner(messages::grant_failed_text(&requester_mention)),
                    )
                    .await;
                Err(err.into())
            }
        }
    }

    /// Rebuild the root message from the button payload with a new status
    /// emoji. The payload carries the full request context, so no message
    /// fetch is needed.
    async fn rewrite_root(
        &self,
        payload: &ButtonPayload,
        thread: &MessageRef,
        status_emoji: &str,
        requester_mention: &str,
    ) {
        let duration = Duration::hours(payload.duration_hours);
        let text = match &payload.resource {
            ResourcePayload::Account { account_id, permission_set_name } => {
                let account_name = match self.organizations.describe_account(account_id).await {
                    Ok(account) => account.name,
                    Err(_) => account_id.clone(),
                };
                messages::account_request_message(
                    status_emoji,
                    requester_mention,
                    &account_name,
                    account_id,
                    permission_set_name,
                    &payload.reason,
                    duration,
                    payload.secondary_domain_was_used,
                    &payload.requester_email,
                )
            }
            ResourcePayload::Group { group_id } => {
                let group_name = match self.identity.describe_group(group_id).await {
                    Ok(group) => group.name,
                    Err(_) => group_id.clone(),
                };
                messages::group_request_message(
                    status_emoji,
                    requester_mention,
                    &group_name,
                    group_id,
                    &payload.reason,
                    duration,
                    payload.secondary_domain_was_used,
                    &payload.requester_email,
                )
            }
        };
        self.notifier.notify_update(thread, &text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_events_parse_by_type_tag() {
        let event: InboundEvent = serde_json::from_str(
            r#"{
                "type": "account_request_submitted",
                "requester_email": "dev@example.com",
                "account_id": "111111111111",
                "permission_set_name": "ReadOnly",
                "reason": "deploy",
                "duration_hours": 2
            }"#,
        )
        .unwrap();
        match event {
            InboundEvent::AccountRequestSubmitted { requester_email, duration_hours, .. } => {
                assert_eq!(requester_email, "dev@example.com");
                assert_eq!(duration_hours, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn button_payload_parses_account_and_group_forms() {
        let account: InboundEvent = serde_json::from_str(
            r#"{
                "type": "approval_button_clicked",
                "request_id": "r-1",
                "action": "approve",
                "approver_email": "mgr@example.com",
                "channel_id": "C1",
                "message_ts": "1700000000.000100",
                "requester_email": "dev@example.com",
                "kind": "account",
                "account_id": "111111111111",
                "permission_set_name": "Admin",
                "reason": "deploy",
                "duration_hours": 1
            }"#,
        )
        .unwrap();
        match account {
            InboundEvent::ApprovalButtonClicked(payload) => {
                assert_eq!(payload.action, ApproverAction::Approve);
                assert!(matches!(payload.resource, ResourcePayload::Account { .. }));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let group: InboundEvent = serde_json::from_str(
            r#"{
                "type": "approval_button_clicked",
                "request_id": "r-2",
                "action": "deny",
                "approver_email": "mgr@example.com",
                "channel_id": "C1",
                "message_ts": "1700000000.000200",
                "requester_email": "dev@example.com",
                "kind": "group",
                "group_id": "9067639464-9039c8fc-c296-4863-a233-a59111da7aa3",
                "reason": "oncall",
                "duration_hours": 8
            }"#,
        )
        .unwrap();
        match group {
            InboundEvent::ApprovalButtonClicked(payload) => {
                assert_eq!(payload.action, ApproverAction::Deny);
                assert!(matches!(payload.resource, ResourcePayload::Group { .. }));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_rejected() {
        assert!(serde_json::from_str::<InboundEvent>(r#"{"type": "mystery"}"#).is_err());
    }
}
