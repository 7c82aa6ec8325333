//! Chat notification adapter.
//!
//! [`SlackClient`] is the thin Web API wrapper, [`signature`] guards the
//! inbound path, [`messages`] composes text, and [`Notifier`] routes
//! messages to the approval channel, threads, and DMs. Notification
//! failures never block a state transition: the high-level `notify_*`
//! helpers log and swallow. The one exception is posting the root request
//! message, which callers need to thread everything else under.

mod client;
pub mod error;
pub mod messages;
pub mod signature;

pub use client::{MessageRef, SlackClient, SlackUser};
pub use error::{SlackError, SlackResult};

use crate::aws::IdentityStoreFacade;
use crate::config::SlackSettings;

/// Routes composed messages to the right place.
#[derive(Clone)]
pub struct Notifier {
    client: SlackClient,
    channel_id: String,
    send_dm_if_user_not_in_channel: bool,
    post_update_on_revoke: bool,
    pub waiting_emoji: String,
    pub good_emoji: String,
    pub bad_emoji: String,
    pub discarded_emoji: String,
}

impl Notifier {
    pub fn new(client: SlackClient, settings: &SlackSettings) -> Self {
        Self {
            client,
            channel_id: settings.channel_id.clone(),
            send_dm_if_user_not_in_channel: settings.send_dm_if_user_not_in_channel,
            post_update_on_revoke: settings.post_update_on_revoke,
            waiting_emoji: settings.waiting_result_emoji.clone(),
            good_emoji: settings.good_result_emoji.clone(),
            bad_emoji: settings.bad_result_emoji.clone(),
            discarded_emoji: settings.discarded_result_emoji.clone(),
        }
    }

    pub fn client(&self) -> &SlackClient {
        &self.client
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn post_update_on_revoke(&self) -> bool {
        self.post_update_on_revoke
    }

    /// Post the root message of a request thread. This one is allowed to
    /// fail upward: without it there is no thread to carry the request.
    pub async fn post_root(&self, text: &str) -> SlackResult<MessageRef> {
        self.client.post_message(&self.channel_id, text, None).await
    }

    /// Best-effort thread reply.
    pub async fn notify_thread(&self, thread: &MessageRef, text: &str) {
        if let Err(err) = self
            .client
            .post_message(&thread.channel, text, Some(&thread.ts))
            .await
        {
            tracing::warn!(error = %err, "Failed to post thread reply");
        }
    }

    /// Best-effort channel message outside any thread.
    pub async fn notify_channel(&self, text: &str) {
        if let Err(err) = self.client.post_message(&self.channel_id, text, None).await {
            tracing::warn!(error = %err, "Failed to post channel message");
        }
    }

    /// Best-effort rewrite of a message (status emoji changes).
    pub async fn notify_update(&self, message: &MessageRef, text: &str) {
        if let Err(err) = self
            .client
            .update_message(&message.channel, &message.ts, text)
            .await
        {
            tracing::warn!(error = %err, "Failed to update message");
        }
    }

    /// DM the requester when they are not in the approval channel and the
    /// deployment asks for it. Membership-check failures fall back to not
    /// sending, never to blocking.
    pub async fn notify_requester_dm(&self, user_id: &str, text: &str) {
        if !self.send_dm_if_user_not_in_channel {
            return;
        }
        match self.client.is_user_in_channel(&self.channel_id, user_id).await {
            Ok(true) => {}
            Ok(false) => {
                let text = format!(
                    "{text} You are receiving this message in a DM because you are not a \
                     member of the channel <#{}>.",
                    self.channel_id
                );
                if let Err(err) = self.client.post_message(user_id, &text, None).await {
                    tracing::warn!(user_id, error = %err, "Failed to DM requester");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to check channel membership; skipping DM");
            }
        }
    }

    /// Mention markup for an email, falling back to the bare email when the
    /// chat directory does not know it.
    pub async fn mention_by_email(&self, email: &str) -> String {
        match self.client.lookup_user_by_email(email).await {
            Ok(Some(user)) => messages::mention(&user.id),
            Ok(None) => email.to_string(),
            Err(err) => {
                tracing::warn!(email, error = %err, "Slack lookup failed; using bare email");
                email.to_string()
            }
        }
    }

    /// Mention markup for a directory principal id, resolved through the
    /// identity store to an email first.
    pub async fn mention_by_principal(
        &self,
        identity: &IdentityStoreFacade,
        principal_id: &str,
    ) -> String {
        match identity.describe_user(principal_id).await {
            Ok(user) => match user.email {
                Some(email) => self.mention_by_email(&email).await,
                None => user.user_name,
            },
            Err(err) => {
                tracing::warn!(principal_id, error = %err, "Failed to describe principal");
                principal_id.to_string()
            }
        }
    }

    /// Whether a root message still shows the waiting status. Used by the
    /// renotification and expiry handlers to decide if the request is still
    /// pending without any request database. The fallback-domain banner may
    /// precede the status emoji, so this is a containment check; terminal
    /// states rewrite the message with a different emoji.
    pub fn message_is_pending(&self, text: &str) -> bool {
        text.contains(self.waiting_emoji.as_str())
    }
}
