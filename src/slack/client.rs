use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::error::{SlackError, SlackResult};

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// A posted message, addressed by channel and timestamp. The timestamp
/// doubles as the thread reference for replies and updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub channel: String,
    pub ts: String,
}

/// A chat user as resolved from the Slack directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackUser {
    pub id: String,
    pub real_name: String,
    pub email: Option<String>,
}

/// Minimal Slack Web API client covering what the flows need.
#[derive(Clone)]
pub struct SlackClient {
    http: Client,
    token: String,
    base_url: String,
}

#[derive(Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Deserialize)]
struct UserResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    user: Option<UserObject>,
}

#[derive(Deserialize)]
struct UserObject {
    id: String,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: Option<UserProfile>,
}

#[derive(Deserialize)]
struct UserProfile {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct HistoryMessage {
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl SlackClient {
    pub fn new(http: Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different API root (wiremock in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn check(envelope: &Envelope, method: &'static str) -> SlackResult<()> {
        if envelope.ok {
            Ok(())
        } else {
            Err(SlackError::Api {
                method,
                code: envelope.error.clone().unwrap_or_else(|| "unknown".to_string()),
            })
        }
    }

    /// Post a message, optionally into a thread.
    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> SlackResult<MessageRef> {
        let mut body = json!({ "channel": channel, "text": text });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        let response: PostMessageResponse = self
            .http
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        Self::check(&response.envelope, "chat.postMessage")?;
        Ok(MessageRef {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response.ts.ok_or(SlackError::MissingField("ts"))?,
        })
    }

    /// Replace the text of an existing message.
    pub async fn update_message(&self, channel: &str, ts: &str, text: &str) -> SlackResult<()> {
        let response: PostMessageResponse = self
            .http
            .post(format!("{}/chat.update", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({ "channel": channel, "ts": ts, "text": text }))
            .send()
            .await?
            .json()
            .await?;
        Self::check(&response.envelope, "chat.update")
    }

    /// Resolve a user by email. `None` when Slack knows no such user.
    pub async fn lookup_user_by_email(&self, email: &str) -> SlackResult<Option<SlackUser>> {
        let response: UserResponse = self
            .http
            .get(format!("{}/users.lookupByEmail", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("email", email)])
            .send()
            .await?
            .json()
            .await?;
        if !response.envelope.ok {
            if response.envelope.error.as_deref() == Some("users_not_found") {
                return Ok(None);
            }
            Self::check(&response.envelope, "users.lookupByEmail")?;
        }
        Ok(response.user.map(user_from))
    }

    /// Whether a user is a member of the channel. Paginates the member
    /// list; channels here are small approval channels.
    pub async fn is_user_in_channel(&self, channel: &str, user_id: &str) -> SlackResult<bool> {
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("channel", channel.to_string()), ("limit", "200".to_string())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let response: MembersResponse = self
                .http
                .get(format!("{}/conversations.members", self.base_url))
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await?
                .json()
                .await?;
            Self::check(&response.envelope, "conversations.members")?;
            if response.members.iter().any(|m| m == user_id) {
                return Ok(true);
            }
            cursor = response
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                return Ok(false);
            }
        }
    }

    /// Fetch one message by timestamp. `None` when it no longer exists.
    pub async fn get_message_text(
        &self,
        channel: &str,
        ts: &str,
    ) -> SlackResult<Option<String>> {
        let response: HistoryResponse = self
            .http
            .get(format!("{}/conversations.history", self.base_url))
            .bearer_auth(&self.token)
            .query(&[
                ("channel", channel),
                ("latest", ts),
                ("oldest", ts),
                ("inclusive", "true"),
                ("limit", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;
        Self::check(&response.envelope, "conversations.history")?;
        Ok(response
            .messages
            .into_iter()
            .find(|m| m.ts.as_deref() == Some(ts))
            .and_then(|m| m.text))
    }
}

fn user_from(user: UserObject) -> SlackUser {
    let profile_real_name = user.profile.as_ref().and_then(|p| p.real_name.clone());
    SlackUser {
        real_name: user
            .real_name
            .or(profile_real_name)
            .unwrap_or_default(),
        email: user.profile.and_then(|p| p.email),
        id: user.id,
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> SlackClient {
        SlackClient::new(Client::new(), "xoxb-test").with_base_url(server.uri())
    }

    #[tokio::test]
    async fn post_message_returns_the_message_ref() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(body_partial_json(json!({ "channel": "C1", "text": "hi" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "channel": "C1", "ts": "1700000000.000100"
            })))
            .mount(&server)
            .await;

        let posted = client(&server).post_message("C1", "hi", None).await.unwrap();
        assert_eq!(posted, MessageRef { channel: "C1".into(), ts: "1700000000.000100".into() });
    }

    #[tokio::test]
    async fn api_level_errors_surface_their_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false, "error": "channel_not_found"
            })))
            .mount(&server)
            .await;

        let err = client(&server).post_message("C9", "hi", None).await.unwrap_err();
        match err {
            SlackError::Api { method, code } => {
                assert_eq!(method, "chat.postMessage");
                assert_eq!(code, "channel_not_found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_user_email_is_none_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users.lookupByEmail"))
            .and(query_param("email", "ghost@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false, "error": "users_not_found"
            })))
            .mount(&server)
            .await;

        let user = client(&server)
            .lookup_user_by_email("ghost@example.com")
            .await
            .unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn channel_membership_follows_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.members"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "members": ["U3"],
                "response_metadata": { "next_cursor": "" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations.members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "members": ["U1", "U2"],
                "response_metadata": { "next_cursor": "page2" }
            })))
            .mount(&server)
            .await;

        assert!(client(&server).is_user_in_channel("C1", "U3").await.unwrap());
        assert!(!client(&server).is_user_in_channel("C1", "U9").await.unwrap());
    }
}
