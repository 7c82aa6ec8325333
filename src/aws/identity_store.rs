use std::collections::BTreeMap;

use aws_sdk_identitystore::types::{Filter, MemberId, User};
use aws_sdk_identitystore::Client;

use super::error::{DirectoryError, DirectoryResult};
use super::types::{GroupMembershipInfo, ResolvedPrincipal, SsoGroup, SsoUser};
use super::{classify, with_backoff};

/// Facade over the Identity Store for one identity store id.
#[derive(Clone)]
pub struct IdentityStoreFacade {
    client: Client,
    identity_store_id: String,
}

impl IdentityStoreFacade {
    pub fn new(client: Client, identity_store_id: impl Into<String>) -> Self {
        Self { client, identity_store_id: identity_store_id.into() }
    }

    pub fn identity_store_id(&self) -> &str {
        &self.identity_store_id
    }

    /// Resolve a chat-provided email to a directory user.
    ///
    /// The primary lookup matches `UserName = email`. When that misses and
    /// fallback domains are configured, each alternate domain is substituted
    /// in turn; a hit through a fallback is flagged so every audit row and
    /// notification for the request can warn about it.
    pub async fn find_user_by_email(
        &self,
        email: &str,
        fallback_domains: &[String],
    ) -> DirectoryResult<ResolvedPrincipal> {
        if let Some(user_id) = self.lookup_by_user_name(email).await? {
            return Ok(ResolvedPrincipal {
                user_id,
                email_used: email.to_string(),
                secondary_domain_was_used: false,
            });
        }

        if let Some(local_part) = email.split('@').next() {
            for domain in fallback_domains {
                let candidate = format!("{local_part}@{domain}");
                if candidate == email {
                    continue;
                }
                tracing::info!(email, candidate, "Retrying user lookup with fallback domain");
                if let Some(user_id) = self.lookup_by_user_name(&candidate).await? {
                    return Ok(ResolvedPrincipal {
                        user_id,
                        email_used: candidate,
                        secondary_domain_was_used: true,
                    });
                }
            }
        }

        Err(DirectoryError::UserNotFound {
            email: email.to_string(),
            fallbacks_tried: fallback_domains.len(),
        })
    }

    async fn lookup_by_user_name(&self, user_name: &str) -> DirectoryResult<Option<String>> {
        let filter = Filter::builder()
            .attribute_path("UserName")
            .attribute_value(user_name)
            .build()
            .map_err(|e| DirectoryError::Api {
                context: "identitystore list-users filter",
                message: e.to_string(),
                retryable: false,
            })?;

        with_backoff("identitystore list-users", || {
            let filter = filter.clone();
            async move {
                let out = self
                    .client
                    .list_users()
                    .identity_store_id(&self.identity_store_id)
                    .filters(filter)
                    .send()
                    .await
                    .map_err(|e| classify("identitystore list-users", &e))?;
                Ok(out
                    .users()
                    .first()
                    .map(|user| user.user_id().to_string()))
            }
        })
        .await
    }

    pub async fn describe_user(&self, user_id: &str) -> DirectoryResult<SsoUser> {
        with_backoff("identitystore describe-user", || async move {
            let out = self
                .client
                .describe_user()
                .identity_store_id(&self.identity_store_id)
                .user_id(user_id)
                .send()
                .await
                .map_err(|e| classify("identitystore describe-user", &e))?;

            let mut attributes = BTreeMap::new();
            collect_scalar(&mut attributes, "displayName", out.display_name());
            collect_scalar(&mut attributes, "title", out.title());
            collect_scalar(&mut attributes, "userType", out.user_type());
            collect_scalar(&mut attributes, "locale", out.locale());
            collect_scalar(&mut attributes, "timezone", out.timezone());
            collect_scalar(&mut attributes, "preferredLanguage", out.preferred_language());
            collect_scalar(&mut attributes, "nickName", out.nick_name());

            Ok(SsoUser {
                user_id: out.user_id().to_string(),
                user_name: out.user_name().unwrap_or_default().to_string(),
                email: primary_email_from(out.emails()),
                attributes,
            })
        })
        .await
    }

    /// All users with the attribute map the syncer evaluates rules against.
    pub async fn list_users(&self) -> DirectoryResult<Vec<SsoUser>> {
        with_backoff("identitystore list-users", || async move {
            let mut users = Vec::new();
            let mut items = self
                .client
                .list_users()
                .identity_store_id(&self.identity_store_id)
                .into_paginator()
                .items()
                .send();
            while let Some(user) = items
                .try_next()
                .await
                .map_err(|e| classify("identitystore list-users", &e))?
            {
                users.push(sso_user_from(&user));
            }
            Ok(users)
        })
        .await
    }

    pub async fn list_groups(&self) -> DirectoryResult<Vec<SsoGroup>> {
        with_backoff("identitystore list-groups", || async move {
            let mut groups = Vec::new();
            let mut items = self
                .client
                .list_groups()
                .identity_store_id(&self.identity_store_id)
                .into_paginator()
                .items()
                .send();
            while let Some(group) = items
                .try_next()
                .await
                .map_err(|e| classify("identitystore list-groups", &e))?
            {
                groups.push(SsoGroup {
                    group_id: group.group_id().to_string(),
                    name: group.display_name().unwrap_or_default().to_string(),
                    description: group.description().map(str::to_string),
                });
            }
            Ok(groups)
        })
        .await
    }

    pub async fn describe_group(&self, group_id: &str) -> DirectoryResult<SsoGroup> {
        let result = self
            .client
            .describe_group()
            .identity_store_id(&self.identity_store_id)
            .group_id(group_id)
            .send()
            .await;

        match result {
            Ok(out) => Ok(SsoGroup {
                group_id: out.group_id().to_string(),
                name: out.display_name().unwrap_or_default().to_string(),
                description: out.description().map(str::to_string),
            }),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    Err(DirectoryError::GroupNotFound(group_id.to_string()))
                } else {
                    Err(DirectoryError::Api {
                        context: "identitystore describe-group",
                        message: service_error.to_string(),
                        retryable: false,
                    })
                }
            }
        }
    }

    pub async fn list_group_memberships(
        &self,
        group_id: &str,
    ) -> DirectoryResult<Vec<GroupMembershipInfo>> {
        with_backoff("identitystore list-group-memberships", || async move {
            let mut memberships = Vec::new();
            let mut items = self
                .client
                .list_group_memberships()
                .identity_store_id(&self.identity_store_id)
                .group_id(group_id)
                .into_paginator()
                .items()
                .send();
            while let Some(membership) = items
                .try_next()
                .await
                .map_err(|e| classify("identitystore list-group-memberships", &e))?
            {
                let Some(MemberId::UserId(user_id)) = membership.member_id() else {
                    continue;
                };
                let Some(membership_id) = membership.membership_id() else {
                    continue;
                };
                memberships.push(GroupMembershipInfo {
                    membership_id: membership_id.to_string(),
                    group_id: membership.group_id().unwrap_or(group_id).to_string(),
                    user_id: user_id.clone(),
                });
            }
            Ok(memberships)
        })
        .await
    }

    pub async fn find_membership(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> DirectoryResult<Option<GroupMembershipInfo>> {
        Ok(self
            .list_group_memberships(group_id)
            .await?
            .into_iter()
            .find(|m| m.user_id == user_id))
    }

    /// Add a user to a group. An already-existing membership is success;
    /// the existing membership id is returned.
    pub async fn create_group_membership(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> DirectoryResult<String> {
        let result = self
            .client
            .create_group_membership()
            .identity_store_id(&self.identity_store_id)
            .group_id(group_id)
            .member_id(MemberId::UserId(user_id.to_string()))
            .send()
            .await;

        match result {
            Ok(out) => Ok(out.membership_id().to_string()),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_conflict_exception() {
                    if let Some(existing) = self.find_membership(group_id, user_id).await? {
                        return Ok(existing.membership_id);
                    }
                }
                Err(DirectoryError::Api {
                    context: "identitystore create-group-membership",
                    message: service_error.to_string(),
                    retryable: false,
                })
            }
        }
    }

    /// Remove a membership. Returns `false` when it was already gone.
    pub async fn delete_group_membership(&self, membership_id: &str) -> DirectoryResult<bool> {
        let result = self
            .client
            .delete_group_membership()
            .identity_store_id(&self.identity_store_id)
            .membership_id(membership_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    Ok(false)
                } else {
                    Err(DirectoryError::Api {
                        context: "identitystore delete-group-membership",
                        message: service_error.to_string(),
                        retryable: false,
                    })
                }
            }
        }
    }
}

fn collect_scalar(attributes: &mut BTreeMap<String, String>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        if !value.is_empty() {
            attributes.insert(key.to_string(), value.to_string());
        }
    }
}

fn primary_email_from(emails: &[aws_sdk_identitystore::types::Email]) -> Option<String> {
    emails
        .iter()
        .find(|e| e.primary())
        .or_else(|| emails.first())
        .and_then(|e| e.value())
        .map(str::to_string)
}

fn sso_user_from(user: &User) -> SsoUser {
    let mut attributes = BTreeMap::new();
    collect_scalar(&mut attributes, "displayName", user.display_name());
    collect_scalar(&mut attributes, "title", user.title());
    collect_scalar(&mut attributes, "userType", user.user_type());
    collect_scalar(&mut attributes, "locale", user.locale());
    collect_scalar(&mut attributes, "timezone", user.timezone());
    collect_scalar(&mut attributes, "preferredLanguage", user.preferred_language());
    collect_scalar(&mut attributes, "nickName", user.nick_name());
    if let Some(name) = user.name() {
        collect_scalar(&mut attributes, "givenName", name.given_name());
        collect_scalar(&mut attributes, "familyName", name.family_name());
    }
    for external_id in user.external_ids() {
        attributes.insert(
            format!("externalId:{}", external_id.issuer()),
            external_id.id().to_string(),
        );
    }

    SsoUser {
        user_id: user.user_id().to_string(),
        user_name: user.user_name().unwrap_or_default().to_string(),
        email: primary_email_from(user.emails()),
        attributes,
    }
}
