use aws_sdk_organizations::Client;

use super::error::{DirectoryError, DirectoryResult};
use super::types::AwsAccount;
use super::{classify, with_backoff};

/// Facade over AWS Organizations account listings.
#[derive(Clone)]
pub struct OrganizationsFacade {
    client: Client,
}

impl OrganizationsFacade {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn list_accounts(&self) -> DirectoryResult<Vec<AwsAccount>> {
        with_backoff("organizations list-accounts", || async move {
            let mut accounts = Vec::new();
            let mut pages = self.client.list_accounts().into_paginator().send();
            while let Some(page) = pages
                .try_next()
                .await
                .map_err(|e| classify("organizations list-accounts", &e))?
            {
                for account in page.accounts() {
                    let (Some(id), Some(name)) = (account.id(), account.name()) else {
                        continue;
                    };
                    accounts.push(AwsAccount { id: id.to_string(), name: name.to_string() });
                }
            }
            Ok(accounts)
        })
        .await
    }

    pub async fn describe_account(&self, account_id: &str) -> DirectoryResult<AwsAccount> {
        with_backoff("organizations describe-account", || async move {
            let out = self
                .client
                .describe_account()
                .account_id(account_id)
                .send()
                .await
                .map_err(|e| classify("organizations describe-account", &e))?;

            let account = out.account().ok_or(DirectoryError::Api {
                context: "organizations describe-account",
                message: "response carried no account".to_string(),
                retryable: false,
            })?;
            Ok(AwsAccount {
                id: account.id().unwrap_or(account_id).to_string(),
                name: account.name().unwrap_or_default().to_string(),
            })
        })
        .await
    }
}
