//! Typed facades over the AWS control plane.
//!
//! Everything that talks to IAM Identity Center (SSO Admin + Identity
//! Store), Organizations or the object store goes through this module.
//! Listings are paginated to fully materialized `Vec`s because downstream
//! consumers filter and compare them; creation and deletion calls poll to a
//! terminal state with bounded backoff. Throttling and transport failures
//! are retried here so callers only see spent retry budgets.

pub mod error;
mod identity_store;
mod organizations;
mod sso;
pub mod types;

use std::future::Future;
use std::time::Duration;

use aws_sdk_ssoadmin::error::{ProvideErrorMetadata, SdkError};

pub use error::{DirectoryError, DirectoryResult};
pub use identity_store::IdentityStoreFacade;
pub use organizations::OrganizationsFacade;
pub use sso::{CreationOutcome, DeletionOutcome, SsoAdminFacade};

use crate::config::AwsSettings;

/// The SDK clients this deployment uses, built once from shared config.
#[derive(Clone)]
pub struct AwsClients {
    pub sso: aws_sdk_ssoadmin::Client,
    pub identity: aws_sdk_identitystore::Client,
    pub organizations: aws_sdk_organizations::Client,
    pub scheduler: aws_sdk_scheduler::Client,
    pub s3: aws_sdk_s3::Client,
}

impl AwsClients {
    /// Build all clients from the standard credential chain, honoring the
    /// configured region and the optional endpoint override used for
    /// localstack-style testing.
    pub async fn load(settings: &AwsSettings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint_url) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;

        Self {
            sso: aws_sdk_ssoadmin::Client::new(&sdk_config),
            identity: aws_sdk_identitystore::Client::new(&sdk_config),
            organizations: aws_sdk_organizations::Client::new(&sdk_config),
            scheduler: aws_sdk_scheduler::Client::new(&sdk_config),
            s3: aws_sdk_s3::Client::new(&sdk_config),
        }
    }
}

const RETRY_ATTEMPTS: u32 = 4;
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(400);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

/// Map an SDK error onto [`DirectoryError::Api`], classifying throttling and
/// transport failures as retryable.
pub(crate) fn classify<E, R>(context: &'static str, err: &SdkError<E, R>) -> DirectoryError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    let retryable = match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => true,
        _ => matches!(
            err.code(),
            Some("ThrottlingException")
                | Some("TooManyRequestsException")
                | Some("ServiceQuotaExceededException")
                | Some("InternalServerException")
        ),
    };
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    DirectoryError::Api { context, message, retryable }
}

/// Run `op`, retrying retryable failures with exponential backoff.
pub(crate) async fn with_backoff<T, F, Fut>(context: &'static str, mut op: F) -> DirectoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DirectoryResult<T>>,
{
    let mut delay = RETRY_INITIAL_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::warn!(
                    context,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient directory error"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}
