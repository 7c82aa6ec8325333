//! Configuration for the elevate processes.
//!
//! Runtime knobs come from a TOML file with `${VAR_NAME}` environment
//! interpolation, loaded once at startup into an immutable [`AppConfig`]
//! that is threaded through every component; nothing re-reads the
//! environment after that. The approval-policy statements are a separate
//! JSON document in the config bucket, handled by [`policy_doc`].
//!
//! # Example
//!
//! ```toml
//! [aws]
//! sso_instance_arn = "arn:aws:sso:::instance/ssoins-112233"
//!
//! [slack]
//! bot_token = "${SLACK_BOT_TOKEN}"
//! signing_secret = "${SLACK_SIGNING_SECRET}"
//! channel_id = "C0123456789"
//! ```

pub mod policy_doc;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::ValidateEmail;

pub use policy_doc::PolicyDocumentSource;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable {0} referenced by the config is not set")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Failed to parse policy document: {0}")]
    PolicyParse(String),

    #[error("Failed to fetch policy document: {0}")]
    PolicyFetch(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration. All sections except the ones naming external
/// resources have defaults, so a minimal file stays small.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub aws: AwsSettings,

    pub slack: SlackSettings,

    #[serde(default)]
    pub requests: RequestSettings,

    pub storage: StorageSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub identity: IdentitySettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// AWS client settings shared by every facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsSettings {
    /// Region override; the default credential chain region applies when
    /// unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override for localstack-style testing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// The SSO instance this deployment governs.
    pub sso_instance_arn: String,
}

/// Chat adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackSettings {
    pub bot_token: String,
    pub signing_secret: String,
    /// The approval channel all request threads live in.
    pub channel_id: String,
    /// DM a requester who is not a member of the approval channel.
    #[serde(default = "default_true")]
    pub send_dm_if_user_not_in_channel: bool,
    /// Post a channel notice when a revocation completes.
    #[serde(default)]
    pub post_update_on_revoke: bool,
    #[serde(default = "default_waiting_emoji")]
    pub waiting_result_emoji: String,
    #[serde(default = "default_good_emoji")]
    pub good_result_emoji: String,
    #[serde(default = "default_bad_emoji")]
    pub bad_result_emoji: String,
    #[serde(default = "default_discarded_emoji")]
    pub discarded_result_emoji: String,
}

/// Request lifecycle knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSettings {
    /// Upper bound a requester can ask for.
    pub max_permissions_duration_hours: u64,
    /// Pending requests expire after this long, by wall clock.
    pub request_expiration_hours: u64,
    /// First approver reminder fires after this wait.
    pub approver_renotification_initial_wait_minutes: u64,
    /// Each following reminder multiplies the wait by this factor;
    /// zero keeps the wait constant.
    pub approver_renotification_backoff_multiplier: u32,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            max_permissions_duration_hours: 12,
            request_expiration_hours: 8,
            approver_renotification_initial_wait_minutes: 15,
            approver_renotification_backoff_multiplier: 2,
        }
    }
}

/// Object-store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    /// Bucket holding the policy document and the listing cache.
    pub config_bucket: String,
    /// Bucket receiving audit records; versioned and object-locked by the
    /// infrastructure.
    pub audit_bucket: String,
    #[serde(default = "default_audit_prefix")]
    pub audit_prefix: String,
    #[serde(default = "default_policy_key")]
    pub policy_document_key: String,
}

/// Listing-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// EventBridge scheduler wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSettings {
    /// Schedule group all one-shot jobs live in.
    pub group_name: String,
    /// ARN of the revoker entry point every schedule targets.
    pub revoker_target_arn: String,
    /// Role the scheduler assumes to invoke the target.
    pub role_arn: String,
}

/// Requester identity resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySettings {
    /// Alternate email domains tried when the chat email does not resolve
    /// to a directory user. Any hit through these is flagged in every
    /// audit row and notification for the request.
    #[serde(default)]
    pub secondary_fallback_email_domains: Vec<String>,
}

/// What the syncer does with a manual assignment in a managed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualAssignmentPolicy {
    Warn,
    Remove,
}

/// One attribute mapping rule as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncRuleConfig {
    pub group_name: String,
    /// Attribute name to expected value; all must match exactly.
    pub attributes: BTreeMap<String, String>,
}

/// Attribute-based group sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Groups the syncer may read and mutate; nothing else is touched.
    #[serde(default)]
    pub managed_groups: Vec<String>,
    #[serde(default = "default_manual_assignment_policy")]
    pub manual_assignment_policy: ManualAssignmentPolicy,
    #[serde(default)]
    pub rules: Vec<SyncRuleConfig>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            managed_groups: Vec::new(),
            manual_assignment_policy: ManualAssignmentPolicy::Warn,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_audit_prefix() -> String {
    "audit".to_string()
}
fn default_policy_key() -> String {
    "config/approval-config.json".to_string()
}
fn default_waiting_emoji() -> String {
    ":large_yellow_circle:".to_string()
}
fn default_good_emoji() -> String {
    ":white_check_mark:".to_string()
}
fn default_bad_emoji() -> String {
    ":x:".to_string()
}
fn default_discarded_emoji() -> String {
    ":white_circle:".to_string()
}
fn default_manual_assignment_policy() -> ManualAssignmentPolicy {
    ManualAssignmentPolicy::Warn
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded;
    /// missing variables are an error.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let expanded = expand_env_vars(contents)?;
        let config: AppConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> ConfigResult<()> {
        fn require(value: &str, name: &str) -> ConfigResult<()> {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{name} must not be empty")));
            }
            Ok(())
        }

        require(&self.aws.sso_instance_arn, "aws.sso_instance_arn")?;
        require(&self.slack.bot_token, "slack.bot_token")?;
        require(&self.slack.signing_secret, "slack.signing_secret")?;
        require(&self.slack.channel_id, "slack.channel_id")?;
        require(&self.storage.config_bucket, "storage.config_bucket")?;
        require(&self.storage.audit_bucket, "storage.audit_bucket")?;
        require(&self.scheduler.group_name, "scheduler.group_name")?;
        require(&self.scheduler.revoker_target_arn, "scheduler.revoker_target_arn")?;
        require(&self.scheduler.role_arn, "scheduler.role_arn")?;

        if self.requests.max_permissions_duration_hours == 0 {
            return Err(ConfigError::Validation(
                "requests.max_permissions_duration_hours must be positive".into(),
            ));
        }
        if self.requests.request_expiration_hours == 0 {
            return Err(ConfigError::Validation(
                "requests.request_expiration_hours must be positive".into(),
            ));
        }
        if self.requests.approver_renotification_initial_wait_minutes == 0 {
            return Err(ConfigError::Validation(
                "requests.approver_renotification_initial_wait_minutes must be positive".into(),
            ));
        }

        for domain in &self.identity.secondary_fallback_email_domains {
            // The domains become the host part of candidate emails, so a
            // syntactically valid address must come out of the substitution.
            let candidate = format!("probe@{domain}");
            if domain.contains('@') || !candidate.validate_email() {
                return Err(ConfigError::Validation(format!(
                    "identity.secondary_fallback_email_domains entry {domain:?} is not a \
                     valid email domain"
                )));
            }
        }

        self.validate_sync()
    }

    fn validate_sync(&self) -> ConfigResult<()> {
        if !self.sync.enabled {
            return Ok(());
        }
        if self.sync.managed_groups.is_empty() {
            return Err(ConfigError::Validation(
                "sync.managed_groups must not be empty when sync is enabled".into(),
            ));
        }
        if self.sync.rules.is_empty() {
            return Err(ConfigError::Validation(
                "sync.rules must not be empty when sync is enabled".into(),
            ));
        }
        let managed: std::collections::BTreeSet<&str> =
            self.sync.managed_groups.iter().map(String::as_str).collect();
        for (i, rule) in self.sync.rules.iter().enumerate() {
            if rule.group_name.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "sync.rules[{i}] is missing a group_name"
                )));
            }
            if !managed.contains(rule.group_name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "sync.rules[{i}] references group {:?} which is not in managed_groups",
                    rule.group_name
                )));
            }
            if rule.attributes.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "sync.rules[{i}] must list at least one attribute condition"
                )));
            }
        }
        Ok(())
    }

    pub fn max_permissions_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.requests.max_permissions_duration_hours as i64)
    }

    pub fn request_expiration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.requests.request_expiration_hours as i64)
    }
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"));

/// Expand environment variables in the format `${VAR_NAME}`.
fn expand_env_vars(contents: &str) -> ConfigResult<String> {
    let mut missing = None;
    let expanded = ENV_VAR_PATTERN.replace_all(contents, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}
