//! elevate: just-in-time elevated access for AWS IAM Identity Center.
//!
//! Three independent process entry points share this binary, matching the
//! deployment model: `requester` handles one inbound chat event,
//! `revoker` handles one scheduler event (scheduled revocations, the two
//! reconciler sweeps, reminders, expiry), and `syncer` runs one
//! attribute-sync pass. Every invocation prints a JSON status line and
//! exits non-zero when it failed, which is what the orchestrator's
//! dead-letter wiring keys on.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;

mod audit;
mod aws;
mod cache;
mod config;
mod events;
mod executor;
mod observability;
mod policy;
mod reconciler;
mod requester;
mod requests;
mod revoker;
mod schedule;
mod slack;
mod syncer;

use audit::AuditLogWriter;
use aws::types::SsoInstance;
use aws::{AwsClients, IdentityStoreFacade, OrganizationsFacade, SsoAdminFacade};
use cache::{ObjectCache, S3ObjectCache};
use config::{AppConfig, PolicyDocumentSource};
use executor::GrantExecutor;
use policy::PolicyConfiguration;
use reconciler::Reconciler;
use requester::{InboundEnvelope, Requester};
use revoker::Revoker;
use schedule::RevocationScheduler;
use slack::{Notifier, SlackClient};
use syncer::AttributeSyncer;

/// CLI arguments for the elevate processes.
#[derive(Parser, Debug)]
#[command(version, about = "Just-in-time elevated access for AWS IAM Identity Center", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the TOML config file.
    #[arg(short, long, global = true, default_value = "elevate.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Handle one inbound chat event (form submission or button click).
    Requester {
        /// Event JSON file; `-` reads stdin.
        #[arg(long)]
        event: PathBuf,
    },
    /// Handle one scheduler event (revocation, sweep, reminder, expiry).
    Revoker {
        /// Event JSON file; `-` reads stdin.
        #[arg(long)]
        event: PathBuf,
    },
    /// Run one attribute-based group sync pass.
    Syncer,
    /// Load and validate the configuration and the policy document.
    CheckConfig,
}

/// Invocation status printed on stdout for the orchestrator.
#[derive(Debug, Serialize)]
struct RunStatus {
    ok: bool,
    errors: Vec<String>,
}

impl RunStatus {
    fn ok() -> Self {
        Self { ok: true, errors: Vec::new() }
    }

    fn from_errors(errors: Vec<String>) -> Self {
        Self { ok: errors.is_empty(), errors }
    }

    fn finish(self) -> ! {
        let code = if self.ok { 0 } else { 1 };
        println!(
            "{}",
            serde_json::to_string(&self).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        std::process::exit(code);
    }
}

/// Shared wiring for every process.
struct App {
    config: AppConfig,
    instance: SsoInstance,
    sso: SsoAdminFacade,
    identity: IdentityStoreFacade,
    organizations: OrganizationsFacade,
    scheduler: RevocationScheduler,
    audit: AuditLogWriter,
    notifier: Notifier,
    cache: Option<Arc<dyn ObjectCache>>,
    clients: AwsClients,
}

impl App {
    async fn bootstrap(config: AppConfig) -> Result<Self, String> {
        let clients = AwsClients::load(&config.aws).await;

        let sso = SsoAdminFacade::new(clients.sso.clone(), config.aws.sso_instance_arn.clone());
        let instance = sso
            .describe_instance()
            .await
            .map_err(|e| format!("resolving SSO instance: {e}"))?;
        let identity =
            IdentityStoreFacade::new(clients.identity.clone(), instance.identity_store_id.clone());
        let organizations = OrganizationsFacade::new(clients.organizations.clone());
        let scheduler = RevocationScheduler::new(
            clients.scheduler.clone(),
            config.scheduler.group_name.clone(),
            config.scheduler.revoker_target_arn.clone(),
            config.scheduler.role_arn.clone(),
        );
        let audit = AuditLogWriter::new(
            clients.s3.clone(),
            config.storage.audit_bucket.clone(),
            config.storage.audit_prefix.clone(),
        );
        let slack_client = SlackClient::new(reqwest::Client::new(), config.slack.bot_token.clone());
        let notifier = Notifier::new(slack_client, &config.slack);
        let cache: Option<Arc<dyn ObjectCache>> = if config.cache.enabled {
            Some(Arc::new(S3ObjectCache::new(
                clients.s3.clone(),
                config.storage.config_bucket.clone(),
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            instance,
            sso,
            identity,
            organizations,
            scheduler,
            audit,
            notifier,
            cache,
            clients,
        })
    }

    fn executor(&self) -> GrantExecutor {
        GrantExecutor::new(
            self.sso.clone(),
            self.identity.clone(),
            self.organizations.clone(),
            self.scheduler.clone(),
            self.audit.clone(),
            self.notifier.clone(),
        )
    }

    async fn load_policy(&self) -> Result<PolicyConfiguration, String> {
        PolicyDocumentSource::new(
            self.clients.s3.clone(),
            self.config.storage.config_bucket.clone(),
            self.config.storage.policy_document_key.clone(),
        )
        .load()
        .await
        .map_err(|e| e.to_string())
    }
}

fn read_event_file(path: &std::path::Path) -> Result<String, String> {
    if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("reading event from stdin: {e}"))?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("reading event file {path:?}: {e}"))
    }
}

async fn run_requester(app: App, event_path: &std::path::Path) -> Vec<String> {
    let raw = match read_event_file(event_path) {
        Ok(raw) => raw,
        Err(err) => return vec![err],
    };
    let envelope: InboundEnvelope = match serde_json::from_str(&raw) {
        Ok(envelope) => envelope,
        Err(err) => return vec![format!("parsing event envelope: {err}")],
    };

    let policy = match app.load_policy().await {
        Ok(policy) => policy,
        Err(err) => {
            // The requester refuses to serve on an unresolvable policy; the
            // channel notice is what tells operators it is down.
            let decision =
                policy::Decision::deny(policy::DecisionReason::ConfigurationError);
            let (text, _) = slack::messages::decision_texts(&decision, "");
            app.notifier.notify_channel(&text).await;
            return vec![err];
        }
    };

    let requester = Requester::new(
        app.config.clone(),
        policy,
        app.instance.clone(),
        app.sso.clone(),
        app.identity.clone(),
        app.organizations.clone(),
        app.cache.clone(),
        app.scheduler.clone(),
        app.executor(),
        app.notifier.clone(),
    );

    match requester.handle(&envelope).await {
        Ok(()) => Vec::new(),
        Err(err) => vec![err.to_string()],
    }
}

async fn run_revoker(app: App, event_path: &std::path::Path) -> Vec<String> {
    let raw = match read_event_file(event_path) {
        Ok(raw) => raw,
        Err(err) => return vec![err],
    };
    let event: events::RevokerEvent = match serde_json::from_str(&raw) {
        Ok(event) => event,
        Err(err) => return vec![format!("parsing revoker event: {err}")],
    };

    let policy = match app.load_policy().await {
        Ok(policy) => policy,
        Err(err) => return vec![err],
    };

    let reconciler = Reconciler::new(
        app.sso.clone(),
        app.identity.clone(),
        app.organizations.clone(),
        app.scheduler.clone(),
        app.executor(),
        app.notifier.clone(),
        policy,
    );
    let revoker = Revoker::new(
        app.config.clone(),
        app.executor(),
        reconciler,
        app.scheduler.clone(),
        app.notifier.clone(),
    );

    match revoker.handle(event).await {
        Ok(errors) => errors,
        Err(err) => vec![err.to_string()],
    }
}

async fn run_syncer(app: App) -> Vec<String> {
    let syncer = AttributeSyncer::new(
        app.identity.clone(),
        app.audit.clone(),
        app.notifier.clone(),
        app.config.sync.clone(),
    );
    syncer.run().await.errors
}

async fn run_check_config(app: App) -> Vec<String> {
    // AppConfig validation already passed during load; what remains is the
    // policy document and the directory references it leans on.
    match app.load_policy().await {
        Ok(policy) => {
            tracing::info!(
                statements = policy.statements.len(),
                group_statements = policy.group_statements.len(),
                "Configuration OK"
            );
            let mut errors = Vec::new();
            for group_id in policy.referenced_group_ids() {
                if let Err(err) = app.identity.describe_group(group_id).await {
                    // Enforcement-time behavior is to skip these; the check
                    // command surfaces them so the operator can clean up.
                    errors.push(format!("group statement references {group_id}: {err}"));
                }
            }
            errors
        }
        Err(err) => vec![err],
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AppConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => RunStatus::from_errors(vec![err.to_string()]).finish(),
    };
    observability::init_tracing(&config.observability);

    let app = match App::bootstrap(config).await {
        Ok(app) => app,
        Err(err) => RunStatus::from_errors(vec![err]).finish(),
    };

    let errors = match &args.command {
        Command::Requester { event } => run_requester(app, event).await,
        Command::Revoker { event } => run_revoker(app, event).await,
        Command::Syncer => run_syncer(app).await,
        Command::CheckConfig => run_check_config(app).await,
    };

    if errors.is_empty() {
        RunStatus::ok().finish()
    } else {
        RunStatus::from_errors(errors).finish()
    }
}
