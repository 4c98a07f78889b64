use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use renewgate::approval::FileApprovalStore;
use renewgate::clock::SystemClock;
use renewgate::config::{RenewalConfig, SecretBackend};
use renewgate::credentials;
use renewgate::directory::AppStoreConnectClient;
use renewgate::metrics;
use renewgate::models::ApprovalDecision;
use renewgate::notifications::{NotificationManager, Severity};
use renewgate::pipeline::{Pipeline, StageOutput};
use renewgate::secrets::{FileSecretStore, KubernetesSecretStore, SecretStore};
use renewgate::signing::FastlaneSigningTool;
use renewgate::parse_id_list;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "renewgate", version, about = "Approval-gated renewal of distribution certificates")]
struct Cli {
    /// YAML file overriding environment defaults
    #[arg(long, global = true, env = "RENEWGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Deployment environment (main, develop, ...)
    #[arg(long, global = true)]
    environment: Option<String>,

    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// text or json
    #[arg(long, global = true, env = "RENEWGATE_LOG_FORMAT", default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover bundle ids from the Xcode project
    Scan,
    /// Fetch the App Store Connect API key from the secret store
    Credentials,
    /// Decide whether the distribution certificate needs renewal
    Check {
        /// JSON array or comma separated list; scanned from the project when omitted
        #[arg(long, env = "RENEWGATE_BUNDLE_IDS")]
        bundle_ids: Option<String>,
        #[arg(long)]
        days_threshold: Option<i64>,
        #[arg(long, env = "RENEWGATE_FORCE_UPDATE")]
        force_update: bool,
    },
    /// Create an approval request and notify approvers
    RequestApproval {
        #[arg(long, env = "RENEWGATE_BUNDLE_IDS")]
        bundle_ids: Option<String>,
    },
    /// Answer the live approval request
    Approve {
        #[arg(long, env = "RENEWGATE_APPROVAL_ID", default_value = "")]
        approval_id: String,
        /// approve or reject
        #[arg(long, env = "RENEWGATE_APPROVAL_ACTION")]
        action: ApprovalDecision,
        #[arg(long, env = "GITHUB_ACTOR", default_value = "unknown")]
        actor: String,
    },
    /// Revoke, issue and refresh profiles after approval
    Renew {
        #[arg(long, env = "RENEWGATE_BUNDLE_IDS")]
        bundle_ids: Option<String>,
        #[arg(long, env = "RETRY_ATTEMPT", default_value_t = 0)]
        retry_attempt: u32,
    },
    /// Upload the renewed certificate to the secret store
    Publish,
    /// Post a status message
    Notify {
        /// success, failure, warning or info
        #[arg(long, default_value = "info")]
        status: Severity,
        #[arg(long)]
        message: String,
        /// Extra key=value fields
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "renewgate=info".into());
    let json = format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn load_config(cli: &Cli) -> Result<RenewalConfig> {
    let mut config = RenewalConfig::load(cli.config.as_deref())?;
    if let Some(environment) = &cli.environment {
        config.environment = environment.clone();
    }
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Command::Check {
        days_threshold: Some(days),
        ..
    } = &cli.command
    {
        config.days_threshold = *days;
    }
    config.validate()?;
    Ok(config)
}

async fn secret_store(config: &RenewalConfig) -> Result<Arc<dyn SecretStore>> {
    Ok(match config.secrets.backend {
        SecretBackend::File => Arc::new(FileSecretStore::new(&config.secrets.directory)),
        SecretBackend::Kubernetes => {
            Arc::new(KubernetesSecretStore::connect(&config.secrets.namespace).await?)
        },
    })
}

/// Explicit or key-file token, else one minted from the key in the secret store
async fn directory_token(config: &RenewalConfig) -> Result<String> {
    if let Some(token) = credentials::configured_token(config, Utc::now())? {
        return Ok(token);
    }
    let store = secret_store(config).await?;
    let credentials = credentials::fetch(store.as_ref(), &config.api_credentials_secret()).await?;
    Ok(credentials.mint_token(Utc::now())?)
}

/// Wire the collaborators a stage needs. Errors here are configuration errors.
async fn build_pipeline(config: RenewalConfig, command: &Command) -> Result<Pipeline> {
    let approvals = Arc::new(FileApprovalStore::open(config.approvals_dir())?);
    let notifications = Arc::new(NotificationManager::new(config.notifications.clone()));
    let output = StageOutput::path_from_env();

    let mut pipeline =
        Pipeline::new(config.clone(), Arc::new(SystemClock), approvals, notifications)
            .with_output(output);

    match command {
        Command::Check { .. } => {
            let mut directory = config.directory_config();
            directory.token = Some(
                directory_token(&config)
                    .await
                    .context("App Store Connect credentials are not available")?,
            );
            let client = AppStoreConnectClient::new(directory)?;
            pipeline = pipeline.with_directory(Arc::new(client));
        },
        Command::Renew { .. } => {
            let mut settings = config.signing.clone();
            if settings.api_key_path.is_none() && config.api_key_path().exists() {
                settings.api_key_path = Some(config.api_key_path());
            }
            pipeline = pipeline.with_signing(Arc::new(FastlaneSigningTool::new(settings)));
        },
        Command::Credentials | Command::Publish => {
            pipeline = pipeline.with_secrets(secret_store(&config).await?);
        },
        _ => {},
    }

    Ok(pipeline)
}

fn bundle_ids(pipeline: &Pipeline, raw: Option<&str>) -> Result<Vec<String>> {
    match raw.map(parse_id_list).filter(|ids| !ids.is_empty()) {
        Some(ids) => Ok(ids),
        None => pipeline.scan(),
    }
}

async fn run_stage(pipeline: &Pipeline, command: Command) -> Result<()> {
    match command {
        Command::Scan => {
            pipeline.scan()?;
        },
        Command::Credentials => {
            pipeline.credentials().await?;
        },
        Command::Check {
            bundle_ids: raw,
            force_update,
            ..
        } => {
            let ids = bundle_ids(pipeline, raw.as_deref())?;
            pipeline.check(&ids, force_update).await?;
        },
        Command::RequestApproval { bundle_ids: raw } => {
            let ids = raw.as_deref().map(parse_id_list).unwrap_or_default();
            pipeline.request_approval(&ids).await?;
        },
        Command::Approve {
            approval_id,
            action,
            actor,
        } => {
            pipeline.approve(&approval_id, action, &actor).await?;
        },
        Command::Renew {
            bundle_ids: raw,
            retry_attempt,
        } => {
            let ids = raw.as_deref().map(parse_id_list).unwrap_or_default();
            pipeline.renew(&ids, retry_attempt).await?;
        },
        Command::Publish => {
            pipeline.publish().await?;
        },
        Command::Notify {
            status,
            message,
            fields,
        } => {
            let fields: BTreeMap<String, String> = fields.into_iter().collect();
            pipeline.notify(status, &message, fields).await;
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_format);
    metrics::register_metrics();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        },
    };
    let metrics_textfile = config.metrics_textfile.clone();

    info!(environment = %config.environment, command = ?cli.command, "Starting renewgate stage");

    let pipeline = match build_pipeline(config, &cli.command).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        },
    };

    let result = run_stage(&pipeline, cli.command).await;

    if let Some(path) = metrics_textfile {
        if let Err(e) = metrics::write_textfile(&path) {
            warn!("Failed to write metrics: {:#}", e);
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Stage failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        },
    }
}
