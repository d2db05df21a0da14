use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use smrtlink_share::config::{ConfigLoader, ResolvedConfig, Secrets};
use smrtlink_share::document::XmlDocumentReader;
use smrtlink_share::domain::ProjectId;
use smrtlink_share::engine::Engine;
use smrtlink_share::error::ShareError;
use smrtlink_share::globus::GlobusHttpClient;
use smrtlink_share::notify::{Dispatcher, Notification};
use smrtlink_share::output::{DispatchResult, JsonOutput, SweepResult};
use smrtlink_share::smrtlink::SmrtLinkHttpClient;
use smrtlink_share::staging::Stager;
use smrtlink_share::store::StateStore;

type LiveEngine = Engine<SmrtLinkHttpClient, GlobusHttpClient, XmlDocumentReader>;

#[derive(Parser)]
#[command(name = "smrtlink-share")]
#[command(about = "Share SMRT Link project datasets with project members over Globus")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Reconcile the most recently created project")]
    NewProject(ConfigArgs),
    #[command(about = "Reconcile one project against SMRT Link")]
    UpdatedProject(ProjectArgs),
    #[command(about = "Unstage and revoke everything shared from a project")]
    DeletedProject(ProjectArgs),
    #[command(about = "Stage outputs of analysis jobs created since the last run")]
    NewAnalyses(ConfigArgs),
    #[command(about = "Forget permission records past their expiry")]
    Sweep(ConfigArgs),
    #[command(about = "Handle a webhook given as HTTP method and path")]
    Notify(NotifyArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct ProjectArgs {
    project_id: String,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct NotifyArgs {
    method: String,
    path: String,

    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(share) = report.downcast_ref::<ShareError>() {
            return ExitCode::from(map_exit_code(share));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ShareError) -> u8 {
    match error {
        ShareError::MissingConfig
        | ShareError::ConfigRead(_)
        | ShareError::ConfigParse(_)
        | ShareError::MissingEnv(_)
        | ShareError::InvalidProjectId(_)
        | ShareError::UnknownNotification(_) => 2,
        ShareError::SmrtLinkHttp(_)
        | ShareError::SmrtLinkStatus { .. }
        | ShareError::GlobusHttp(_)
        | ShareError::GlobusStatus { .. }
        | ShareError::GrantQuotaExceeded(_)
        | ShareError::ProjectNotFound(_)
        | ShareError::NoProjects => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::NewProject(args) => {
            let (engine, _) = build_engine(args.config.as_deref())?;
            let report = engine.try_new_project()?;
            JsonOutput::print_reconcile(&report).into_diagnostic()
        }
        Commands::UpdatedProject(args) => {
            let project_id: ProjectId = args.project_id.parse()?;
            let (engine, _) = build_engine(args.config.as_deref())?;
            let report = engine.try_updated_project(project_id)?;
            JsonOutput::print_reconcile(&report).into_diagnostic()
        }
        Commands::DeletedProject(args) => {
            let project_id: ProjectId = args.project_id.parse()?;
            let (engine, _) = build_engine(args.config.as_deref())?;
            let report = engine.try_deleted_project(project_id)?;
            JsonOutput::print_reconcile(&report).into_diagnostic()
        }
        Commands::NewAnalyses(args) => {
            let (engine, _) = build_engine(args.config.as_deref())?;
            let report = engine.try_new_analyses()?;
            JsonOutput::print_analyses(&report).into_diagnostic()
        }
        Commands::Sweep(args) => {
            let (engine, _) = build_engine(args.config.as_deref())?;
            let expired_removed = engine.try_expired_permissions()?;
            JsonOutput::print_sweep(&SweepResult { expired_removed }).into_diagnostic()
        }
        Commands::Notify(args) => {
            let notification = Notification::from_request(&args.method, &args.path)?;
            let (engine, resolved) = build_engine(args.config.as_deref())?;
            let dispatcher = Dispatcher::new(Arc::new(engine), resolved.notification_delay);
            dispatcher
                .dispatch(notification)
                .join()
                .map_err(|_| miette::Report::msg("notification worker panicked"))?;
            JsonOutput::print_dispatch(&DispatchResult {
                notification: notification.to_string(),
            })
            .into_diagnostic()
        }
    }
}

fn build_engine(config: Option<&str>) -> Result<(LiveEngine, ResolvedConfig), ShareError> {
    let resolved = ConfigLoader::resolve(config)?;
    let secrets = Secrets::from_env()?;

    let smrtlink = SmrtLinkHttpClient::new(
        &resolved.smrtlink_url,
        &resolved.smrtlink_username,
        &secrets.smrtlink_password,
        resolved.smrtlink_verify_tls,
    )?;
    let globus = GlobusHttpClient::new(&resolved.globus_client_id, &secrets.globus_client_secret)?;
    let store = StateStore::open(&resolved.database_path)?;
    let stager = Stager::new(&resolved.staging_root, resolved.service_uid)?;

    let engine = Engine::new(
        Arc::new(smrtlink),
        globus,
        XmlDocumentReader,
        Arc::new(store),
        stager,
        resolved.engine_settings(),
    );
    Ok((engine, resolved))
}
