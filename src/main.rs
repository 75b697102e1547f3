use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use cert_console_sync::backend::HttpBackend;
use cert_console_sync::config;
use cert_console_sync::cue::LogCue;
use cert_console_sync::db;
use cert_console_sync::dedup::SqliteDedupStore;
use cert_console_sync::reconciler::JobAction;
use cert_console_sync::{EngineOptions, SyncEngine};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll until interrupted (default)
    Run {
        /// Event whose certificate status should be followed
        #[arg(long)]
        event: Option<i64>,
    },
    /// Accept a received collaboration request
    Accept { request_id: i64 },
    /// Decline a received collaboration request
    Decline { request_id: i64 },
    /// Generate certificates for an event
    Generate { event_id: i64 },
    /// Email a single certificate
    SendEmail { event_id: i64, certificate_id: i64 },
    /// Email every generated certificate of an event
    SendAll { event_id: i64 },
    /// Send an update email to every participant of an event
    SendUpdates {
        event_id: i64,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        content: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteDedupStore::new(pool, cfg.feed.max_dedup_keys));
    let backend = Arc::new(HttpBackend::from_config(&cfg)?);
    let engine = SyncEngine::new(
        backend,
        store,
        Arc::new(LogCue),
        EngineOptions::from_config(&cfg),
    );

    match args.command.unwrap_or(Command::Run { event: None }) {
        Command::Run { event } => run(&engine, event).await,
        Command::Accept { request_id } => {
            prime(&engine).await;
            report(&engine, engine.accept_request(request_id).await).await
        }
        Command::Decline { request_id } => {
            prime(&engine).await;
            report(&engine, engine.decline_request(request_id).await).await
        }
        Command::Generate { event_id } => {
            one_shot(&engine, JobAction::GenerateCertificates { event_id }).await
        }
        Command::SendEmail {
            event_id,
            certificate_id,
        } => {
            one_shot(
                &engine,
                JobAction::SendEmail {
                    event_id,
                    certificate_id,
                },
            )
            .await
        }
        Command::SendAll { event_id } => {
            one_shot(&engine, JobAction::SendAllEmails { event_id }).await
        }
        Command::SendUpdates {
            event_id,
            subject,
            content,
        } => {
            one_shot(
                &engine,
                JobAction::SendUpdates {
                    event_id,
                    subject,
                    content,
                },
            )
            .await
        }
    }
}

async fn run(engine: &SyncEngine, event: Option<i64>) -> Result<()> {
    let tasks = engine.start().await;
    if let Some(event_id) = event {
        engine.watch_event(event_id).await;
    }
    info!(tasks = tasks.len(), "sync engine started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

/// Load requests and events so one-shot commands can name what they touch.
async fn prime(engine: &SyncEngine) {
    if let Err(err) = engine.poll_requests().await {
        warn!(?err, "request refresh failed");
    }
    if let Err(err) = engine.requests().refresh_events().await {
        warn!(?err, "event refresh failed");
    }
}

async fn one_shot(engine: &SyncEngine, action: JobAction) -> Result<()> {
    prime(engine).await;
    engine.watch_event(action.event_id()).await;
    if let Err(err) = engine.poll_status().await {
        warn!(?err, "initial status load failed");
    }
    let outcome = engine.run_action(action).await;
    for record in engine.job_statuses().await {
        info!(
            id = record.id,
            participant = %record.participant_name,
            generation = record.generation_status.as_str(),
            email = record.email_status.as_str(),
            "job status"
        );
    }
    report(engine, outcome).await
}

async fn report(
    engine: &SyncEngine,
    outcome: Result<(), cert_console_sync::ActionError>,
) -> Result<()> {
    for notification in engine.feed().await {
        info!(kind = ?notification.kind, "{}", notification.message);
    }
    engine.shutdown().await;
    if let Err(err) = &outcome {
        error!(%err, "action failed");
    }
    outcome.map_err(Into::into)
}
