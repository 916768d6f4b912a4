//! # convo-server
//!
//! Backend for Convo, small-group conversations and event planning.
//!
//! This binary provides:
//! - **REST API** (axum) for accounts, threads, events, messages, contacts
//!   and magic links
//! - **Inbound mail webhook** that turns e-mail replies into messages
//! - **E-mail worker** for welcome, invitation and thread mail, fed by a task
//!   queue (or an in-process queue when no task service is configured)
//! - **Daily digest** of unread messages and upcoming events

mod api;
mod clients;
mod config;
mod error;
mod render;
mod services;
mod state;

use std::time::Duration;

use chrono::Utc;
use convo_shared::magic::MagicSigner;
use convo_store::{Context, Database, Datastore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::clients::Clients;
use crate::config::{Secrets, ServerConfig};
use crate::error::alarm;
use crate::state::AppState;

const DIGEST_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,convo_server=debug,convo_store=info")),
        )
        .init();

    info!("Starting Convo server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and secrets
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    let secrets = Secrets::load(config.secrets_path.as_deref())?;
    info!(?secrets, "Loaded secrets");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let ds = Datastore::new(db);

    let (clients, local_jobs) = Clients::from_config(&config, &secrets).await?;
    let signer = MagicSigner::new(secrets.signing_secret());
    let http_addr = config.http_addr;
    let run_digest_locally = config.tasks_base_url.is_none();

    let app_state = AppState::new(ds, config, signer, clients);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // In-process e-mail queue consumer
    if let Some(mut jobs) = local_jobs {
        let state = app_state.clone();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                if let Err(e) = state.handle_email_job(&Context::background(), &job).await {
                    alarm("worker.local_job", &e);
                }
            }
        });
        info!("E-mail jobs run in process");
    }

    // Daily digest, when no scheduler calls /tasks/digest
    if run_digest_locally {
        let state = app_state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DIGEST_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match state.run_digest(&Context::background(), Utc::now()).await {
                    Ok(report) => info!(users = report.users, sent = report.sent, "digest run"),
                    Err(e) => alarm("digest.run", &e),
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
