//! `pos-sync`: runs the terminal's data layer headless.
//!
//! `run` keeps the sync engine alive until Ctrl-C; the other commands are
//! one-shot maintenance helpers for support staff.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use pos_offline_sync::diagnostics::{get_about_info, get_system_health, init_logging};
use pos_offline_sync::receipt::SpoolPrintSink;
use pos_offline_sync::{storage, HttpBackend, PosConfig, PosContext, SyncTrigger};

#[derive(Parser)]
#[command(name = "pos-sync")]
#[command(about = "Offline-first data layer for The Small POS terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted (default)
    Run,

    /// Run one full sync (upload, then reference download) and exit
    Sync {
        /// Download reference data even if the cache is fresh
        #[arg(long)]
        force: bool,
    },

    /// Print local store health and sync backlog as JSON
    Status,

    /// Store backend credentials in the OS keyring
    Login {
        /// Backend base URL
        url: String,
        /// Backend API key
        api_key: String,
    },

    /// Remove stored backend credentials
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = PosConfig::load().context("loading configuration")?;
    let _log_guard = init_logging(&config.log_dir()).context("initialising logging")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Login { url, api_key } => {
            storage::store_backend_credentials(&url, &api_key)
                .context("storing backend credentials")?;
            config.remote_url = url;
            config.save().context("saving configuration")?;
            println!("Credentials stored.");
        }
        Commands::Logout => {
            storage::factory_reset().context("removing backend credentials")?;
            println!("Credentials removed.");
        }
        Commands::Status => {
            let ctx = build_context(&mut config)?;
            let report = serde_json::json!({
                "about": get_about_info(),
                "health": get_system_health(&ctx.store)?,
                "sync": ctx.orchestrator.status()?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Sync { force } => {
            let ctx = build_context(&mut config)?;
            match ctx.orchestrator.trigger_with(SyncTrigger::Manual, force).await {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => bail!("another sync is already running"),
            }
        }
        Commands::Run => {
            let ctx = build_context(&mut config)?;
            info!("Starting pos-sync v{}", env!("CARGO_PKG_VERSION"));
            ctx.start();
            ctx.orchestrator.on_foreground().await;

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("Shutdown requested");
            ctx.shutdown().await;
        }
    }
    Ok(())
}

fn build_context(config: &mut PosConfig) -> anyhow::Result<PosContext> {
    if config.remote_url.trim().is_empty() {
        if let Some(url) = storage::get_remote_url() {
            config.remote_url = url;
        }
    }
    if config.remote_url.trim().is_empty() {
        bail!("no backend URL configured; run `pos-sync login <url> <api-key>` first");
    }
    let api_key = config
        .resolve_api_key()
        .context("no backend API key configured")?;

    let backend = HttpBackend::new(&config.remote_url, &api_key)?;
    let printer = SpoolPrintSink::new(config.receipts_dir());
    let ctx = PosContext::new(config.clone(), Arc::new(backend), Arc::new(printer))?;
    Ok(ctx)
}
