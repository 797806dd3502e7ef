//! Callscope driver binary.
//!
//! Thin CLI over the library: `backfill` replays a historical mentions file,
//! `live` runs the periodic advancement loop, `export` prints a read-model
//! snapshot as JSON.

use anyhow::{Context, Result};
use callscope_backend::{
    app::AppContext, bootstrap::BootstrapOrchestrator, config::Config, exports,
    live::LiveOrchestrator, mentions::read_mentions_file,
};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "callscope", about = "Channel call tracking and reputation engine")]
struct Cli {
    /// Path to a TOML config file (defaults to $CONFIG_PATH if set).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconstruct outcomes for historical messages from archived prices.
    Backfill {
        /// JSONL file of extracted mentions, one tuple per line.
        #[arg(long)]
        mentions: PathBuf,
    },
    /// Advance in-flight signals on the configured cycle period.
    Live,
    /// Print one read-model snapshot as JSON on stdout.
    Export {
        #[arg(value_enum)]
        model: ExportModel,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportModel {
    Messages,
    Rankings,
    ChannelToken,
    TokenCross,
    Performance,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(2);
        }
    };

    let ctx = AppContext::init(config).context("initialize application state")?;

    // Ctrl-C stops admitting work; orchestrators drain and persist.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                ctx.request_shutdown();
            }
        });
    }

    match cli.command {
        Command::Backfill { mentions } => {
            let mentions = read_mentions_file(&mentions)?;
            info!(count = mentions.len(), "starting bootstrap");
            BootstrapOrchestrator::new(ctx).run(mentions).await
        }
        Command::Live => LiveOrchestrator::new(ctx).run(None).await,
        Command::Export { model } => {
            let snapshot = ctx.store.snapshot();
            let reputation = ctx.learning.store();
            let now = Utc::now().timestamp();
            let json = match model {
                ExportModel::Messages => {
                    serde_json::to_string_pretty(&exports::messages(&snapshot, reputation))?
                }
                ExportModel::Rankings => {
                    serde_json::to_string_pretty(&exports::channel_rankings(reputation))?
                }
                ExportModel::ChannelToken => {
                    serde_json::to_string_pretty(&exports::channel_token_performance(reputation))?
                }
                ExportModel::TokenCross => {
                    serde_json::to_string_pretty(&exports::token_cross_channel(reputation))?
                }
                ExportModel::Performance => {
                    serde_json::to_string_pretty(&exports::performance(&snapshot, now))?
                }
            };
            println!("{}", json);
            Ok(())
        }
    }
}
