//! Entry point. Wires Store -> Context -> Model -> Parser -> Executor.

mod audit;
mod backend;
mod config;
mod context;
mod engine;
mod error;
mod fleet;
mod orchestrator;
mod parser;
mod quotes;
mod store;
mod types;
mod utils;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::backend::HttpBackends;
use crate::engine::Executor;
use crate::fleet::FleetRunner;
use crate::orchestrator::Orchestrator;
use crate::quotes::StaticQuotes;
use crate::store::{EligibilitySource, FileStore, LedgerStore, PortfolioStore};
use crate::types::{available_capital, CommissionSettings, Flow, LedgerEntry, UserProfile};
use crate::utils::mask_secret;

#[derive(Parser, Debug)]
#[command(name = "robo-advisor")]
#[command(about = "Model-driven trade recommendations for simulated portfolios")]
struct Cli {
    /// Path to the YAML configuration
    #[arg(long, default_value = "config.yaml", env = "ADVISOR_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the advisor for one user
    RunUser { user: String },
    /// Run the advisor for every eligible user
    RunAll {
        /// Administrator on whose behalf the fleet runs
        #[arg(long = "as")]
        caller: String,
    },
    /// Re-quote a user's open positions
    Refresh { user: String },
    /// Print a user's capital and open positions
    Status { user: String },
    /// Insert or replace users from a YAML list of profiles
    ImportUsers { file: PathBuf },
    /// Record a cash deposit for a user
    Deposit { user: String, amount: f64 },
    /// Set the global commission percentages
    Commission {
        #[arg(long)]
        buy: f64,
        #[arg(long)]
        sell: f64,
    },
    /// Print the most recent audit records
    Audit {
        #[arg(long, default_value_t = 1)]
        last: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::AppConfig::load(&cli.config)?;
    let store = FileStore::open(&cfg.store.path)?;
    let quotes = StaticQuotes::new(cfg.quotes.clone());
    let backends = HttpBackends::new(cfg.backend.clone());
    info!(
        "Advisor started. Store={}, DryRun={}, Timeout={}s, Quotes={}",
        cfg.store.path,
        cfg.exec.dry_run,
        cfg.backend.timeout_sec,
        cfg.quotes.len()
    );

    let orchestrator = Orchestrator::new(&store, &quotes, &backends, &cfg);

    match cli.cmd {
        Command::RunUser { user } => {
            let report = orchestrator.run(&user).await?;
            println!("{}: {}", report.user, report.message());
        }

        Command::RunAll { caller } => {
            let caller = store
                .find_user(&caller)?
                .with_context(|| format!("unknown caller {caller}"))?;

            // Ctrl-C lets the current user finish, then stops the fleet.
            let abort = Arc::new(AtomicBool::new(false));
            tokio::spawn({
                let abort = Arc::clone(&abort);
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Ctrl-C received, stopping after the current user");
                        abort.store(true, Ordering::SeqCst);
                    }
                }
            });

            let report = FleetRunner::new(orchestrator)
                .run_all(&caller, &abort)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("{}", report.headline());
        }

        Command::Refresh { user } => {
            let report = Executor::new(&store, &quotes).refresh_prices(&user).await?;
            println!(
                "{} positions refreshed, {} without quote {:?}",
                report.updated,
                report.skipped.len(),
                report.skipped
            );
        }

        Command::Status { user } => {
            let capital = available_capital(&store.list_by_user(&user)?);
            let positions = store.list_active_by_user(&user)?;
            println!("{user}: available capital ${capital:.2}, {} open positions", positions.len());
            for p in positions {
                println!(
                    "  {:<8} {:>10} @ {:>10.2}  now {:>10.2}  P/L {:>10.2} ({:+.2}%)",
                    p.symbol,
                    p.signed_shares(),
                    p.buy_price,
                    p.current_price,
                    p.profit_loss,
                    p.profit_loss_pct
                );
            }
        }

        Command::ImportUsers { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("read users {}", file.display()))?;
            let users: Vec<UserProfile> =
                serde_yaml::from_str(&text).context("parse users yaml")?;
            for user in users {
                info!(
                    "Importing {} (bot_mode={}, eligible={}, key={})",
                    user.id,
                    user.bot_mode,
                    user.is_eligible(),
                    user.model
                        .as_ref()
                        .and_then(|m| m.api_key.as_deref())
                        .map(mask_secret)
                        .unwrap_or_else(|| "none".into())
                );
                store.upsert_user(user)?;
            }
        }

        Command::Deposit { user, amount } => {
            store.append(LedgerEntry::new(&user, Flow::Inflow, amount, "deposit".into()))?;
            let capital = available_capital(&store.list_by_user(&user)?);
            println!("{user}: available capital ${capital:.2}");
        }

        Command::Commission { buy, sell } => {
            store.set_commission(CommissionSettings {
                buy_pct: buy,
                sell_pct: sell,
            })?;
            println!("commission set: buy {buy}%, sell {sell}%");
        }

        Command::Audit { last } => {
            let log = store.audit_log()?;
            for record in log.iter().skip(log.len().saturating_sub(last)) {
                println!(
                    "--- {} [{}] {} ---\n{}",
                    record.id,
                    record.origin,
                    record.created_at.to_rfc3339(),
                    record.body
                );
            }
        }
    }

    Ok(())
}
