//! portfolioctl: inspect and drive a shared bot portfolio from the shell.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shared_portfolio::{
    BotConfig, FileStateStore, LoggingEventHandler, PortfolioConfig, PortfolioManager, SyncConfig,
    SyncManager,
};

/// Shared-balance portfolio CLI.
#[derive(Parser)]
#[command(name = "portfolioctl")]
#[command(about = "Coordinate capital shared by multiple trading bots", long_about = None)]
struct Cli {
    /// Shared state file
    #[arg(short, long, env = "PORTFOLIO_STATE", default_value = "portfolio_state.json")]
    state: PathBuf,

    /// Portfolio config file (JSON); defaults are used if absent
    #[arg(short, long, env = "PORTFOLIO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shared state, or join an existing one
    Init,

    /// Show pool balances and per-bot allocations
    Status,

    /// Show portfolio health and risk metrics
    Health,

    /// Register a bot and allocate capital to it
    Register {
        bot_id: String,

        /// Trading pair, e.g. BTCUSDT
        #[arg(short, long)]
        symbol: String,

        #[arg(short = 'x', long, default_value = "10")]
        leverage: Decimal,

        /// Share of the pool (0-1]
        #[arg(short, long)]
        allocation: Decimal,

        /// Maximum notional position (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_position: Decimal,

        #[arg(long, default_value = "")]
        category: String,
    },

    /// Release a bot's allocation back to the pool
    Unregister { bot_id: String },

    /// Report a bot's position (value 0 closes it)
    Position {
        bot_id: String,

        #[arg(short, long)]
        value: Decimal,

        #[arg(short, long, default_value = "0")]
        price: Decimal,

        #[arg(short = 'x', long, default_value = "0")]
        leverage: Decimal,
    },

    /// Record realized profit (negative for a loss)
    Profit {
        bot_id: String,

        #[arg(allow_negative_numbers = true)]
        amount: Decimal,

        /// Share the profit across the pool
        #[arg(long)]
        share: bool,
    },

    /// Rebalance drifted allocations
    Rebalance {
        /// Rebalance even if no drift is reported
        #[arg(short, long)]
        force: bool,
    },

    /// Show recent allocation events
    History {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Snapshot the state file
    Backup,

    /// Restore the state file from a backup
    Restore { backup: PathBuf },

    /// List backups of the state file
    Backups,

    /// Run heartbeat and sync loops for a bot until Ctrl+C
    Run {
        #[arg(short, long, env = "BOT_ID")]
        bot_id: String,

        /// Heartbeat interval in seconds
        #[arg(long, default_value = "10")]
        heartbeat: u64,

        /// Sync interval in seconds
        #[arg(long, default_value = "5")]
        sync: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => PortfolioConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PortfolioConfig::default(),
    };

    let store = Arc::new(FileStateStore::new(&cli.state));
    let portfolio = Arc::new(PortfolioManager::new(config, store));
    portfolio
        .initialize()
        .await
        .with_context(|| format!("opening portfolio {}", cli.state.display()))?;

    match cli.command {
        Commands::Init => {
            println!("Portfolio ready at {}", cli.state.display());
            println!("Total balance: ${:.2}", portfolio.total_balance().await);
            println!("Version:       {}", portfolio.version().await);
        }

        Commands::Status => print_status(&portfolio).await,

        Commands::Health => {
            let health = portfolio.get_portfolio_health().await;
            let metrics = portfolio.risk_metrics().await;

            println!("\n=== Portfolio Health: {} ===", health.status.to_string().to_uppercase());
            println!("Exposure:          {:.1}%", health.exposure_pct);
            println!("P&L:               {:.2}%", health.pnl_pct);
            println!("Margin Used:       ${:.2}", health.total_margin_used);
            println!("Emergency Stop:    {}", if health.emergency_stop { "ENGAGED" } else { "off" });

            println!("\n--- Risk Metrics ---");
            println!("Weighted Leverage: {:.2}x", metrics.weighted_leverage);
            println!("Concentration:     {:.1}%", metrics.concentration * Decimal::ONE_HUNDRED);
            println!("Margin Util:       {:.1}%", metrics.margin_utilization * Decimal::ONE_HUNDRED);
            println!("Equity:            ${:.2}", metrics.equity);
            println!("Drawdown (peak):   {:.2}%", metrics.drawdown_from_peak * Decimal::ONE_HUNDRED);

            if !health.warnings.is_empty() {
                println!("\n--- Warnings ---");
                for warning in &health.warnings {
                    println!("  {}", warning);
                }
            }
        }

        Commands::Register {
            bot_id,
            symbol,
            leverage,
            allocation,
            max_position,
            category,
        } => {
            let bot_config = BotConfig {
                symbol,
                leverage,
                allocation_percentage: allocation,
                max_position_size: max_position,
                category,
            };
            let alloc = portfolio.register_bot(&bot_id, bot_config).await?;
            println!(
                "Registered {} ({}): ${:.2} allocated",
                bot_id, alloc.symbol, alloc.allocated_balance
            );
        }

        Commands::Unregister { bot_id } => {
            let alloc = portfolio.unregister_bot(&bot_id).await?;
            println!("Unregistered {}: ${:.2} released", bot_id, alloc.allocated_balance);
        }

        Commands::Position {
            bot_id,
            value,
            price,
            leverage,
        } => {
            // Keep the bot's current leverage unless one is given
            let leverage = match portfolio.get_allocation(&bot_id).await {
                Some(current) if leverage.is_zero() => current.leverage,
                _ => leverage,
            };
            let alloc = portfolio
                .update_position(&bot_id, value, price, leverage)
                .await?;
            println!(
                "{}: position ${:.2}, margin ${:.2}, available ${:.2}",
                bot_id, alloc.current_position, alloc.position_margin_used, alloc.available_balance
            );
        }

        Commands::Profit {
            bot_id,
            amount,
            share,
        } => {
            let shares = portfolio.record_profit(&bot_id, amount, share).await?;
            println!("Recorded ${:.2} for {}", amount, bot_id);

            let mut shares: Vec<_> = shares.into_iter().collect();
            shares.sort();
            for (recipient, share) in shares {
                println!("  {:<20} +${:.2}", recipient, share);
            }
        }

        Commands::Rebalance { force } => {
            let drifted = portfolio.check_rebalance_needed().await?;
            if drifted.is_empty() && !force {
                println!("No rebalance needed.");
                return Ok(());
            }

            for drift in &drifted {
                println!(
                    "  {:<20} {:>6.1}% -> {:>6.1}%",
                    drift.bot_id,
                    drift.current_share * Decimal::ONE_HUNDRED,
                    drift.target_share * Decimal::ONE_HUNDRED
                );
            }

            let adjustments = portfolio.rebalance().await?;
            println!("\nAdjusted {} allocation(s):", adjustments.len());
            for adj in &adjustments {
                println!("  {:<20} ${:.2} -> ${:.2}", adj.bot_id, adj.before, adj.after);
            }
        }

        Commands::History { limit } => {
            let events = portfolio.allocation_history(limit).await;
            if events.is_empty() {
                println!("No events recorded by this process.");
            }
            for event in events {
                println!(
                    "{} {:<16} {:<20} {:>12.2}  {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type.to_string(),
                    event.bot_id,
                    event.amount,
                    event.description
                );
            }
        }

        Commands::Backup => {
            let path = portfolio.backup().await?;
            println!("Backup written to {}", path.display());
        }

        Commands::Restore { backup } => {
            portfolio.restore(&backup).await?;
            println!("Restored from {}", backup.display());
            print_status(&portfolio).await;
        }

        Commands::Backups => {
            let backups = portfolio.list_backups().await?;
            if backups.is_empty() {
                println!("No backups found.");
            }
            for backup in backups {
                println!("{}", backup.display());
            }
        }

        Commands::Run {
            bot_id,
            heartbeat,
            sync,
        } => {
            let sync_config = SyncConfig {
                heartbeat_interval: std::time::Duration::from_secs(heartbeat),
                sync_interval: std::time::Duration::from_secs(sync),
                ..Default::default()
            };
            let manager = Arc::new(SyncManager::new(&bot_id, portfolio.clone(), sync_config));
            manager.add_handler(Arc::new(LoggingEventHandler)).await;

            info!(bot_id = %bot_id, state = %cli.state.display(), "Starting sync daemon");
            println!("Syncing {} as {}. Press Ctrl+C to stop.", cli.state.display(), bot_id);

            manager.start().await;
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to wait for shutdown signal");
            }
            info!("Shutdown signal received");
            manager.stop().await;
            portfolio.close().await;
        }
    }

    Ok(())
}

async fn print_status(portfolio: &PortfolioManager) {
    let allocations = portfolio.get_all_allocations().await;

    println!("\n=== Shared Portfolio ===");
    println!("Total Balance:   ${:.2}", portfolio.total_balance().await);
    println!("Unallocated:     ${:.2}", portfolio.available_balance().await);
    println!("Total Profit:    ${:.2}", portfolio.total_profit().await);
    println!("Exposure:        ${:.2}", portfolio.total_exposure().await);
    println!("Version:         {}", portfolio.version().await);

    if allocations.is_empty() {
        println!("\nNo bots registered. Use 'portfolioctl register' to add one.");
        return;
    }

    println!(
        "\n{:<20} {:<10} {:>12} {:>12} {:>12} {:>6} {:>12}",
        "BOT", "SYMBOL", "ALLOCATED", "AVAILABLE", "POSITION", "LEV", "REALIZED"
    );
    println!("{}", "-".repeat(90));

    let mut bots: Vec<_> = allocations.values().collect();
    bots.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
    for alloc in bots {
        println!(
            "{:<20} {:<10} {:>12.2} {:>12.2} {:>12.2} {:>5}x {:>12.2}",
            truncate(&alloc.bot_id, 20),
            truncate(&alloc.symbol, 10),
            alloc.allocated_balance,
            alloc.available_balance,
            alloc.current_position,
            alloc.leverage,
            alloc.realized_pnl
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
