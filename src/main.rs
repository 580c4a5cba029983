//! TIERFLOW: tiered settlement queue, portfolio reconciler and order engine.
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the stores the chosen role needs, serves the ops API and runs the
//! periodic aggregator and reconciler cycles with graceful shutdown.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use tierflow::collaborators::{HttpSettlementExecutor, HttpTierAllocator, TierAllocator};
use tierflow::config::AppConfig;
use tierflow::dashboard::{self, routes::OpsState};
use tierflow::engine::aggregator::Aggregator;
use tierflow::engine::intake::Intake;
use tierflow::engine::orders::{OrderEngine, RandomSource, StdRandom};
use tierflow::engine::reconciler::Reconciler;
use tierflow::market::{HttpMarketFeed, MarketFeed, SharedTierBook};
use tierflow::storage::{self, AssetStore, PortfolioStore, QueueStore, StoreKind};

#[derive(Debug, Parser)]
#[command(name = "tierflow", version, about = "Tiered settlement and consistency engine")]
struct Cli {
    /// Which components this process hosts.
    #[arg(value_enum, default_value_t = Role::All)]
    role: Role,

    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Intake plus the settlement aggregator.
    Aggregator,
    /// The portfolio reconciler.
    Reconciler,
    /// The order engine and tier status.
    Orders,
    /// Everything in one process.
    All,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Aggregator => "aggregator",
            Role::Reconciler => "reconciler",
            Role::Orders => "orders",
            Role::All => "all",
        }
    }

    fn hosts(self, component: Role) -> bool {
        self == Role::All || self == component
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;

    init_logging();

    info!(
        role = cli.role.as_str(),
        config = %cli.config,
        ops_port = cfg.ops.port,
        "TIERFLOW starting up"
    );

    let book = SharedTierBook::new(cfg.tiers.values());
    let mut ops = OpsState::new(cli.role.as_str(), book.clone());
    let db = &cfg.database;

    // -- Stores ------------------------------------------------------------

    // Intake checks withdrawals against the ledger, so both roles need it.
    let (queue, portfolios) =
        if cli.role.hosts(Role::Aggregator) || cli.role.hosts(Role::Reconciler) {
            let queue =
                storage::connect(&db.queue_url, db.max_connections, StoreKind::Queue).await?;
            let portfolios =
                storage::connect(&db.portfolio_url, db.max_connections, StoreKind::Portfolio)
                    .await?;
            (
                Some(QueueStore::new(queue)),
                Some(PortfolioStore::new(portfolios)),
            )
        } else {
            (None, None)
        };
    ops.queue = queue.clone();

    // -- Aggregator and intake ---------------------------------------------

    let aggregator = match (&queue, &portfolios, cli.role.hosts(Role::Aggregator)) {
        (Some(queue), Some(portfolios), true) => {
            let token = match &cfg.settlement.token_env {
                Some(env) => Some(SecretString::new(AppConfig::resolve_env(env)?)),
                None => None,
            };
            let executor = HttpSettlementExecutor::new(
                cfg.settlement.url.clone(),
                Duration::from_secs(cfg.settlement.timeout_secs),
                token,
            )?;

            let allocator: Option<Arc<dyn TierAllocator>> = match &cfg.allocation.url {
                Some(url) => Some(Arc::new(HttpTierAllocator::new(
                    url.clone(),
                    Duration::from_secs(cfg.allocation.timeout_secs),
                )?)),
                None => {
                    info!(split = ?cfg.allocation.default_split, "No allocation service; using default split");
                    None
                }
            };
            ops.intake = Some(
                Intake::new(queue.clone(), allocator, cfg.allocation.default_split)
                    .with_balance_check(portfolios.clone()),
            );

            info!(
                settlement_url = %cfg.settlement.url,
                batch_size = cfg.aggregator.batch_size,
                interval_secs = cfg.aggregator.interval_secs,
                "Aggregator ready"
            );
            Some(Arc::new(Aggregator::new(
                queue.clone(),
                Arc::new(executor),
                cfg.aggregator.settings(),
            )))
        }
        _ => None,
    };

    // -- Reconciler ----------------------------------------------------------

    let reconciler = match (&queue, &portfolios, cli.role.hosts(Role::Reconciler)) {
        (Some(queue), Some(portfolios), true) => {
            let feed: Option<Arc<dyn MarketFeed>> = match &cfg.reconciler.market_feed_url {
                Some(url) => Some(Arc::new(HttpMarketFeed::new(
                    url,
                    Duration::from_secs(cfg.reconciler.market_feed_timeout_secs),
                )?)),
                None => None,
            };
            info!(
                pull_limit = cfg.reconciler.pull_limit,
                interval_secs = cfg.reconciler.interval_secs,
                market_feed = cfg.reconciler.market_feed_url.as_deref().unwrap_or("local"),
                "Reconciler ready"
            );
            let reconciler = Arc::new(Reconciler::new(
                queue.clone(),
                portfolios.clone(),
                book.clone(),
                feed,
                cfg.reconciler.settings(),
            ));
            ops.reconciler = Some(reconciler.clone());
            Some(reconciler)
        }
        _ => None,
    };

    // -- Order engine ------------------------------------------------------

    if cli.role.hosts(Role::Orders) {
        let pool = storage::connect(&db.assets_url, db.max_connections, StoreKind::Assets).await?;
        let assets = AssetStore::new(pool);

        let inventory = assets.market_values().await?;
        if !inventory.is_zero() {
            book.set_market_values(inventory).await;
            info!(
                tier1 = %inventory.tier1,
                tier2 = %inventory.tier2,
                tier3 = %inventory.tier3,
                "Market values loaded from asset inventory"
            );
        }

        let random: Arc<dyn RandomSource> = match cfg.orders.seed {
            Some(seed) => {
                warn!(seed, "Order engine using a fixed RNG seed");
                Arc::new(StdRandom::seeded(seed))
            }
            None => Arc::new(StdRandom::from_entropy()),
        };
        ops.orders = Some(OrderEngine::new(assets, book.clone(), random));
    }

    // -- Ops API -------------------------------------------------------------

    let server = if cfg.ops.enabled {
        Some(dashboard::spawn_ops_server(Arc::new(ops), cfg.ops.port).await?)
    } else {
        None
    };

    // -- Main loop -------------------------------------------------------

    let mut aggregator_tick = ticker(cfg.aggregator.interval_secs);
    let mut reconciler_tick = ticker(cfg.reconciler.interval_secs);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Entering main loop. Press Ctrl+C to stop.");

    // Each tick spawns its cycle; an overlapping cycle returns Busy and logs.
    loop {
        tokio::select! {
            _ = aggregator_tick.tick(), if aggregator.is_some() => {
                if let Some(aggregator) = aggregator.clone() {
                    tokio::spawn(async move {
                        if let Err(e) = aggregator.run_cycle().await {
                            error!(error = %e, "Aggregator cycle failed; continuing to next");
                        }
                    });
                }
            }
            _ = reconciler_tick.tick(), if reconciler.is_some() => {
                if let Some(reconciler) = reconciler.clone() {
                    tokio::spawn(async move {
                        if let Err(e) = reconciler.run_cycle().await {
                            error!(error = %e, "Reconcile pass failed; continuing to next");
                        }
                    });
                }
            }
            result = &mut shutdown => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    if let Some(server) = server {
        server.abort();
    }
    info!(role = cli.role.as_str(), "TIERFLOW shut down cleanly.");

    Ok(())
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tierflow=info"));

    let json_logging = std::env::var("TIERFLOW_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
