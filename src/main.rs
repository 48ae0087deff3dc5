use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration};

use paperbot::api::DexScreenerClient;
use paperbot::config::AppConfig;
use paperbot::context::AppContext;
use paperbot::execution::ExecutionEngine;
use paperbot::market::{spawn_asset_watch_loop, FileAssetSource, MarketSynchronizer};
use paperbot::oracle::{spawn_refresh_loop, PriceOracle};
use paperbot::persistence::{spawn_writer, RedisPersistence};
use paperbot::pnl;

const EQUITY_SAMPLE_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "paperbot", about = "Simulated-trading ledger with live market marks")]
struct Args {
    /// Redis connection URL (overrides config)
    #[arg(long)]
    redis_url: Option<String>,

    /// Path to the resolved-asset file (overrides config)
    #[arg(long)]
    asset_file: Option<String>,

    /// Session starting balance in SOL (overrides config)
    #[arg(long)]
    starting_balance: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut config = AppConfig::load()?;
    if let Some(url) = args.redis_url {
        config.redis_url = url;
    }
    if let Some(path) = args.asset_file {
        config.asset_file = path;
    }
    if let Some(balance) = args.starting_balance {
        config.starting_balance = balance;
    }

    tracing::info!("Paperbot starting - simulated trading ledger");
    tracing::info!("  Starting balance: {} SOL", config.starting_balance);
    tracing::info!("  Asset file: {}", config.asset_file);

    // Persistence is optional: without Redis the session just lives in
    // memory for its lifetime.
    let mut persistence = connect_to_redis(&config.redis_url).await;
    let loaded_document = match persistence.as_mut() {
        Some(store) => match store.load().await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Failed to load persisted state ({}), starting fresh", e);
                None
            }
        },
        None => None,
    };

    let oracle = Arc::new(PriceOracle::with_default_sources());
    let market = MarketSynchronizer::new(DexScreenerClient::new());

    // Writer is wired up against the context's state below; the closure is
    // installed once the context exists.
    let (ctx, writer_task) = {
        let market = market.clone();
        let oracle = oracle.clone();

        // Two-phase: build context with a disconnected handle, then swap in
        // the real writer fed by the context's own snapshot.
        let provisional = match loaded_document {
            Some(doc) => AppContext::from_document(
                doc,
                market,
                oracle,
                paperbot::persistence::PersistHandle::disconnected(),
            ),
            None => AppContext::new(
                market,
                oracle,
                paperbot::persistence::PersistHandle::disconnected(),
                config.starting_balance,
            ),
        };

        let snapshot_ctx = provisional.clone();
        let (handle, task) = spawn_writer(persistence, move || snapshot_ctx.snapshot_document());
        let ctx = AppContext {
            persist: handle,
            ..provisional
        };
        (ctx, task)
    };

    let engine = ExecutionEngine::new(ctx.clone());

    tracing::info!("Spawning independent loops...");

    // Loop 1: active asset watch (250 ms)
    let asset_task = spawn_asset_watch_loop(
        ctx.market.clone(),
        Arc::new(FileAssetSource::new(&config.asset_file)),
    );

    // Loop 2: settlement rate refresh (5 min, first tick immediate)
    let oracle_task = spawn_refresh_loop(ctx.oracle.clone());

    // Loop 3: accepted ticks -> position marks
    let mark_task = {
        let engine = engine.clone();
        let mut ticks = ctx.market.subscribe();
        tokio::spawn(async move {
            loop {
                match ticks.recv().await {
                    Ok(event) => engine.apply_mark(&event.asset_id, event.price, event.valuation),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "mark consumer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Loop 4: equity curve sampler (30 s)
    let equity_task = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(EQUITY_SAMPLE_SECS));
            loop {
                ticker.tick().await;
                let equity = ctx.equity_sol();
                ctx.session
                    .lock()
                    .expect("session lock poisoned")
                    .record_equity(chrono::Utc::now(), equity);
                ctx.persist.debounced();
            }
        })
    };

    // Loop 5: command input from the UI stand-in
    let command_task = {
        let ctx = ctx.clone();
        let engine = engine.clone();
        let starting_balance = config.starting_balance;
        tokio::spawn(async move {
            command_loop(ctx, engine, starting_balance).await;
        })
    };

    tracing::info!("All loops running. Commands: buy <sol> | sell [pct] | status | reset | quit");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = command_task => {
            tracing::info!("Command loop ended, shutting down...");
        }
        result = writer_task => {
            tracing::error!("Persistence writer exited: {:?}", result);
        }
    }

    asset_task.abort();
    oracle_task.abort();
    mark_task.abort();
    equity_task.abort();

    tracing::info!("Paperbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paperbot=info".into()),
        )
        .init();
}

async fn connect_to_redis(redis_url: &str) -> Option<RedisPersistence> {
    match RedisPersistence::new(redis_url).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Redis ({}), continuing without persistence",
                e
            );
            None
        }
    }
}

async fn command_loop(ctx: AppContext, engine: ExecutionEngine, starting_balance: f64) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("buy") => {
                let Some(amount) = parts.next().and_then(|s| s.parse::<f64>().ok()) else {
                    println!("usage: buy <sol>");
                    continue;
                };
                match engine.buy(amount) {
                    Ok(fill) => println!(
                        "bought {:.4} units @ ${}",
                        fill.quantity_delta, fill.fill_price
                    ),
                    Err(e) => println!("buy rejected: {}", e),
                }
            }
            Some("sell") => {
                let percent = parts.next().and_then(|s| s.parse::<f64>().ok());
                match engine.sell(percent) {
                    Ok(fill) => println!(
                        "sold {:.4} units @ ${} (realized ${:.2})",
                        -fill.quantity_delta,
                        fill.fill_price,
                        fill.realized_pnl_delta.unwrap_or(0.0)
                    ),
                    Err(e) => println!("sell rejected: {}", e),
                }
            }
            Some("status") => print_status(&ctx),
            Some("reset") => {
                let balance = parts
                    .next()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(starting_balance);
                ctx.reset_session(balance);
                println!("session reset to {} SOL", balance);
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {}", other),
            None => {}
        }
    }
}

fn print_status(ctx: &AppContext) {
    let session = ctx.session_stats();
    let rate = ctx.oracle.rate();
    let unrealized_usd = ctx.unrealized_usd();

    println!("balance: {:.4} SOL", session.balance);
    println!(
        "realized: {:.4} SOL | unrealized: {:.4} SOL (${:.2})",
        session.realized_sol,
        pnl::usd_to_sol(unrealized_usd, rate),
        unrealized_usd
    );
    println!(
        "streaks: {}W/{}L | discipline: {:.0}",
        session.win_streak, session.loss_streak, session.discipline_score
    );

    match ctx.market.active_asset() {
        Some(active) => {
            let snapshot = ctx.market.snapshot();
            let stale = if snapshot.is_stale(chrono::Utc::now()) {
                " (stale)"
            } else {
                ""
            };
            println!(
                "active: {} [{}] price={:?} mcap={:?}{}",
                active.symbol, active.asset_id, snapshot.price, snapshot.valuation, stale
            );
        }
        None => println!("active: none"),
    }

    for (asset_id, position) in ctx.positions() {
        if position.is_flat() {
            continue;
        }
        println!(
            "  {} qty={:.4} basis=${:.2} avg=${:.6} realized=${:.2}",
            asset_id,
            position.quantity,
            position.cost_basis,
            position.avg_cost(),
            position.realized_pnl
        );
    }
}
