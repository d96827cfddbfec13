//! Tradestream CLI
//!
//! Connects to the trading stream, subscribes the given symbols and logs
//! inbound traffic plus trade-collection changes until Ctrl-C.
//!
//! Usage:
//!   tradestream --symbols R_50,R_100 --interval 60 --user-id 17
//!
//! Environment: see `StreamConfig::from_env` (STREAM_* variables).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradestream::transport::{ConnectionState, LifecycleEvent};
use tradestream::{Identity, StreamClient, StreamConfig, SubscriptionOptions};

#[derive(Parser, Debug)]
#[command(name = "tradestream")]
#[command(about = "Real-time trading stream client")]
struct Args {
    /// Websocket base URL (overrides STREAM_WS_URL)
    #[arg(long)]
    ws_url: Option<String>,

    /// REST API base URL for trade listings (overrides STREAM_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Symbols to subscribe to (comma-separated)
    #[arg(long, env = "STREAM_SYMBOLS", default_value = "R_50")]
    symbols: String,

    /// Tick/candle interval sent with each subscription
    #[arg(long, env = "STREAM_INTERVAL")]
    interval: Option<String>,

    /// Authenticated user id appended to the endpoint
    #[arg(long, env = "STREAM_USER_ID")]
    user_id: Option<String>,

    /// Selected trading account id appended to the endpoint
    #[arg(long, env = "STREAM_ACCOUNT_ID")]
    account_id: Option<String>,

    /// Disable the periodic trade refresh loop
    #[arg(long)]
    no_refresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = StreamConfig::from_env();
    if let Some(url) = args.ws_url.clone() {
        config.ws_base_url = url;
    }
    if let Some(url) = args.api_url.clone() {
        config.api_base_url = url;
    }
    if args.no_refresh {
        config.refresh_interval_secs = 0;
    }

    info!("🚀 tradestream starting");
    info!("  ws: {}", config.ws_base_url);
    info!("  api: {}", config.api_base_url);

    let client = StreamClient::from_config(config.clone()).context("Failed to build stream client")?;

    let _frames = client.on_any_message(|_, frame| {
        info!(msg_type = frame.msg_type(), "📨 frame");
        Ok(())
    });
    let _lifecycle = client.on_lifecycle(|event| match event {
        LifecycleEvent::Failed { attempts } => {
            warn!(attempts, "stream gave up; restart or call reconnect")
        }
        other => info!(event = ?other, "lifecycle"),
    });

    let mut changes = client.trades().changes();
    let trades = client.trades().clone();
    let change_logger = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            info!(
                all = trades.all_trades().len(),
                open = trades.open_trades().len(),
                "📊 trades updated"
            );
        }
    });
    let refresh_loop = client.spawn_refresh_loop();

    let connected = match &args.user_id {
        Some(user_id) => {
            let mut identity = Identity::new(user_id.as_str());
            if let Some(account) = &args.account_id {
                identity = identity.with_account(account.as_str());
            }
            client.connect_as(&identity).await
        }
        None => client.connect(&config.ws_base_url).await,
    };
    if let Err(e) = connected {
        warn!(error = %e, "initial connect failed; retrying in background");
    }

    let options = match &args.interval {
        Some(interval) => SubscriptionOptions::with_interval(interval.as_str()),
        None => SubscriptionOptions::new(),
    };
    for symbol in args.symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        client.subscribe_tick(symbol, &options);
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("🛑 shutting down");

    client.close();
    let mut status = client.status_watch();
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state != ConnectionState::Closing),
    )
    .await;

    if let Some(handle) = refresh_loop {
        handle.abort();
    }
    change_logger.abort();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradestream=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also pick up a .env next to the manifest when run from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
