//! `StreamClient`: the one object the rest of the application holds.
//!
//! Construct once and clone freely; every clone shares the same socket,
//! subscriptions and trade caches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::dispatch::{MessageDispatcher, Registration};
use crate::error::StreamResult;
use crate::identity::{spawn_identity_watcher, Endpoint, Identity};
use crate::subscriptions::{SubscriptionEntry, SubscriptionOptions, SubscriptionRegistry};
use crate::trades::{RestTradeListing, TradeListing, TradeReconciler};
use crate::transport::wire::{InboundFrame, InboundMessage, TRADE_STATUS};
use crate::transport::{
    ConnectOutcome, ConnectionStatus, LifecycleEvent, ListenerHandle, StreamConnection,
};

#[derive(Clone)]
pub struct StreamClient {
    config: Arc<StreamConfig>,
    connection: StreamConnection,
    subscriptions: Arc<SubscriptionRegistry>,
    trades: Arc<TradeReconciler>,
}

impl StreamClient {
    /// Build with the REST listing service from `config.api_base_url`.
    pub fn from_config(config: StreamConfig) -> Result<Self> {
        let listing = RestTradeListing::new(&config.api_base_url, config.api_token.as_deref())?;
        Ok(Self::new(config, Arc::new(listing)))
    }

    pub fn new(config: StreamConfig, listing: Arc<dyn TradeListing>) -> Self {
        let dispatcher = MessageDispatcher::new();
        let connection = StreamConnection::new(&config, Arc::clone(&dispatcher));
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let trades = TradeReconciler::from_config(listing, &config);

        let client = Self {
            config: Arc::new(config),
            connection,
            subscriptions,
            trades,
        };
        client.wire_trade_events(&dispatcher);
        client.wire_open_hook();
        client
    }

    /// `trade_status` pushes feed the reconciler.
    fn wire_trade_events(&self, dispatcher: &Arc<MessageDispatcher>) {
        let trades = Arc::clone(&self.trades);
        let _ = dispatcher.on(TRADE_STATUS, move |_, frame| {
            let InboundMessage::TradeStatus(raw) = frame.message()? else {
                return Ok(());
            };
            let applied = trades.apply_incoming(&raw)?;
            debug!(
                trade_id = %applied.record.id,
                status = %applied.record.status,
                inserted = applied.inserted,
                settled = applied.settled,
                "trade event applied"
            );
            Ok(())
        });
    }

    /// Every successful open replays subscriptions, then refreshes trades.
    fn wire_open_hook(&self) {
        let connection = self.connection.downgrade();
        let subscriptions = Arc::clone(&self.subscriptions);
        let trades = Arc::clone(&self.trades);
        let _ = self.connection.on_lifecycle(move |event| {
            let LifecycleEvent::Open { .. } = event else {
                return;
            };
            if let Some(connection) = connection.upgrade() {
                subscriptions.resubscribe_all(&connection);
            }
            let trades = Arc::clone(&trades);
            tokio::spawn(async move {
                // Failure is already logged; the next open or tick retries
                let _ = trades.refresh().await;
            });
        });
    }

    // ========================================================================
    // Connection
    // ========================================================================

    pub async fn connect(&self, endpoint: &str) -> StreamResult<ConnectOutcome> {
        self.connection.connect(endpoint).await
    }

    /// Connect to `ws_base_url` with the identity's query parameters.
    pub async fn connect_as(&self, identity: &Identity) -> StreamResult<ConnectOutcome> {
        let endpoint = Endpoint::build(&self.config.ws_base_url, identity)?;
        self.connection.connect(&endpoint).await
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub async fn reconnect(&self) -> StreamResult<ConnectOutcome> {
        self.connection.reconnect().await
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status_watch()
    }

    pub fn on_lifecycle<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.connection.on_lifecycle(listener)
    }

    pub fn connection(&self) -> &StreamConnection {
        &self.connection
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// False when the connection is not open; nothing is queued.
    pub fn send_message(&self, msg_type: &str, payload: Value) -> bool {
        self.connection.send(msg_type, payload)
    }

    pub fn on_message<F>(&self, msg_type: &str, handler: F) -> Registration
    where
        F: Fn(&Value, &InboundFrame) -> Result<()> + Send + Sync + 'static,
    {
        self.connection.dispatcher().on(msg_type, handler)
    }

    pub fn on_any_message<F>(&self, handler: F) -> Registration
    where
        F: Fn(&Value, &InboundFrame) -> Result<()> + Send + Sync + 'static,
    {
        self.connection.dispatcher().on_any(handler)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe_tick(&self, symbol: &str, options: &SubscriptionOptions) -> bool {
        self.subscriptions.subscribe(symbol, options, &self.connection)
    }

    pub fn unsubscribe_tick(&self, symbol: &str, options: &SubscriptionOptions) -> bool {
        self.subscriptions.unsubscribe(symbol, options, &self.connection)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionEntry> {
        self.subscriptions.entries()
    }

    // ========================================================================
    // Trades
    // ========================================================================

    pub fn trades(&self) -> &Arc<TradeReconciler> {
        &self.trades
    }

    /// Refresh both trade collections every `refresh_interval_secs`,
    /// starting immediately. `None` when the interval is 0.
    pub fn spawn_refresh_loop(&self) -> Option<JoinHandle<()>> {
        if self.config.refresh_interval_secs == 0 {
            debug!("periodic trade refresh disabled");
            return None;
        }
        let period = Duration::from_secs(self.config.refresh_interval_secs);
        let trades = Arc::clone(&self.trades);
        info!(every_secs = period.as_secs(), "⏱️ trade refresh loop started");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = trades.refresh().await {
                    warn!(error = %e, "periodic trade refresh failed");
                }
            }
        }))
    }

    /// Follow an identity provider; see `identity::spawn_identity_watcher`.
    pub fn watch_identity(&self, identity_rx: watch::Receiver<Option<Identity>>) -> JoinHandle<()> {
        spawn_identity_watcher(
            self.connection.clone(),
            self.config.ws_base_url.clone(),
            identity_rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trades::{RawTrade, TradeStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TradeListing for CountingListing {
        async fn list_trades(&self, _limit: usize) -> Result<Vec<RawTrade>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn list_open_trades(&self) -> Result<Vec<RawTrade>> {
            Ok(Vec::new())
        }
    }

    fn client(config: StreamConfig) -> (StreamClient, Arc<CountingListing>) {
        let listing = Arc::new(CountingListing::default());
        (StreamClient::new(config, listing.clone()), listing)
    }

    #[tokio::test]
    async fn test_trade_status_frame_reaches_reconciler() {
        let (client, _) = client(StreamConfig::default());
        let dispatcher = client.connection().dispatcher();

        dispatcher.dispatch_text(
            &json!({"type": "trade_status", "data": {"trade_id": 7, "status": "OPEN", "symbol": "R_50", "stake": 5}})
                .to_string(),
        );

        let open = client.trades().open_trades();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "7");
        assert_eq!(open[0].status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn test_subscribe_while_closed_is_kept() {
        let (client, _) = client(StreamConfig::default());
        assert!(!client.subscribe_tick("R_50", &SubscriptionOptions::with_interval(60)));
        assert_eq!(client.active_subscriptions().len(), 1);
        assert!(!client.send_message("ping", Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_ticks() {
        let config = StreamConfig {
            refresh_interval_secs: 30,
            ..StreamConfig::default()
        };
        let (client, listing) = client(config);
        let handle = client.spawn_refresh_loop().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(listing.calls.load(Ordering::SeqCst), 3);
        handle.abort();
    }

    #[tokio::test]
    async fn test_refresh_loop_disabled() {
        let config = StreamConfig {
            refresh_interval_secs: 0,
            ..StreamConfig::default()
        };
        let (client, _) = client(config);
        assert!(client.spawn_refresh_loop().is_none());
    }
}
