//! Tradestream client library
//!
//! Client-side real-time layer for a trading dashboard: one logical
//! websocket connection with automatic reconnect, ref-counted market data
//! subscriptions, typed message fan-out and a reconciled view of the
//! user's trades.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod subscriptions;
pub mod trades;
pub mod transport;

pub use client::StreamClient;
pub use config::{BackoffKind, StreamConfig};
pub use error::{StreamError, StreamResult};
pub use identity::{Endpoint, Identity};
pub use subscriptions::SubscriptionOptions;
