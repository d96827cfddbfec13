//! Authoritative trade listings (REST)
//!
//! The reconciler only needs two reads; everything else about the trades API
//! belongs to the dashboard.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::model::RawTrade;

#[async_trait]
pub trait TradeListing: Send + Sync {
    /// Most recent trades, newest first, at most `limit`
    async fn list_trades(&self, limit: usize) -> Result<Vec<RawTrade>>;

    /// Trades the backend still considers open
    async fn list_open_trades(&self) -> Result<Vec<RawTrade>>;
}

/// Either a bare array or `{ "trades": [...] }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TradesResponse {
    Bare(Vec<RawTrade>),
    Wrapped { trades: Vec<RawTrade> },
}

impl TradesResponse {
    fn into_trades(self) -> Vec<RawTrade> {
        match self {
            Self::Bare(trades) | Self::Wrapped { trades } => trades,
        }
    }
}

#[derive(Clone)]
pub struct RestTradeListing {
    client: Client,
    base_url: String,
}

impl RestTradeListing {
    pub fn new(base_url: &str, bearer_token: Option<&str>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = bearer_token {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token)
                    .parse()
                    .context("Invalid API token")?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .default_headers(headers)
            .build()
            .context("Failed to build trade listing client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_trades(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<RawTrade>> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET {} {}: {}", path, status, text));
        }

        let trades = resp
            .json::<TradesResponse>()
            .await
            .with_context(|| format!("Failed to parse {path} response"))?
            .into_trades();

        debug!(path, count = trades.len(), "fetched trades");
        Ok(trades)
    }
}

#[async_trait]
impl TradeListing for RestTradeListing {
    async fn list_trades(&self, limit: usize) -> Result<Vec<RawTrade>> {
        self.get_trades("/trades", &[("limit", limit.to_string())])
            .await
    }

    async fn list_open_trades(&self) -> Result<Vec<RawTrade>> {
        self.get_trades("/trades/open", &[]).await
    }
}
