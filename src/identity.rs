//! Identity-derived endpoints
//!
//! The websocket URL carries the authenticated user and the selected
//! account. A change of either means a different logical stream, so the
//! watcher reconnects; losing the identity closes the connection.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::transport::StreamConnection;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub account_id: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            account_id: None,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

pub struct Endpoint;

impl Endpoint {
    /// `base?user_id=..&account_id=..`, keeping any query already on `base`.
    /// `account_id` is left out when absent or blank.
    pub fn build(base: &str, identity: &Identity) -> StreamResult<String> {
        let mut url = reqwest::Url::parse(base).map_err(|e| StreamError::InvalidEndpoint {
            url: base.to_string(),
            reason: e.to_string(),
        })?;
        if identity.user_id.trim().is_empty() {
            return Err(StreamError::InvalidEndpoint {
                url: base.to_string(),
                reason: "empty user id".to_string(),
            });
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", identity.user_id.trim());
            if let Some(account) = identity.account_id.as_deref().map(str::trim) {
                if !account.is_empty() {
                    query.append_pair("account_id", account);
                }
            }
        }
        Ok(url.to_string())
    }
}

/// Follow the identity provider: connect on the first identity, reconnect
/// when it changes, close when it goes away. Ends when the provider drops
/// its sender.
pub fn spawn_identity_watcher(
    connection: StreamConnection,
    base: String,
    mut identity_rx: watch::Receiver<Option<Identity>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let identity = identity_rx.borrow_and_update().clone();
            apply_identity(&connection, &base, identity).await;
            if identity_rx.changed().await.is_err() {
                debug!("identity provider dropped, watcher exiting");
                break;
            }
        }
    })
}

async fn apply_identity(connection: &StreamConnection, base: &str, identity: Option<Identity>) {
    let Some(identity) = identity else {
        info!("👤 identity cleared, closing stream");
        connection.close();
        return;
    };

    let endpoint = match Endpoint::build(base, &identity) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(error = %e, user_id = %identity.user_id, "cannot build endpoint");
            return;
        }
    };

    info!(
        user_id = %identity.user_id,
        account_id = identity.account_id.as_deref().unwrap_or("-"),
        "👤 identity changed"
    );
    // Failures keep retrying in the background via the reconnect policy
    if let Err(e) = connection.connect(&endpoint).await {
        warn!(error = %e, "connect for new identity failed");
    }
}
