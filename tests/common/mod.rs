//! In-process trading venue for integration tests.
//!
//! Accepts websocket connections on an ephemeral port, records every inbound
//! JSON frame and request URI, and lets a test push frames to the newest
//! connection or drop all connections without a close handshake.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use tradestream::trades::{RawTrade, TradeListing};

pub const WAIT: Duration = Duration::from_secs(5);

enum VenueCommand {
    Push(String),
    Drop,
}

#[derive(Default)]
struct VenueState {
    frames: Mutex<Vec<Value>>,
    uris: Mutex<Vec<String>>,
    peers: Mutex<Vec<mpsc::UnboundedSender<VenueCommand>>>,
    accepted: AtomicUsize,
}

pub struct MockVenue {
    addr: SocketAddr,
    state: Arc<VenueState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockVenue {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(VenueState::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let state = accept_state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_socket(state, stream).await {
                                    tracing::debug!(error = %err, "venue socket ended with error");
                                }
                            });
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> Vec<String> {
        self.state.uris.lock().clone()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().clone()
    }

    pub fn frames_of_type(&self, msg_type: &str) -> Vec<Value> {
        self.state
            .frames
            .lock()
            .iter()
            .filter(|f| f["type"] == msg_type)
            .cloned()
            .collect()
    }

    /// Send to the most recent connection.
    pub fn push(&self, frame: Value) {
        if let Some(peer) = self.state.peers.lock().last() {
            let _ = peer.send(VenueCommand::Push(frame.to_string()));
        }
    }

    /// Drop every live connection without a close handshake.
    pub fn drop_connections(&self) {
        for peer in self.state.peers.lock().drain(..) {
            let _ = peer.send(VenueCommand::Drop);
        }
    }
}

impl Drop for MockVenue {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn handle_socket(state: Arc<VenueState>, stream: TcpStream) -> Result<()> {
    let uri = Arc::new(Mutex::new(String::new()));
    let captured = uri.clone();
    let ws_stream = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *captured.lock() = req.uri().to_string();
        Ok(resp)
    })
    .await?;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    state.uris.lock().push(uri.lock().clone());
    state.peers.lock().push(cmd_tx);
    state.accepted.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws_stream.split();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(VenueCommand::Push(text)) => sink.send(Message::Text(text)).await?,
                Some(VenueCommand::Drop) | None => break,
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        state.frames.lock().push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
        }
    }
    Ok(())
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Listing service whose answers a test can change between refreshes.
#[derive(Default)]
pub struct ScriptedListing {
    pub trades: Mutex<Vec<RawTrade>>,
    pub calls: AtomicUsize,
}

impl ScriptedListing {
    pub fn set(&self, trades: Vec<Value>) {
        *self.trades.lock() = trades
            .into_iter()
            .map(|v| serde_json::from_value(v).expect("valid trade json"))
            .collect();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TradeListing for ScriptedListing {
    async fn list_trades(&self, _limit: usize) -> Result<Vec<RawTrade>> {
        let trades = self.trades.lock().clone();
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(trades)
    }

    async fn list_open_trades(&self) -> Result<Vec<RawTrade>> {
        let open = self
            .trades
            .lock()
            .iter()
            .filter(|t| t.status.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("open")))
            .cloned()
            .collect();
        Ok(open)
    }
}
