//! Single logical websocket connection
//!
//! Each physical socket runs on its own task, tagged with a generation
//! number. Every event the task reports is checked against the current
//! generation, so a socket that was replaced can never move the state
//! machine, dispatch a frame or schedule a reconnect.
//!
//! State lives behind one mutex that is never held across an await and is
//! released before lifecycle listeners run.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::config::StreamConfig;
use crate::dispatch::MessageDispatcher;
use crate::error::{StreamError, StreamResult};
use crate::subscriptions::FrameSink;
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::heartbeat::LivenessMonitor;
use crate::transport::session::{
    ConnectionState, ConnectionStatus, LifecycleEvent, LifecycleListener, ListenerHandle,
    ListenerSet,
};
use crate::transport::wire::OutboundFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new socket completed its handshake
    Opened,
    /// Already open to the same endpoint; nothing was done
    AlreadyOpen,
}

// ============================================================================
// Shared state
// ============================================================================

struct Socket {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct Shared {
    state: ConnectionState,
    endpoint: Option<String>,
    generation: u64,
    socket: Option<Socket>,
    /// The current socket is being closed on request; no reconnect
    caller_closed: bool,
    policy: ReconnectPolicy,
    heartbeat: LivenessMonitor,
    reconnect_timer: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl Shared {
    fn transition(&mut self, to: ConnectionState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(
            from = %from,
            to = %to,
            reason,
            endpoint = self.endpoint.as_deref().unwrap_or(""),
            "session_transition"
        );
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            connected: self.state == ConnectionState::Open,
            reconnect_attempts: self.policy.attempts_used(),
            last_error: self.last_error.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
            debug!("pending reconnect cancelled");
        }
    }

    /// Drop the current socket so a new one can take its place.
    fn teardown(&mut self, events: &mut Vec<LifecycleEvent>) {
        self.heartbeat.stop();
        let Some(socket) = self.socket.take() else {
            return;
        };
        match self.state {
            ConnectionState::Connecting => socket.task.abort(),
            ConnectionState::Open => {
                let _ = socket.outbound.send(Message::Close(None));
                events.push(LifecycleEvent::Disconnected {
                    requested: true,
                    reason: Some("replaced by new connection".to_string()),
                });
            }
            _ => {
                let _ = socket.outbound.send(Message::Close(None));
            }
        }
    }
}

/// Sink bound to one physical socket; it goes dead with the socket.
struct SocketSink {
    outbound: mpsc::UnboundedSender<Message>,
}

impl FrameSink for SocketSink {
    fn send_frame(&self, frame: OutboundFrame) -> bool {
        self.outbound.send(Message::Text(frame.to_json())).is_ok()
    }
}

struct ConnectionInner {
    connect_timeout: Duration,
    dispatcher: Arc<MessageDispatcher>,
    shared: Mutex<Shared>,
    listeners: Arc<ListenerSet>,
    status_tx: watch::Sender<ConnectionStatus>,
}

// ============================================================================
// Public handle
// ============================================================================

#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<ConnectionInner>,
}

impl StreamConnection {
    pub fn new(config: &StreamConfig, dispatcher: Arc<MessageDispatcher>) -> Self {
        let shared = Shared {
            state: ConnectionState::Idle,
            endpoint: None,
            generation: 0,
            socket: None,
            caller_closed: false,
            policy: ReconnectPolicy::from_config(config),
            heartbeat: LivenessMonitor::new(config.heartbeat_interval()),
            reconnect_timer: None,
            last_error: None,
        };
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(ConnectionInner {
                connect_timeout: config.connect_timeout(),
                dispatcher,
                shared: Mutex::new(shared),
                listeners: Arc::new(ListenerSet::default()),
                status_tx,
            }),
        }
    }

    /// Open a socket to `endpoint`.
    ///
    /// A no-op when already open to the same endpoint. Otherwise any
    /// existing socket is closed as caller-requested before the new attempt
    /// starts. Resolves once the handshake completes; an attempt replaced
    /// before that resolves with `StreamError::Superseded`. A failed attempt
    /// still schedules reconnects in the background.
    pub async fn connect(&self, endpoint: &str) -> StreamResult<ConnectOutcome> {
        self.inner.connect_with(endpoint, false).await
    }

    /// Drop the current socket and reconnect to the same endpoint now,
    /// with a fresh reconnect budget.
    pub async fn reconnect(&self) -> StreamResult<ConnectOutcome> {
        let endpoint = self.inner.shared.lock().endpoint.clone();
        let Some(endpoint) = endpoint else {
            return Err(StreamError::InvalidEndpoint {
                url: String::new(),
                reason: "no endpoint to reconnect to".to_string(),
            });
        };
        self.inner.connect_with(&endpoint, true).await
    }

    /// Close on request. Never triggers a reconnect.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.shared.lock().state == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.inner.shared.lock().endpoint.clone()
    }

    /// Listeners run on the socket task, outside any connection lock.
    pub fn on_lifecycle<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let listener: LifecycleListener = Arc::new(listener);
        self.inner.listeners.add(listener)
    }

    /// Send `{type, ...payload, timestamp}`. False (and nothing sent) unless open.
    pub fn send(&self, msg_type: &str, payload: Value) -> bool {
        self.send_frame(OutboundFrame::new(msg_type, payload))
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.inner.dispatcher
    }

    /// For listeners that must not keep the connection alive.
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<StreamConnection> {
        self.inner.upgrade().map(|inner| StreamConnection { inner })
    }
}

impl FrameSink for StreamConnection {
    fn send_frame(&self, frame: OutboundFrame) -> bool {
        let shared = self.inner.shared.lock();
        if shared.state != ConnectionState::Open {
            debug!(msg_type = frame.msg_type(), state = %shared.state, "not open, frame dropped");
            return false;
        }
        match &shared.socket {
            Some(socket) => socket.outbound.send(Message::Text(frame.to_json())).is_ok(),
            None => false,
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

impl ConnectionInner {
    /// Run `f` under the state lock, publish the resulting status, then emit
    /// the collected lifecycle events with the lock released.
    fn update<R>(&self, f: impl FnOnce(&mut Shared, &mut Vec<LifecycleEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut shared = self.shared.lock();
            let result = f(&mut shared, &mut events);
            let status = shared.status();
            self.status_tx.send_if_modified(|current| {
                if *current == status {
                    false
                } else {
                    *current = status;
                    true
                }
            });
            result
        };
        for event in &events {
            self.listeners.emit(event);
        }
        result
    }

    async fn connect_with(self: &Arc<Self>, endpoint: &str, force: bool) -> StreamResult<ConnectOutcome> {
        validate_endpoint(endpoint)?;

        let opened = self.update(|s, events| {
            if !force && s.state == ConnectionState::Open && s.endpoint.as_deref() == Some(endpoint) {
                return None;
            }
            s.cancel_reconnect();
            s.policy.reset();
            s.teardown(events);
            let reason = if force { "reconnect requested" } else { "connect requested" };
            Some(self.start_socket(s, events, endpoint.to_string(), reason))
        });

        let Some(opened) = opened else {
            debug!(endpoint, "already open, connect ignored");
            return Ok(ConnectOutcome::AlreadyOpen);
        };

        match opened.await {
            Ok(Ok(())) => Ok(ConnectOutcome::Opened),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::Superseded),
        }
    }

    fn start_socket(
        self: &Arc<Self>,
        s: &mut Shared,
        events: &mut Vec<LifecycleEvent>,
        endpoint: String,
        reason: &str,
    ) -> oneshot::Receiver<StreamResult<()>> {
        s.generation += 1;
        s.caller_closed = false;
        s.heartbeat.stop();
        s.endpoint = Some(endpoint.clone());
        s.transition(ConnectionState::Connecting, reason);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).run_socket(
            s.generation,
            endpoint.clone(),
            outbound_rx,
            opened_tx,
        ));
        s.socket = Some(Socket { outbound, task });

        events.push(LifecycleEvent::Connecting { endpoint });
        opened_rx
    }

    async fn run_socket(
        self: Arc<Self>,
        generation: u64,
        endpoint: String,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        opened_tx: oneshot::Sender<StreamResult<()>>,
    ) {
        info!(endpoint = %endpoint, generation, "🔌 connecting");

        let attempt = tokio::time::timeout(self.connect_timeout, connect_async(endpoint.as_str())).await;
        let ws_stream = match attempt {
            Ok(Ok((ws_stream, _resp))) => ws_stream,
            Ok(Err(e)) => {
                let err = StreamError::Transport(format!("connect failed: {e}"));
                self.on_socket_closed(generation, Some(err.clone()), "connect failed");
                let _ = opened_tx.send(Err(err));
                return;
            }
            Err(_) => {
                let err = StreamError::Transport(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ));
                self.on_socket_closed(generation, Some(err.clone()), "connect timed out");
                let _ = opened_tx.send(Err(err));
                return;
            }
        };

        if !self.on_socket_open(generation) {
            let _ = opened_tx.send(Err(StreamError::Superseded));
            return;
        }
        let _ = opened_tx.send(Ok(()));

        let (mut write, mut read) = ws_stream.split();
        let (error, reason) = loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(Message::Close(frame)) => {
                        let _ = write.send(Message::Close(frame)).await;
                        break (None, "closed locally");
                    }
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            break (Some(StreamError::Transport(format!("send failed: {e}"))), "send failed");
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        break (None, "socket released");
                    }
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.on_text(generation, &text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.on_text(generation, &text),
                        Err(_) => warn!("dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server sent close");
                        break (None, "closed by server");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break (Some(StreamError::Transport(format!("read failed: {e}"))), "read failed");
                    }
                    None => break (None, "stream ended"),
                },
            }
        };

        self.on_socket_closed(generation, error, reason);
    }

    fn on_text(&self, generation: u64, text: &str) {
        let current = self.shared.lock().generation == generation;
        if !current {
            trace!(generation, "frame from replaced socket discarded");
            return;
        }
        self.dispatcher.dispatch_text(text);
    }

    fn on_socket_open(self: &Arc<Self>, generation: u64) -> bool {
        self.update(|s, events| {
            if s.generation != generation || s.caller_closed {
                debug!(generation, "handshake finished for replaced socket");
                return false;
            }
            let Some(socket) = s.socket.as_ref() else {
                return false;
            };
            let sink: Arc<dyn FrameSink> = Arc::new(SocketSink {
                outbound: socket.outbound.clone(),
            });

            s.policy.reset();
            s.last_error = None;
            s.transition(ConnectionState::Open, "handshake complete");
            s.heartbeat.start(sink);
            info!(endpoint = s.endpoint.as_deref().unwrap_or(""), "✅ connected");

            events.push(LifecycleEvent::Open {
                endpoint: s.endpoint.clone().unwrap_or_default(),
            });
            true
        })
    }

    fn on_socket_closed(self: &Arc<Self>, generation: u64, error: Option<StreamError>, reason: &str) {
        self.update(|s, events| {
            if s.generation != generation {
                debug!(generation, reason, "close of replaced socket ignored");
                return;
            }
            s.socket = None;
            s.heartbeat.stop();

            if let Some(err) = &error {
                warn!(error = %err, "⚠️ connection error");
                s.last_error = Some(err.to_string());
                events.push(LifecycleEvent::Error(err.to_string()));
            }

            let requested = s.caller_closed;
            s.transition(ConnectionState::Closed, reason);
            events.push(LifecycleEvent::Disconnected {
                requested,
                reason: Some(reason.to_string()),
            });

            if !requested {
                self.schedule_reconnect(s, events);
            }
        });
    }

    fn schedule_reconnect(self: &Arc<Self>, s: &mut Shared, events: &mut Vec<LifecycleEvent>) {
        s.cancel_reconnect();
        let Some((attempt, delay)) = s.policy.next_attempt() else {
            let attempts = s.policy.attempts_used();
            s.transition(ConnectionState::Failed, "reconnect attempts exhausted");
            error!(attempts, "❌ giving up on reconnect");
            events.push(LifecycleEvent::Failed { attempts });
            return;
        };

        s.transition(ConnectionState::ReconnectScheduled, "unrequested close");
        warn!(
            attempt,
            max_attempts = s.policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "🔄 reconnect scheduled"
        );

        let generation = s.generation;
        let inner = Arc::clone(self);
        s.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire_reconnect(generation);
        }));
        events.push(LifecycleEvent::ReconnectScheduled { attempt, delay });
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        self.update(|s, events| {
            if s.generation != generation || s.state != ConnectionState::ReconnectScheduled {
                return;
            }
            // Our own handle; dropping it detaches
            s.reconnect_timer = None;
            let Some(endpoint) = s.endpoint.clone() else {
                return;
            };
            // Background attempt: the result arrives through lifecycle events
            let _ = self.start_socket(s, events, endpoint, "reconnect timer fired");
        });
    }

    fn close(&self) {
        self.update(|s, events| {
            s.cancel_reconnect();
            s.heartbeat.stop();
            s.caller_closed = true;
            match s.state {
                ConnectionState::Open => {
                    if let Some(socket) = &s.socket {
                        let _ = socket.outbound.send(Message::Close(None));
                    }
                    s.transition(ConnectionState::Closing, "close requested");
                }
                ConnectionState::Connecting => {
                    if let Some(socket) = s.socket.take() {
                        socket.task.abort();
                    }
                    s.transition(ConnectionState::Closed, "close requested");
                    events.push(LifecycleEvent::Disconnected {
                        requested: true,
                        reason: None,
                    });
                }
                ConnectionState::ReconnectScheduled | ConnectionState::Failed => {
                    s.transition(ConnectionState::Closed, "close requested");
                    events.push(LifecycleEvent::Disconnected {
                        requested: true,
                        reason: None,
                    });
                }
                ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {}
            }
        });
    }
}

fn validate_endpoint(endpoint: &str) -> StreamResult<()> {
    let url = reqwest::Url::parse(endpoint).map_err(|e| StreamError::InvalidEndpoint {
        url: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(StreamError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
