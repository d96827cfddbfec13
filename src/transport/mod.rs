//! Websocket transport: wire framing, the connection state machine,
//! reconnect policy and heartbeat.

pub mod backoff;
pub mod connection;
pub mod heartbeat;
pub mod session;
pub mod wire;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectOutcome, StreamConnection, WeakConnection};
pub use heartbeat::LivenessMonitor;
pub use session::{ConnectionState, ConnectionStatus, LifecycleEvent, ListenerHandle};
pub use wire::{InboundFrame, InboundMessage, OutboundFrame};
