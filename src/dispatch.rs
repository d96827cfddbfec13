//! Inbound message fan-out
//!
//! Unrelated features register handlers on the same connection, so one
//! faulty handler (error or panic) must never stop delivery to the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, trace, warn};

use crate::error::StreamError;
use crate::transport::wire::{InboundFrame, WILDCARD};

/// Exact-type handlers get `(data, frame)`; wildcard handlers get
/// `(raw_message, frame)`.
pub type Handler = Arc<dyn Fn(&Value, &InboundFrame) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// De-registration capability returned by `on`/`on_any`.
///
/// Dropping it keeps the handler registered.
#[derive(Debug)]
pub struct Registration {
    id: HandlerId,
    dispatcher: Weak<MessageDispatcher>,
}

impl Registration {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Returns false if the handler was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.off(self.id),
            None => false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub frames: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub handler_errors: AtomicU64,
}

#[derive(Default)]
pub struct MessageDispatcher {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    stats: DispatchStats,
}

impl MessageDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register for one message type; `"*"` registers a wildcard handler.
    /// Handlers for the same type run in registration order.
    pub fn on<F>(self: &Arc<Self>, msg_type: &str, handler: F) -> Registration
    where
        F: Fn(&Value, &InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(msg_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Registration {
            id,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Register for every inbound message.
    pub fn on_any<F>(self: &Arc<Self>, handler: F) -> Registration
    where
        F: Fn(&Value, &InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(WILDCARD, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn handler_count(&self, msg_type: &str) -> usize {
        self.handlers.read().get(msg_type).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Parse a raw text frame and dispatch it. Malformed frames are logged
    /// and dropped.
    pub fn dispatch_text(&self, text: &str) -> DispatchReport {
        match InboundFrame::parse(text) {
            Ok(frame) => self.dispatch(&frame),
            Err(e) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, frame = %truncate(text, 200), "dropping malformed frame");
                DispatchReport::default()
            }
        }
    }

    pub fn dispatch(&self, frame: &InboundFrame) -> DispatchReport {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);

        // Snapshot so handlers can (de)register without deadlocking
        let (exact, wildcard) = {
            let handlers = self.handlers.read();
            let exact: Vec<Handler> = handlers
                .get(frame.msg_type())
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            let wildcard: Vec<Handler> = if frame.msg_type() == WILDCARD {
                Vec::new()
            } else {
                handlers
                    .get(WILDCARD)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default()
            };
            (exact, wildcard)
        };

        if exact.is_empty() && wildcard.is_empty() {
            trace!(msg_type = frame.msg_type(), "no handlers for message");
        }

        let mut report = DispatchReport::default();
        for handler in &exact {
            self.invoke(handler, frame.data(), frame, &mut report);
        }
        for handler in &wildcard {
            self.invoke(handler, frame.raw(), frame, &mut report);
        }
        report
    }

    fn invoke(
        &self,
        handler: &Handler,
        arg: &Value,
        frame: &InboundFrame,
        report: &mut DispatchReport,
    ) {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(arg, frame)));
        let reason = match outcome {
            Ok(Ok(())) => {
                report.delivered += 1;
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };

        report.failed += 1;
        self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
        let err = StreamError::Handler {
            message_type: frame.msg_type().to_string(),
            reason,
        };
        error!(msg_type = frame.msg_type(), error = %err, "message handler failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn frame(v: serde_json::Value) -> InboundFrame {
        InboundFrame::from_value(v).unwrap()
    }

    #[test]
    fn test_exact_handlers_in_registration_order() {
        let dispatcher = MessageDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            let _ = dispatcher.on("tick", move |data, _| {
                seen.lock().push(format!("{tag}:{}", data["quote"]));
                Ok(())
            });
        }

        let report = dispatcher.dispatch(&frame(json!({"type": "tick", "data": {"quote": 1.25}})));
        assert_eq!(report.delivered, 3);
        assert_eq!(
            *seen.lock(),
            vec!["first:1.25", "second:1.25", "third:1.25"]
        );
    }

    #[test]
    fn test_failing_handler_isolated() {
        let dispatcher = MessageDispatcher::new();
        let hits = Arc::new(Mutex::new(Vec::<Value>::new()));

        let _ = dispatcher.on("signal", |_, _| Err(anyhow::anyhow!("boom")));
        let _ = dispatcher.on("signal", |_, _| panic!("handler bug"));
        let sink = hits.clone();
        let _ = dispatcher.on("signal", move |data, _| {
            sink.lock().push(data.clone());
            Ok(())
        });

        let report = dispatcher.dispatch(&frame(json!({"type": "signal", "data": {"side": "up"}})));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(*hits.lock(), vec![json!({"side": "up"})]);
        assert_eq!(dispatcher.stats().handler_errors.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_wildcard_receives_full_message() {
        let dispatcher = MessageDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = dispatcher.on_any(move |raw, frame| {
            sink.lock().push((frame.msg_type().to_string(), raw.clone()));
            Ok(())
        });

        let msg = json!({"type": "bot_status", "data": {"running": true}, "seq": 4});
        dispatcher.dispatch(&frame(msg.clone()));
        dispatcher.dispatch(&frame(json!({"type": "server_added_type"})));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("bot_status".to_string(), msg));
        assert_eq!(seen[1].0, "server_added_type");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = MessageDispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let reg = dispatcher.on("tick", move |_, _| {
            c.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        dispatcher.dispatch(&frame(json!({"type": "tick"})));
        assert!(reg.unsubscribe());
        dispatcher.dispatch(&frame(json!({"type": "tick"})));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(dispatcher.handler_count("tick"), 0);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let dispatcher = MessageDispatcher::new();
        let inner = Arc::downgrade(&dispatcher);
        let _ = dispatcher.on("tick", move |_, _| {
            if let Some(d) = inner.upgrade() {
                let _ = d.on("candle", |_, _| Ok(()));
            }
            Ok(())
        });

        dispatcher.dispatch(&frame(json!({"type": "tick"})));
        assert_eq!(dispatcher.handler_count("candle"), 1);
    }

    #[test]
    fn test_malformed_text_dropped() {
        let dispatcher = MessageDispatcher::new();
        let report = dispatcher.dispatch_text("{not json");
        assert_eq!(report, DispatchReport::default());
        assert_eq!(dispatcher.stats().protocol_errors.load(Ordering::Relaxed), 1);
    }
}
