//! Ref-counted market data subscriptions
//!
//! Many consumers can ask for the same (symbol, options) stream. Only the
//! 0→1 and 1→0 transitions reach the wire; everything in between is local
//! bookkeeping. Wire delivery is best-effort: a dropped frame is recovered by
//! `resubscribe_all` after the next successful open.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::transport::wire::{OutboundFrame, SUBSCRIBE, UNSUBSCRIBE};

/// Anything that can hand a frame to the transport.
pub trait FrameSink: Send + Sync {
    /// True when the frame was handed to an open connection.
    fn send_frame(&self, frame: OutboundFrame) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionOptions {
    /// Candle/tick interval, e.g. `60` or `"1m"`
    pub interval: Option<Value>,
    /// Any further venue-specific options, sent alongside `interval`
    pub extra: BTreeMap<String, Value>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(interval: impl Into<Value>) -> Self {
        Self {
            interval: Some(interval.into()),
            extra: BTreeMap::new(),
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Canonical option-set key: `interval` plus sorted extras.
    /// `60` and `"60"` are the same interval.
    pub fn canonical(&self) -> String {
        let mut key = self
            .interval
            .as_ref()
            .map(canonical_value)
            .unwrap_or_default();
        if !self.extra.is_empty() {
            let extras: Vec<String> = self
                .extra
                .iter()
                .map(|(k, v)| format!("{k}={}", canonical_value(v)))
                .collect();
            key.push('|');
            key.push_str(&extras.join(","));
        }
        key
    }
}

fn canonical_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn subscription_key(symbol: &str, options: &SubscriptionOptions) -> String {
    format!("{}:{}", symbol.trim(), options.canonical())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEntry {
    pub key: String,
    pub symbol: String,
    pub options: SubscriptionOptions,
    /// Always >= 1 while the entry exists
    pub ref_count: u32,
}

impl SubscriptionEntry {
    fn frame(&self, msg_type: &str) -> OutboundFrame {
        let mut payload = Map::new();
        payload.insert("symbol".to_string(), Value::String(self.symbol.clone()));
        if let Some(interval) = &self.options.interval {
            payload.insert("interval".to_string(), interval.clone());
        }
        for (k, v) in &self.options.extra {
            payload.entry(k.clone()).or_insert_with(|| v.clone());
        }
        OutboundFrame::new(msg_type, Value::Object(payload))
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    // BTreeMap: replay order is stable across reconnects
    entries: Mutex<BTreeMap<String, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `(symbol, options)`.
    ///
    /// The entry is recorded even when the subscribe frame could not be
    /// sent; the return value only reports wire delivery.
    pub fn subscribe(&self, symbol: &str, options: &SubscriptionOptions, sink: &dyn FrameSink) -> bool {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            warn!("ignoring subscribe with empty symbol");
            return false;
        }
        let key = subscription_key(symbol, options);

        let frame = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.ref_count += 1;
                debug!(key = %key, refs = entry.ref_count, "subscription shared");
                return true;
            }
            let entry = SubscriptionEntry {
                key: key.clone(),
                symbol: symbol.to_string(),
                options: options.clone(),
                ref_count: 1,
            };
            let frame = entry.frame(SUBSCRIBE);
            entries.insert(key.clone(), entry);
            frame
        };

        let sent = sink.send_frame(frame);
        if sent {
            info!(key = %key, "📡 subscribed");
        } else {
            debug!(key = %key, "subscribe queued until next open");
        }
        sent
    }

    /// Drop a reference. The entry is removed locally on 1→0 whether or not
    /// the unsubscribe frame reaches the wire. False when nothing was
    /// subscribed under this key.
    pub fn unsubscribe(&self, symbol: &str, options: &SubscriptionOptions, sink: &dyn FrameSink) -> bool {
        let key = subscription_key(symbol, options);

        let frame = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                debug!(key = %key, "unsubscribe for unknown subscription");
                return false;
            };
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                debug!(key = %key, refs = entry.ref_count, "subscription released");
                return true;
            }
            match entries.remove(&key) {
                Some(entry) => entry.frame(UNSUBSCRIBE),
                None => return false,
            }
        };

        let sent = sink.send_frame(frame);
        info!(key = %key, sent, "unsubscribed");
        sent
    }

    /// Re-send `subscribe` for every active entry. Called once per
    /// successful open. Returns the number of frames handed to the sink.
    pub fn resubscribe_all(&self, sink: &dyn FrameSink) -> usize {
        let frames: Vec<OutboundFrame> = self
            .entries
            .lock()
            .values()
            .map(|entry| entry.frame(SUBSCRIBE))
            .collect();

        let total = frames.len();
        let sent = frames.into_iter().filter(|f| sink.send_frame(f.clone())).count();
        if total > 0 {
            info!(sent, total, "🔁 resubscribed after open");
        }
        sent
    }

    pub fn entries(&self) -> Vec<SubscriptionEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn ref_count(&self, symbol: &str, options: &SubscriptionOptions) -> u32 {
        self.entries
            .lock()
            .get(&subscription_key(symbol, options))
            .map_or(0, |e| e.ref_count)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingSink {
        open: AtomicBool,
        frames: Mutex<Vec<OutboundFrame>>,
    }

    impl RecordingSink {
        fn new(open: bool) -> Self {
            Self {
                open: AtomicBool::new(open),
                frames: Mutex::new(Vec::new()),
            }
        }

        fn types(&self) -> Vec<String> {
            self.frames
                .lock()
                .iter()
                .map(|f| f.msg_type().to_string())
                .collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: OutboundFrame) -> bool {
            if !self.open.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().push(frame);
            true
        }
    }

    #[test]
    fn test_ref_counted_wire_frames() {
        let registry = SubscriptionRegistry::new();
        let sink = RecordingSink::new(true);
        let opts = SubscriptionOptions::with_interval(60);

        for _ in 0..3 {
            assert!(registry.subscribe("R_50", &opts, &sink));
        }
        assert_eq!(registry.ref_count("R_50", &opts), 3);
        for _ in 0..3 {
            assert!(registry.unsubscribe("R_50", &opts, &sink));
        }

        assert_eq!(sink.types(), vec!["subscribe", "unsubscribe"]);
        assert!(registry.is_empty());
        assert!(!registry.unsubscribe("R_50", &opts, &sink));
    }

    #[test]
    fn test_subscribe_frame_payload() {
        let registry = SubscriptionRegistry::new();
        let sink = RecordingSink::new(true);
        registry.subscribe("R_50", &SubscriptionOptions::with_interval(60), &sink);

        let frames = sink.frames.lock();
        assert_eq!(frames[0].payload()["symbol"], "R_50");
        assert_eq!(frames[0].payload()["interval"], 60);
    }

    #[test]
    fn test_interval_canonicalization() {
        let a = SubscriptionOptions::with_interval(60);
        let b = SubscriptionOptions::with_interval(" 60 ");
        assert_eq!(subscription_key("R_50", &a), subscription_key("R_50", &b));
        assert_eq!(subscription_key("R_50", &SubscriptionOptions::new()), "R_50:");

        let with_extra = SubscriptionOptions::with_interval("1m").option("style", "candles");
        assert_eq!(subscription_key("R_50", &with_extra), "R_50:1m|style=candles");
    }

    #[test]
    fn test_entry_kept_when_send_fails() {
        let registry = SubscriptionRegistry::new();
        let closed = RecordingSink::new(false);
        let opts = SubscriptionOptions::with_interval(60);

        assert!(!registry.subscribe("R_50", &opts, &closed));
        assert_eq!(registry.len(), 1);

        let open = RecordingSink::new(true);
        assert_eq!(registry.resubscribe_all(&open), 1);
        assert_eq!(open.types(), vec!["subscribe"]);
    }

    #[test]
    fn test_removal_not_rolled_back_on_failed_send() {
        let registry = SubscriptionRegistry::new();
        let sink = RecordingSink::new(true);
        let opts = SubscriptionOptions::new();
        registry.subscribe("R_100", &opts, &sink);

        sink.open.store(false, Ordering::SeqCst);
        assert!(!registry.unsubscribe("R_100", &opts, &sink));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resubscribe_replays_every_entry() {
        let registry = SubscriptionRegistry::new();
        let sink = RecordingSink::new(true);
        registry.subscribe("R_50", &SubscriptionOptions::with_interval(60), &sink);
        registry.subscribe("R_50", &SubscriptionOptions::with_interval(60), &sink);
        registry.subscribe("R_75", &SubscriptionOptions::with_interval(300), &sink);

        let replay = RecordingSink::new(true);
        assert_eq!(registry.resubscribe_all(&replay), 2);
        let symbols: Vec<Value> = replay
            .frames
            .lock()
            .iter()
            .map(|f| f.payload()["symbol"].clone())
            .collect();
        assert_eq!(symbols, vec![Value::from("R_50"), Value::from("R_75")]);
    }

    #[test]
    fn test_empty_symbol_ignored() {
        let registry = SubscriptionRegistry::new();
        let sink = RecordingSink::new(true);
        assert!(!registry.subscribe("  ", &SubscriptionOptions::new(), &sink));
        assert!(registry.is_empty());
    }
}
