//! Trade state reconciler
//!
//! Keeps two client-side caches (all trades, open trades) in step with the
//! backend: authoritative snapshots come from the listing service, sparse
//! and possibly out-of-order `trade_status` events are merged in between.
//! Both paths go through the same normalize/merge functions, so a refresh
//! racing an event converges no matter which lands last.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listing::TradeListing;
use super::model::{RawTrade, TradeRecord};
use super::normalize::{merge_at, normalize, provisional_at};
use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};

#[derive(Debug, Default, Clone)]
struct TradeCollections {
    /// Newest insertion first; updates keep their slot
    all: Vec<TradeRecord>,
    /// Only `OPEN` records
    open: Vec<TradeRecord>,
}

impl TradeCollections {
    /// Merge a record that is newer than this snapshot into it.
    fn lay_over(&mut self, local: &TradeRecord) {
        let all_idx = self.all.iter().position(|t| t.id == local.id);
        let open_idx = self.open.iter().position(|t| t.id == local.id);
        let base = all_idx
            .map(|i| &self.all[i])
            .or_else(|| open_idx.map(|i| &self.open[i]));

        let record = match base {
            Some(base) => {
                let mut merged = merge_at(base, &RawTrade::from(local), local.updated_at)
                    .unwrap_or_else(|_| local.clone());
                merged.created_at = local.created_at.min(base.created_at);
                merged
            }
            None => local.clone(),
        };

        match all_idx {
            Some(i) => self.all[i] = record.clone(),
            None => self.all.insert(0, record.clone()),
        }
        match (record.is_open(), open_idx) {
            (true, Some(i)) => self.open[i] = record,
            (true, None) => self.open.insert(0, record),
            (false, Some(i)) => {
                self.open.remove(i);
            }
            (false, None) => {}
        }
    }
}

/// What `apply_incoming` did with an event
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub record: TradeRecord,
    /// First time this id was seen
    pub inserted: bool,
    /// The merged status is terminal; the record left the open set
    pub settled: bool,
}

pub struct TradeReconciler {
    listing: Arc<dyn TradeListing>,
    all_cap: usize,
    open_cap: usize,
    refresh_debounce: Duration,
    state: RwLock<TradeCollections>,
    revision: watch::Sender<u64>,
    refresh_timer: Mutex<Option<JoinHandle<()>>>,
}

impl TradeReconciler {
    pub fn new(
        listing: Arc<dyn TradeListing>,
        all_cap: usize,
        open_cap: usize,
        refresh_debounce: Duration,
    ) -> Arc<Self> {
        let (revision, _) = watch::channel(0u64);
        Arc::new(Self {
            listing,
            all_cap: all_cap.max(1),
            open_cap: open_cap.max(1),
            refresh_debounce,
            state: RwLock::new(TradeCollections::default()),
            revision,
            refresh_timer: Mutex::new(None),
        })
    }

    pub fn from_config(listing: Arc<dyn TradeListing>, config: &StreamConfig) -> Arc<Self> {
        Self::new(
            listing,
            config.all_trades_cap,
            config.open_trades_cap,
            config.refresh_debounce(),
        )
    }

    pub fn all_trades(&self) -> Vec<TradeRecord> {
        self.state.read().all.clone()
    }

    pub fn open_trades(&self) -> Vec<TradeRecord> {
        self.state.read().open.clone()
    }

    pub fn get(&self, id: &str) -> Option<TradeRecord> {
        let state = self.state.read();
        state
            .all
            .iter()
            .chain(state.open.iter())
            .find(|t| t.id == id)
            .cloned()
    }

    /// Revision counter bumped after every change to either collection
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Replace both collections from the listing service.
    ///
    /// Records merged from events while the fetch was in flight are laid
    /// over the snapshot instead of being discarded. On failure the current
    /// collections are left untouched.
    pub async fn refresh(&self) -> StreamResult<()> {
        let started = Utc::now();
        let (all_raw, open_raw) = tokio::try_join!(
            self.listing.list_trades(self.all_cap),
            self.listing.list_open_trades()
        )
        .map_err(|e| {
            warn!(error = %e, "trade refresh failed");
            StreamError::Listing(format!("{e:#}"))
        })?;

        let mut snapshot = TradeCollections {
            all: normalize_batch(&all_raw, self.all_cap, |_| true),
            open: normalize_batch(&open_raw, self.open_cap, TradeRecord::is_open),
        };

        let (all_len, open_len, kept) = {
            let mut state = self.state.write();
            let mut seen = HashSet::new();
            let newer: Vec<TradeRecord> = state
                .all
                .iter()
                .chain(state.open.iter())
                .filter(|t| t.updated_at > started && seen.insert(t.id.clone()))
                .cloned()
                .collect();

            // reversed so prepended records keep their relative order
            for local in newer.iter().rev() {
                snapshot.lay_over(local);
            }
            snapshot.all.truncate(self.all_cap);
            snapshot.open.truncate(self.open_cap);

            *state = snapshot;
            (state.all.len(), state.open.len(), newer.len())
        };
        self.bump();

        debug!(all = all_len, open = open_len, kept, "trades refreshed");
        Ok(())
    }

    /// Merge one push event into the collections.
    ///
    /// A terminal status removes the record from the open set and schedules
    /// one debounced `refresh()` to pick up settlement fields the event did
    /// not carry.
    pub fn apply_incoming(self: &Arc<Self>, event: &RawTrade) -> StreamResult<Applied> {
        let Some(id) = event.id.as_deref() else {
            return Err(StreamError::Protocol("trade event without id".into()));
        };
        let now = Utc::now();

        let applied = {
            let mut state = self.state.write();

            let all_idx = state.all.iter().position(|t| t.id == id);
            let open_idx = state.open.iter().position(|t| t.id == id);
            let existing = all_idx
                .map(|i| &state.all[i])
                .or_else(|| open_idx.map(|i| &state.open[i]));

            let (record, inserted) = match existing {
                Some(existing) => (merge_at(existing, event, now)?, false),
                None => (provisional_at(event, now)?, true),
            };

            match all_idx {
                Some(i) => state.all[i] = record.clone(),
                None => {
                    state.all.insert(0, record.clone());
                    state.all.truncate(self.all_cap);
                }
            }

            let settled = record.status.is_terminal();
            match (settled, open_idx) {
                (true, Some(i)) => {
                    state.open.remove(i);
                }
                (true, None) => {}
                (false, Some(i)) => state.open[i] = record.clone(),
                (false, None) => {
                    state.open.insert(0, record.clone());
                    state.open.truncate(self.open_cap);
                }
            }

            Applied {
                record,
                inserted,
                settled,
            }
        };
        self.bump();

        if applied.settled {
            info!(
                trade_id = %applied.record.id,
                status = %applied.record.status,
                payout = ?applied.record.payout,
                "trade settled"
            );
            self.schedule_refresh();
        } else {
            debug!(trade_id = %applied.record.id, inserted = applied.inserted, "trade updated");
        }

        Ok(applied)
    }

    /// Debounced refresh: a pending one is replaced, so a burst of terminal
    /// events costs a single fetch.
    fn schedule_refresh(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, skipping debounced refresh");
            return;
        };

        let mut timer = self.refresh_timer.lock();
        if let Some(prev) = timer.take() {
            prev.abort();
        }

        let this = Arc::clone(self);
        let delay = self.refresh_debounce;
        *timer = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // failure is already logged inside refresh()
            let _ = this.refresh().await;
        }));
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }
}

impl Drop for TradeReconciler {
    fn drop(&mut self) {
        if let Some(timer) = self.refresh_timer.get_mut().take() {
            timer.abort();
        }
    }
}

fn normalize_batch(
    raw: &[RawTrade],
    cap: usize,
    keep: impl Fn(&TradeRecord) -> bool,
) -> Vec<TradeRecord> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut out = Vec::with_capacity(raw.len().min(cap));
    for trade in raw {
        match normalize(trade) {
            Ok(record) => {
                if keep(&record) && seen.insert(record.id.clone()) {
                    out.push(record);
                }
            }
            Err(e) => warn!(error = %e, "dropping unusable trade from listing"),
        }
        if out.len() >= cap {
            break;
        }
    }
    out
}
