//! Normalization and field-level merge of trade records.
//!
//! Backend event shapes changed over time; both generations must resolve to
//! the same canonical `TradeRecord`. Normalization is idempotent:
//! `normalize(RawTrade::from(&normalize(x))) == normalize(x)`.

use chrono::{DateTime, Utc};

use super::model::{Contract, RawTrade, TradeRecord, TradeStatus, TradeType};
use crate::error::{StreamError, StreamResult};

pub fn normalize(raw: &RawTrade) -> StreamResult<TradeRecord> {
    normalize_at(raw, Utc::now())
}

/// `now` only fills timestamps the raw trade does not carry.
pub fn normalize_at(raw: &RawTrade, now: DateTime<Utc>) -> StreamResult<TradeRecord> {
    let id = raw
        .id
        .clone()
        .ok_or_else(|| StreamError::Protocol("trade without id".into()))?;

    let trade_type = resolve_trade_type(raw);
    let contract = resolve_contract(raw, trade_type);

    let status = raw
        .status
        .as_deref()
        .and_then(TradeStatus::parse)
        .unwrap_or(TradeStatus::Open);

    let stake = raw.stake.unwrap_or(0.0);
    let profit = raw.profit.or_else(|| derive_profit(status, stake, raw.payout));

    let created_at = raw.created_at.or(raw.updated_at).unwrap_or(now);
    let updated_at = raw.updated_at.unwrap_or(created_at);

    Ok(TradeRecord {
        id,
        status,
        symbol: raw.symbol.clone().unwrap_or_default(),
        trade_type,
        contract,
        stake,
        payout: raw.payout,
        profit,
        created_at,
        updated_at,
    })
}

/// Merge an incremental event into the record it refers to.
///
/// Incoming non-null fields win, `created_at` is kept from the existing
/// record, `updated_at` becomes `now`. The status is the exception: an
/// unrecognised value keeps the current one, and once terminal only another
/// terminal status can replace it.
pub fn merge_at(
    existing: &TradeRecord,
    incoming: &RawTrade,
    now: DateTime<Utc>,
) -> StreamResult<TradeRecord> {
    let mut merged = RawTrade::from(existing);
    overlay(&mut merged, incoming);
    merged.updated_at = Some(now);

    let mut record = normalize_at(&merged, now)?;
    record.created_at = existing.created_at;
    Ok(record)
}

/// Record for an id seen for the first time in an incremental event.
pub fn provisional_at(incoming: &RawTrade, now: DateTime<Utc>) -> StreamResult<TradeRecord> {
    let mut raw = incoming.clone();
    raw.created_at = incoming.created_at.or(Some(now));
    raw.updated_at = Some(now);
    normalize_at(&raw, now)
}

/// Explicit field if known, else `CALL_PUT` when a contract hint says
/// CALL/PUT, else `RISE_FALL`.
fn resolve_trade_type(raw: &RawTrade) -> TradeType {
    if let Some(tt) = raw.trade_type.as_deref().and_then(TradeType::parse) {
        return tt;
    }
    let hinted = [raw.contract_type.as_deref(), raw.contract.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(Contract::parse)
        .any(|c| c.family() == TradeType::CallPut);
    if hinted {
        TradeType::CallPut
    } else {
        TradeType::RiseFall
    }
}

fn resolve_contract(raw: &RawTrade, trade_type: TradeType) -> Contract {
    if let Some(c) = raw.contract.as_deref().and_then(Contract::parse) {
        if c.family() == trade_type {
            return c;
        }
    }

    let direction_hint = raw.direction.as_deref().and_then(parse_direction);
    let contract_type_hint = raw.contract_type.as_deref().and_then(Contract::parse);
    let explicit_hint = raw.contract.as_deref().and_then(Contract::parse);

    // RISE_FALL reads `direction` first, CALL_PUT reads `contract_type` first
    let hint = match trade_type {
        TradeType::RiseFall => direction_hint.or(contract_type_hint).or(explicit_hint),
        TradeType::CallPut => contract_type_hint.or(direction_hint).or(explicit_hint),
    };

    hint.map(|c| c.in_family(trade_type))
        .unwrap_or_else(|| trade_type.default_contract())
}

fn parse_direction(s: &str) -> Option<Contract> {
    match s.trim().to_ascii_uppercase().as_str() {
        "RISE" | "UP" | "HIGHER" | "BUY" | "LONG" | "CALL" => Some(Contract::Rise),
        "FALL" | "DOWN" | "LOWER" | "SELL" | "SHORT" | "PUT" => Some(Contract::Fall),
        _ => None,
    }
}

fn derive_profit(status: TradeStatus, stake: f64, payout: Option<f64>) -> Option<f64> {
    if !status.is_terminal() {
        return None;
    }
    match (status, payout) {
        (_, Some(payout)) => Some(payout - stake),
        (TradeStatus::Lost, None) => Some(-stake),
        _ => None,
    }
}

/// Apply `incoming` on top of `base`.
///
/// A contract hint from the other family (say `contract_type: PUT` on a
/// record that defaulted to RISE_FALL) replaces the inferred type and
/// contract, so an event and its refinement converge in either order.
fn overlay(base: &mut RawTrade, incoming: &RawTrade) {
    let incoming_family = [incoming.contract.as_deref(), incoming.contract_type.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(Contract::parse)
        .map(Contract::family)
        .next();
    let has_direction_hint = incoming.contract.is_some()
        || incoming.contract_type.is_some()
        || incoming.direction.is_some();

    if incoming.trade_type.is_none() {
        let base_family = base.trade_type.as_deref().and_then(TradeType::parse);
        if let (Some(new), Some(old)) = (incoming_family, base_family) {
            if new != old {
                base.trade_type = None;
            }
        }
    }
    if has_direction_hint && incoming.contract.is_none() {
        base.contract = None;
    }

    macro_rules! take {
        ($($field:ident),*) => {
            $(
                if incoming.$field.is_some() {
                    base.$field = incoming.$field.clone();
                }
            )*
        };
    }
    take!(
        id,
        symbol,
        trade_type,
        contract,
        contract_type,
        direction,
        stake,
        payout,
        profit
    );

    // unknown statuses are ignored and a terminal status is never reopened
    let incoming_status = incoming.status.as_deref().and_then(TradeStatus::parse);
    let base_settled = base
        .status
        .as_deref()
        .and_then(TradeStatus::parse)
        .is_some_and(TradeStatus::is_terminal);
    if let Some(status) = incoming_status {
        if !base_settled || status.is_terminal() {
            base.status = Some(status.as_str().to_string());
        }
    }

    // a terminal event without profit must not inherit a stale derived value
    let settles = incoming_status.is_some_and(TradeStatus::is_terminal);
    if incoming.profit.is_none() && (incoming.payout.is_some() || settles) {
        base.profit = None;
    }
    if base.created_at.is_none() {
        base.created_at = incoming.created_at;
    }
}
