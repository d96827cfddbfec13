//! Trade records: the loose shape events arrive in and the canonical
//! shape the dashboard consumes.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Won,
    Lost,
    Failed,
    Cancelled,
    Rejected,
    Error,
}

impl TradeStatus {
    pub const TERMINAL: [TradeStatus; 6] = [
        Self::Won,
        Self::Lost,
        Self::Failed,
        Self::Cancelled,
        Self::Rejected,
        Self::Error,
    ];

    /// No further transitions happen after a terminal status.
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Case-insensitive; `None` for values this client does not know.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "WON" => Some(Self::Won),
            "LOST" => Some(Self::Lost),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            "REJECTED" => Some(Self::Rejected),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType {
    RiseFall,
    CallPut,
}

impl TradeType {
    pub fn parse(s: &str) -> Option<Self> {
        let norm: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match norm.as_str() {
            "RISEFALL" => Some(Self::RiseFall),
            "CALLPUT" => Some(Self::CallPut),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RiseFall => "RISE_FALL",
            Self::CallPut => "CALL_PUT",
        }
    }

    /// The "up" contract used when nothing hints at a direction
    pub fn default_contract(self) -> Contract {
        match self {
            Self::RiseFall => Contract::Rise,
            Self::CallPut => Contract::Call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Contract {
    Rise,
    Fall,
    Call,
    Put,
}

impl Contract {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RISE" => Some(Self::Rise),
            "FALL" => Some(Self::Fall),
            "CALL" => Some(Self::Call),
            "PUT" => Some(Self::Put),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rise => "RISE",
            Self::Fall => "FALL",
            Self::Call => "CALL",
            Self::Put => "PUT",
        }
    }

    /// The trade type this contract belongs to
    pub fn family(self) -> TradeType {
        match self {
            Self::Rise | Self::Fall => TradeType::RiseFall,
            Self::Call | Self::Put => TradeType::CallPut,
        }
    }

    pub fn is_up(self) -> bool {
        matches!(self, Self::Rise | Self::Call)
    }

    /// Same direction expressed in the other family's vocabulary
    pub fn in_family(self, trade_type: TradeType) -> Contract {
        match (trade_type, self.is_up()) {
            (TradeType::RiseFall, true) => Self::Rise,
            (TradeType::RiseFall, false) => Self::Fall,
            (TradeType::CallPut, true) => Self::Call,
            (TradeType::CallPut, false) => Self::Put,
        }
    }
}

/// Canonical trade shape. `contract` always belongs to `trade_type`'s family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub status: TradeStatus,
    pub symbol: String,
    pub trade_type: TradeType,
    pub contract: Contract,
    pub stake: f64,
    pub payout: Option<f64>,
    pub profit: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

/// Trade fields as they arrive from push events or listing endpoints.
///
/// Every field is optional. Legacy and current field names are both
/// accepted (`trade_id`/`id`/`contract_id`, `contract_type`/`contractType`,
/// ...), ids may be numbers or strings and timestamps may be RFC 3339 or
/// epoch seconds/milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct RawTrade {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stake: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<Value> for RawTrade {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(obj) = value else {
            return Err("trade payload is not an object".to_string());
        };
        Ok(Self {
            id: first(&obj, &["trade_id", "id", "contract_id", "tradeId"]).and_then(as_id),
            status: first(&obj, &["status"]).and_then(as_string),
            symbol: first(&obj, &["symbol", "underlying"]).and_then(as_string),
            trade_type: first(&obj, &["trade_type", "tradeType"]).and_then(as_string),
            contract: first(&obj, &["contract"]).and_then(as_string),
            contract_type: first(&obj, &["contract_type", "contractType"]).and_then(as_string),
            direction: first(&obj, &["direction"]).and_then(as_string),
            stake: first(&obj, &["stake", "amount"]).and_then(as_f64),
            payout: first(&obj, &["payout"]).and_then(as_f64),
            profit: first(&obj, &["profit"]).and_then(as_f64),
            created_at: first(&obj, &["created_at", "createdAt"]).and_then(as_timestamp),
            updated_at: first(&obj, &["updated_at", "updatedAt"]).and_then(as_timestamp),
        })
    }
}

impl From<&TradeRecord> for RawTrade {
    fn from(record: &TradeRecord) -> Self {
        Self {
            id: Some(record.id.clone()),
            status: Some(record.status.as_str().to_string()),
            symbol: Some(record.symbol.clone()),
            trade_type: Some(record.trade_type.as_str().to_string()),
            contract: Some(record.contract.as_str().to_string()),
            contract_type: None,
            direction: None,
            stake: Some(record.stake),
            payout: record.payout,
            profit: record.profit,
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
        }
    }
}

/// First non-null value among `keys`
fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn as_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

/// Values above 1e12 are treated as milliseconds.
fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() >= 1_000_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    s.parse::<i64>().ok().and_then(from_epoch)
}
