//! Trade state: canonical records, normalization and reconciliation

pub mod listing;
pub mod model;
pub mod normalize;
pub mod reconciler;

pub use listing::{RestTradeListing, TradeListing};
pub use model::{Contract, RawTrade, TradeRecord, TradeStatus, TradeType};
pub use normalize::normalize;
pub use reconciler::{Applied, TradeReconciler};
