// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Immutable trade record produced by the stream. `sequence` is the stream offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub id: String,
    pub side: Side,
    pub symbol: String,
    pub quantity: i64,
    pub price: Decimal,
    pub partition: u32,
    pub sequence: u64,
}

impl TradeEvent {
    /// `price * quantity`, `None` when it does not fit a `Decimal`.
    pub fn notional(&self) -> Option<Decimal> { self.price.checked_mul(Decimal::from(self.quantity)) }
}

/// Owned exclusively by the trade cache; callers only ever see copies of `event`.
#[derive(Debug, Clone)]
pub struct CacheEntry { pub event: TradeEvent, pub inserted_at: DateTime<Utc> }

/// Last successfully processed offset of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition { pub partition: u32, pub offset: u64 }

// Error sink / recorder events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonRecord {
    pub ts_ns: i128,
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub payload: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Poison(PoisonRecord),
    TaskRejected { ts_ns: i128, task: String, reason: String },
    Fatal { ts_ns: i128, partition: Option<u32>, reason: String },
}

// Ledger structures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position { pub qty: i64, pub avg_cost: Decimal, pub realized_pnl: Decimal }

pub fn now_ns() -> i128 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}
