// ===============================
// src/codec.rs (payload -> TradeEvent)
// ===============================
//
// Two accepted payload shapes:
//   delimited : "<SIDE> <SYMBOL> <QUANTITY> <PRICE>"   e.g. "BUY AAPL 100 187.25"
//   tagged    : {"side":"SELL","symbol":"AAPL","quantity":5,"price":"187.30","id":"X-1"}
// Anything else is a poison message.
//
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{Side, TradeEvent};
use crate::stream::StreamMessage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoisonReason {
    #[error("missing payload")]
    MissingPayload,
    #[error("empty payload")]
    Empty,
    #[error("expected 4 fields, got {0}")]
    FieldCount(usize),
    #[error("unknown side {0:?}")]
    Side(String),
    #[error("invalid symbol {0:?}")]
    Symbol(String),
    #[error("invalid quantity {0:?}")]
    Quantity(String),
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(i64),
    #[error("invalid price {0:?}")]
    Price(String),
    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),
    #[error("quantity {0} above limit")]
    QuantityTooLarge(i64),
    #[error("notional of {quantity} x {price} out of range")]
    NotionalOverflow { quantity: i64, price: Decimal },
    #[error("malformed json: {0}")]
    Json(String),
}

/// Largest accepted quantity per trade.
pub const MAX_QUANTITY: i64 = 1_000_000_000_000;

/// Largest accepted `quantity * price`. Keeps ledger sums well inside `Decimal` range.
pub fn max_notional() -> Decimal { Decimal::from(1_000_000_000_000_000_000i64) }

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaggedTrade {
    side: String,
    symbol: String,
    quantity: i64,
    price: Decimal,
    #[serde(default)]
    id: Option<String>,
}

fn parse_side(s: &str) -> Result<Side, PoisonReason> {
    match s.trim().to_ascii_uppercase().as_str() {
        "BUY" | "B" => Ok(Side::Buy),
        "SELL" | "S" => Ok(Side::Sell),
        _ => Err(PoisonReason::Side(s.to_string())),
    }
}

fn parse_symbol(s: &str) -> Result<String, PoisonReason> {
    let ok = !s.is_empty()
        && s.len() <= 32
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '_' | '-'));
    if ok { Ok(s.to_ascii_uppercase()) } else { Err(PoisonReason::Symbol(s.to_string())) }
}

fn check_quantity(q: i64) -> Result<i64, PoisonReason> {
    if q <= 0 {
        return Err(PoisonReason::NonPositiveQuantity(q));
    }
    if q > MAX_QUANTITY {
        return Err(PoisonReason::QuantityTooLarge(q));
    }
    Ok(q)
}

fn check_notional(quantity: i64, price: Decimal) -> Result<(), PoisonReason> {
    match price.checked_mul(Decimal::from(quantity)) {
        Some(n) if n <= max_notional() => Ok(()),
        _ => Err(PoisonReason::NotionalOverflow { quantity, price }),
    }
}

fn check_price(p: Decimal) -> Result<Decimal, PoisonReason> {
    if p > Decimal::ZERO { Ok(p) } else { Err(PoisonReason::NonPositivePrice(p)) }
}

/// Parse one stream message. The trade id is the tagged `id`, else the record key,
/// else `<topic>-<partition>-<offset>`.
pub fn decode(msg: &StreamMessage) -> Result<TradeEvent, PoisonReason> {
    let payload = msg.payload.as_deref().ok_or(PoisonReason::MissingPayload)?.trim();
    if payload.is_empty() {
        return Err(PoisonReason::Empty);
    }

    let (side, symbol, quantity, price, tagged_id) = if payload.starts_with('{') {
        let t: TaggedTrade =
            serde_json::from_str(payload).map_err(|e| PoisonReason::Json(e.to_string()))?;
        (parse_side(&t.side)?, parse_symbol(&t.symbol)?, check_quantity(t.quantity)?, check_price(t.price)?, t.id)
    } else {
        let fields: Vec<&str> = payload.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(PoisonReason::FieldCount(fields.len()));
        }
        let qty = fields[2]
            .parse::<i64>()
            .map_err(|_| PoisonReason::Quantity(fields[2].to_string()))?;
        let px = fields[3]
            .parse::<Decimal>()
            .map_err(|_| PoisonReason::Price(fields[3].to_string()))?;
        (parse_side(fields[0])?, parse_symbol(fields[1])?, check_quantity(qty)?, check_price(px)?, None)
    };

    check_notional(quantity, price)?;

    let id = tagged_id
        .filter(|s| !s.trim().is_empty())
        .or_else(|| msg.key.clone().filter(|k| !k.is_empty()))
        .unwrap_or_else(|| format!("{}-{}-{}", msg.topic, msg.partition, msg.offset));

    Ok(TradeEvent { id, side, symbol, quantity, price, partition: msg.partition, sequence: msg.offset })
}

/// Delimited encoding, used by the mock producer.
pub fn encode(side: Side, symbol: &str, quantity: i64, price: Decimal) -> String {
    format!("{} {} {} {}", side.as_str(), symbol, quantity, price)
}
