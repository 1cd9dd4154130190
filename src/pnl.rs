// ===============================
// src/pnl.rs
// ===============================
//
// Realized PnL in exact decimals. Pure functions, no shared state.
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use thiserror::Error;

use crate::domain::{Side, TradeEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PnlError {
    #[error("symbol mismatch: {buy} vs {sell}")]
    SymbolMismatch { buy: String, sell: String },
    #[error("expected a BUY and a SELL leg")]
    SideMismatch,
    #[error("pnl out of decimal range")]
    Overflow,
}

/// `(sell - buy) * quantity`.
///
/// Panics if the result does not fit a `Decimal`; untrusted input goes through
/// `checked_pnl`.
pub fn calculate_pnl(buy_price: Decimal, sell_price: Decimal, quantity: i64) -> Decimal {
    (sell_price - buy_price) * Decimal::from(quantity)
}

pub fn checked_pnl(buy_price: Decimal, sell_price: Decimal, quantity: i64) -> Option<Decimal> {
    sell_price.checked_sub(buy_price)?.checked_mul(Decimal::from(quantity))
}

/// PnL of a closed pair, over the quantity both legs share.
pub fn realized_for_pair(buy: &TradeEvent, sell: &TradeEvent) -> Result<Decimal, PnlError> {
    if buy.side != Side::Buy || sell.side != Side::Sell {
        return Err(PnlError::SideMismatch);
    }
    if buy.symbol != sell.symbol {
        return Err(PnlError::SymbolMismatch { buy: buy.symbol.clone(), sell: sell.symbol.clone() });
    }
    checked_pnl(buy.price, sell.price, buy.quantity.min(sell.quantity)).ok_or(PnlError::Overflow)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundTripSummary {
    pub by_symbol: HashMap<String, Decimal>,
    pub total: Decimal,
    pub matched_qty: i64,
}

/// FIFO-pair buys against sells per symbol (either may come first) and sum realized PnL.
pub fn match_round_trips(trades: &[TradeEvent]) -> Result<RoundTripSummary, PnlError> {
    // open lots per symbol: (side, remaining qty, price)
    let mut open: HashMap<&str, VecDeque<(Side, i64, Decimal)>> = HashMap::new();
    let mut out = RoundTripSummary::default();

    for t in trades {
        let lots = open.entry(t.symbol.as_str()).or_default();
        let mut remaining = t.quantity;
        while remaining > 0 {
            match lots.front_mut() {
                Some((side, qty, px)) if *side != t.side => {
                    let closed = remaining.min(*qty);
                    let pnl = match t.side {
                        Side::Sell => checked_pnl(*px, t.price, closed),
                        Side::Buy => checked_pnl(t.price, *px, closed),
                    }
                    .ok_or(PnlError::Overflow)?;
                    let by_symbol = out.by_symbol.entry(t.symbol.clone()).or_default();
                    *by_symbol = by_symbol.checked_add(pnl).ok_or(PnlError::Overflow)?;
                    out.total = out.total.checked_add(pnl).ok_or(PnlError::Overflow)?;
                    out.matched_qty = out.matched_qty.checked_add(closed).ok_or(PnlError::Overflow)?;
                    *qty -= closed;
                    remaining -= closed;
                    if *qty == 0 {
                        lots.pop_front();
                    }
                }
                _ => {
                    lots.push_back((t.side, remaining, t.price));
                    remaining = 0;
                }
            }
        }
    }
    Ok(out)
}
