// ===============================
// src/ledger.rs (secondary ledger: positions & realized PnL)
// ===============================

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Position, Side, TradeEvent};
use crate::pnl::checked_pnl;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("position of {symbol} out of range after trade {trade_id}")]
    Overflow { symbol: String, trade_id: String },
}

#[derive(Debug, Default)]
pub struct Ledger {
    positions: HashMap<String, Position>,
    // highest sequence applied per partition (redelivery guard)
    applied: HashMap<u32, u64>,
    // ids already compensated; pruned once the trade leaves the cache
    reversed: HashSet<String>,
}

impl Ledger {
    pub fn new() -> Self { Self::default() }

    /// Apply a cached trade. `Ok(false)` when the event was already applied (redelivery).
    /// On error nothing changes.
    pub fn apply(&mut self, ev: &TradeEvent) -> Result<bool, LedgerError> {
        if let Some(&hw) = self.applied.get(&ev.partition) {
            if ev.sequence <= hw {
                return Ok(false);
            }
        }
        self.on_fill(ev, ev.side)?;
        self.applied.insert(ev.partition, ev.sequence);
        Ok(true)
    }

    /// Compensating entry for a previously applied trade. Applied at most once per trade id.
    pub fn reverse(&mut self, ev: &TradeEvent) -> Result<bool, LedgerError> {
        if self.reversed.contains(&ev.id) {
            return Ok(false);
        }
        self.on_fill(ev, ev.side.opposite())?;
        self.reversed.insert(ev.id.clone());
        Ok(true)
    }

    pub fn is_reversed(&self, trade_id: &str) -> bool { self.reversed.contains(trade_id) }

    /// Drop the reversal marker of a trade that can no longer be looked up.
    pub fn forget_reversal(&mut self, trade_id: &str) -> bool { self.reversed.remove(trade_id) }

    pub fn reversed_len(&self) -> usize { self.reversed.len() }

    fn on_fill(&mut self, ev: &TradeEvent, side: Side) -> Result<(), LedgerError> {
        let qty = ev.quantity;
        if qty <= 0 {
            return Ok(());
        }
        let overflow = || LedgerError::Overflow { symbol: ev.symbol.clone(), trade_id: ev.id.clone() };
        let cur = self.positions.get(&ev.symbol).cloned().unwrap_or_default();
        let next = fill(&cur, side, qty, ev.price).ok_or_else(overflow)?;
        self.positions.insert(ev.symbol.clone(), next);
        Ok(())
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> { self.positions.get(symbol) }

    pub fn positions(&self) -> Vec<(String, Position)> {
        let mut v: Vec<_> = self.positions.iter().map(|(k, p)| (k.clone(), p.clone())).collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    pub fn realized_pnl(&self) -> Decimal { self.positions.values().map(|p| p.realized_pnl).sum() }

    pub fn applied_high_water(&self, partition: u32) -> Option<u64> { self.applied.get(&partition).copied() }
}

// Position after one fill, `None` on i64 / Decimal overflow.
fn fill(cur: &Position, side: Side, qty: i64, px: Decimal) -> Option<Position> {
    let signed_qty = side.sign() * qty;
    let prev_qty = cur.qty;
    let new_qty = prev_qty.checked_add(signed_qty)?;
    let mut next = cur.clone();

    if prev_qty == 0 || prev_qty.signum() == signed_qty.signum() {
        // arah sama -> update avg cost
        let prev_abs = Decimal::from(prev_qty.checked_abs()?);
        let add_abs = Decimal::from(qty);
        let cost = cur.avg_cost.checked_mul(prev_abs)?.checked_add(px.checked_mul(add_abs)?)?;
        next.avg_cost = cost.checked_div(prev_abs.checked_add(add_abs)?)?;
    } else {
        // arah berlawanan -> realize PnL
        let qty_closed = qty.min(prev_qty.checked_abs()?);
        let pnl = if prev_qty > 0 {
            checked_pnl(cur.avg_cost, px, qty_closed)?
        } else {
            checked_pnl(px, cur.avg_cost, qty_closed)?
        };
        next.realized_pnl = cur.realized_pnl.checked_add(pnl)?;
        if new_qty == 0 {
            next.avg_cost = Decimal::ZERO;
        } else if new_qty.signum() != prev_qty.signum() {
            // posisi berbalik: sisa dibuka di harga fill
            next.avg_cost = px;
        }
    }
    next.qty = new_qty;
    Some(next)
}
