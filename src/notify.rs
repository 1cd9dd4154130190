// ===============================
// src/notify.rs (deferred post-batch notification)
// ===============================
use tracing::{info, warn};

use crate::domain::ReadPosition;

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub position: ReadPosition,
    pub applied: usize,
    pub poison: usize,
    pub high_value: Vec<String>,
}

/// Runs on the supervisor's pool, after the commit; never on the commit path.
pub async fn run(summary: BatchSummary) {
    let ReadPosition { partition, offset } = summary.position;
    info!(partition, offset, applied = summary.applied, poison = summary.poison, "BATCH COMMITTED");
    for id in &summary.high_value {
        warn!(partition, trade_id = %id, "HIGH VALUE TRADE");
    }
}
