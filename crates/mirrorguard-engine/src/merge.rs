/*
[INPUT]:  Two monitors for the same (symbol, side, role) plus live orders
[OUTPUT]: One consolidated monitor, or a rejection with zero side effects
[POS]:    Merger - consolidates duplicate tracked positions
[UPDATE]: When merge rules or the validation gate change
*/

use std::fmt;

use rust_decimal::Decimal;

use mirrorguard_exchange::{Order, Side};

use crate::linkid;
use crate::monitor::{Monitor, Phase, Tranche};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Ownership guard: a position with no recognizable live orders is
    /// externally managed and never merged into.
    NotEligible { key: String },
    KeyMismatch { left: String, right: String },
    /// A computed price fails the side-consistency check against market.
    Validation { detail: String },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::NotEligible { key } => {
                write!(f, "position {key} carries no recognizable orders, not merging")
            }
            MergeError::KeyMismatch { left, right } => {
                write!(f, "cannot merge monitors with different keys: {left} vs {right}")
            }
            MergeError::Validation { detail } => {
                write!(f, "merge validation failed: {detail}")
            }
        }
    }
}

impl std::error::Error for MergeError {}

fn has_owned_orders(orders: &[Order]) -> bool {
    orders
        .iter()
        .any(|order| order.status.is_live() && linkid::is_owned_link_id(&order.order_link_id))
}

/// Stop-loss rule: the more conservative trigger survives. Lower for a
/// long, higher for a short.
fn conservative_sl(side: Side, a: Decimal, b: Decimal) -> Decimal {
    match side {
        Side::Buy => a.min(b),
        Side::Sell => a.max(b),
    }
}

/// Take-profit rule: the more aggressive price survives at each index.
/// Higher for a long, lower for a short.
fn aggressive_tp(side: Side, a: Decimal, b: Decimal) -> Decimal {
    match side {
        Side::Buy => a.max(b),
        Side::Sell => a.min(b),
    }
}

/// Consolidate two monitors tracking the same (symbol, side, role) into
/// one, without losing protective coverage.
///
/// Pure: callers apply the returned record and let the next reconciliation
/// tick converge live orders to it. Any error means nothing was computed
/// that should reach the exchange.
pub fn plan_merge(
    older: &Monitor,
    newer: &Monitor,
    older_orders: &[Order],
    newer_orders: &[Order],
    market_price: Decimal,
) -> Result<Monitor, MergeError> {
    if older.key != newer.key {
        return Err(MergeError::KeyMismatch {
            left: older.key.to_string(),
            right: newer.key.to_string(),
        });
    }
    if !has_owned_orders(older_orders) {
        return Err(MergeError::NotEligible {
            key: older.key.to_string(),
        });
    }
    if !has_owned_orders(newer_orders) {
        return Err(MergeError::NotEligible {
            key: newer.key.to_string(),
        });
    }

    let side = newer.key.side;
    let sl_trigger = conservative_sl(side, older.sl_trigger, newer.sl_trigger);

    // Ladder shape and allocation follow the newest plan; only prices are
    // contested, index by index.
    let tranche_plan: Vec<Tranche> = newer
        .tranche_plan
        .iter()
        .enumerate()
        .map(|(index, tranche)| {
            let price = match older.tranche_plan.get(index) {
                Some(other) => aggressive_tp(side, tranche.price, other.price),
                None => tranche.price,
            };
            Tranche {
                price,
                percent: tranche.percent,
            }
        })
        .collect();

    // Validation gate: stop-loss on the losing side of market, every
    // take-profit on the winning side. One failure aborts the whole merge.
    let sl_ok = match side {
        Side::Buy => sl_trigger < market_price,
        Side::Sell => sl_trigger > market_price,
    };
    if !sl_ok {
        return Err(MergeError::Validation {
            detail: format!(
                "stop-loss {sl_trigger} on wrong side of market {market_price} for {side} position"
            ),
        });
    }
    for tranche in &tranche_plan {
        let tp_ok = match side {
            Side::Buy => tranche.price > market_price,
            Side::Sell => tranche.price < market_price,
        };
        if !tp_ok {
            return Err(MergeError::Validation {
                detail: format!(
                    "take-profit {} on wrong side of market {market_price} for {side} position",
                    tranche.price
                ),
            });
        }
    }

    let position_size = older.position_size + newer.position_size;
    let remaining_size = older.remaining_size + newer.remaining_size;
    let avg_price = if position_size.is_zero() {
        newer.avg_price
    } else {
        (older.avg_price * older.position_size + newer.avg_price * newer.position_size)
            / position_size
    };

    let mut merged = newer.clone();
    merged.position_size = position_size;
    merged.remaining_size = remaining_size;
    merged.avg_price = avg_price;
    merged.sl_trigger = sl_trigger;
    merged.tranche_plan = tranche_plan;
    merged.tp1_hit = older.tp1_hit || newer.tp1_hit;
    merged.sl_moved_to_breakeven = older.sl_moved_to_breakeven || newer.sl_moved_to_breakeven;
    merged.created_at = older.created_at.min(newer.created_at);
    merged
        .limit_entries
        .extend(older.limit_entries.iter().cloned());
    // The next reconciliation tick converges live orders to the merged plan.
    merged.phase = Phase::Adjusting;
    merged.touch();

    tracing::info!(
        key = %merged.key,
        position_size = %merged.position_size,
        sl_trigger = %merged.sl_trigger,
        "monitors merged"
    );
    Ok(merged)
}
