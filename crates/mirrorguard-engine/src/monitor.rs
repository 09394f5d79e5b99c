/*
[INPUT]:  Position snapshots, fill events, and reconciliation results
[OUTPUT]: Typed monitor records with a guarded lifecycle state machine
[POS]:    State layer - per-position protective-ladder records
[UPDATE]: When monitor fields, phases, or key format change
*/

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use mirrorguard_exchange::Side;

/// Which account a monitor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Primary,
    Mirror,
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRole::Primary => write!(f, "primary"),
            AccountRole::Mirror => write!(f, "mirror"),
        }
    }
}

impl FromStr for AccountRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "primary" => Ok(AccountRole::Primary),
            "mirror" => Ok(AccountRole::Mirror),
            other => Err(format!("unknown account role: {other}")),
        }
    }
}

/// Unique monitor identity: one monitor per (symbol, side, role).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorKey {
    pub symbol: String,
    pub side: Side,
    /// Legacy records predate the mirror account and carry no role.
    #[serde(default = "default_role")]
    pub role: AccountRole,
}

fn default_role() -> AccountRole {
    AccountRole::Primary
}

impl MonitorKey {
    pub fn new(symbol: impl Into<String>, side: Side, role: AccountRole) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            role,
        }
    }

    /// Store key format: `<symbol>_<side>_<role>`.
    pub fn storage_key(&self) -> String {
        format!("{}_{}_{}", self.symbol, self.side, self.role)
    }

    /// Parse a store key. Legacy keys lack the role suffix and resolve to
    /// the primary account.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('_').collect();
        match parts.as_slice() {
            [symbol, side] => Some(Self {
                symbol: (*symbol).to_string(),
                side: side.parse().ok()?,
                role: AccountRole::Primary,
            }),
            [symbol, side, role] => Some(Self {
                symbol: (*symbol).to_string(),
                side: side.parse().ok()?,
                role: role.parse().ok()?,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Monitor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Position still filling via limit entries.
    Building,
    /// Ladder active, steady state.
    Monitoring,
    /// Resize in progress. Re-entrant: another tick may enter again.
    Adjusting,
    /// Terminal. Never left once entered.
    Closed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(&self, to: Phase) -> bool {
        match (self, to) {
            (Phase::Closed, _) => false,
            (_, Phase::Building) => matches!(self, Phase::Building),
            (Phase::Building, Phase::Monitoring) => true,
            (Phase::Monitoring | Phase::Adjusting, Phase::Monitoring) => true,
            (Phase::Monitoring | Phase::Adjusting, Phase::Adjusting) => true,
            (Phase::Building, Phase::Adjusting) => false,
            (_, Phase::Closed) => true,
        }
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Building => "Building",
        Phase::Monitoring => "Monitoring",
        Phase::Adjusting => "Adjusting",
        Phase::Closed => "Closed",
    }
}

/// Errors emitted by monitor mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    InvalidTransition { from: &'static str, to: &'static str },
    NotClosable { remaining: String },
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::InvalidTransition { from, to } => {
                write!(f, "invalid phase transition: {from} -> {to}")
            }
            MonitorError::NotClosable { remaining } => {
                write!(f, "monitor not closable with remaining size {remaining}")
            }
        }
    }
}

impl std::error::Error for MonitorError {}

/// Strategy shape for the take-profit side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    SingleTranche,
    LadderTranches,
}

/// One intended take-profit level: price plus its percentage allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tranche {
    pub price: Decimal,
    pub percent: Decimal,
}

/// A live take-profit order tracked against a tranche.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpOrder {
    pub order_id: String,
    pub link_id: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub tranche_index: usize,
}

/// The single live stop-loss order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlOrder {
    pub order_id: String,
    pub link_id: String,
    pub trigger_price: Decimal,
    pub qty: Decimal,
}

/// An unfilled entry order still contributing to target size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitEntry {
    pub order_id: String,
    pub price: Decimal,
    pub qty: Decimal,
}

/// Read-only view of an exchange position used to seed missing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub size: Decimal,
    pub avg_price: Decimal,
}

/// One tracked position with its protective order ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub key: MonitorKey,
    pub position_size: Decimal,
    pub remaining_size: Decimal,
    pub avg_price: Decimal,
    /// order-id -> tracked take-profit order
    #[serde(default)]
    pub tp_orders: BTreeMap<String, TpOrder>,
    #[serde(default)]
    pub sl_order: Option<SlOrder>,
    #[serde(default)]
    pub filled_tps: Vec<usize>,
    #[serde(default)]
    pub tp1_hit: bool,
    #[serde(default)]
    pub sl_moved_to_breakeven: bool,
    #[serde(default)]
    pub sl_move_attempts: u32,
    #[serde(default)]
    pub limit_entries: Vec<LimitEntry>,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub last_check: DateTime<Utc>,
    pub approach: Approach,
    /// Intended ladder, fixed at creation. Single-tranche plans hold one entry.
    pub tranche_plan: Vec<Tranche>,
    /// Intended stop-loss trigger price.
    pub sl_trigger: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_ref: Option<String>,
}

impl Monitor {
    pub fn new(
        key: MonitorKey,
        snapshot: &PositionSnapshot,
        approach: Approach,
        tranche_plan: Vec<Tranche>,
        sl_trigger: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            position_size: snapshot.size,
            remaining_size: snapshot.size,
            avg_price: snapshot.avg_price,
            tp_orders: BTreeMap::new(),
            sl_order: None,
            filled_tps: Vec::new(),
            tp1_hit: false,
            sl_moved_to_breakeven: false,
            sl_move_attempts: 0,
            limit_entries: Vec::new(),
            phase: Phase::Monitoring,
            created_at: now,
            last_check: now,
            approach,
            tranche_plan,
            sl_trigger,
            notify_ref: None,
        }
    }

    /// Quantity the stop-loss must cover: filled size plus unfilled entries.
    pub fn target_size(&self) -> Decimal {
        self.remaining_size
            + self
                .limit_entries
                .iter()
                .fold(Decimal::ZERO, |acc, entry| acc + entry.qty)
    }

    /// Fill in fields missing on this record from a fresh snapshot. Existing
    /// values are never overwritten.
    pub fn fill_missing(&mut self, snapshot: &PositionSnapshot) {
        if self.position_size.is_zero() {
            self.position_size = snapshot.size;
        }
        if self.remaining_size.is_zero() && !self.phase.is_terminal() {
            self.remaining_size = snapshot.size;
        }
        if self.avg_price.is_zero() {
            self.avg_price = snapshot.avg_price;
        }
    }

    pub fn transition(&mut self, to: Phase) -> Result<(), MonitorError> {
        if self.phase == to {
            return Ok(());
        }
        if !self.phase.can_transition(to) {
            return Err(MonitorError::InvalidTransition {
                from: phase_name(self.phase),
                to: phase_name(to),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Record that the tranche at `index` filled. The first fill arms the
    /// breakeven stop-loss logic.
    pub fn record_tp_fill(&mut self, index: usize, filled_qty: Decimal) {
        if !self.filled_tps.contains(&index) {
            self.filled_tps.push(index);
        }
        if !self.tp1_hit {
            self.tp1_hit = true;
        }
        self.remaining_size = (self.remaining_size - filled_qty).max(Decimal::ZERO);
    }

    /// Apply a fill on an entry order: position grew.
    pub fn record_entry_fill(&mut self, order_id: &str, filled_qty: Decimal) {
        self.limit_entries.retain(|entry| entry.order_id != order_id);
        self.position_size += filled_qty;
        self.remaining_size += filled_qty;
    }

    /// Close out the monitor once nothing remains to protect.
    pub fn close(&mut self) -> Result<(), MonitorError> {
        if !self.remaining_size.is_zero() {
            return Err(MonitorError::NotClosable {
                remaining: self.remaining_size.to_string(),
            });
        }
        self.transition(Phase::Closed)
    }

    pub fn touch(&mut self) {
        self.last_check = Utc::now();
    }
}

/// Default ladder allocation: 85/5/5/5.
pub fn default_tranche_percents() -> Vec<Decimal> {
    vec![
        Decimal::from(85),
        Decimal::from(5),
        Decimal::from(5),
        Decimal::from(5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(size: i64, price: i64) -> PositionSnapshot {
        PositionSnapshot {
            size: Decimal::from(size),
            avg_price: Decimal::from(price),
        }
    }

    fn test_monitor() -> Monitor {
        Monitor::new(
            MonitorKey::new("BTCUSDT", Side::Buy, AccountRole::Primary),
            &snapshot(100, 60_000),
            Approach::LadderTranches,
            vec![Tranche {
                price: Decimal::from(65_000),
                percent: Decimal::from(100),
            }],
            Decimal::from(58_000),
        )
    }

    #[test]
    fn storage_key_roundtrip() {
        let key = MonitorKey::new("BTCUSDT", Side::Sell, AccountRole::Mirror);
        assert_eq!(key.storage_key(), "BTCUSDT_Sell_mirror");
        assert_eq!(MonitorKey::parse("BTCUSDT_Sell_mirror"), Some(key));
    }

    #[test]
    fn legacy_key_resolves_to_primary() {
        let key = MonitorKey::parse("ETHUSDT_Buy").expect("legacy key parses");
        assert_eq!(key.role, AccountRole::Primary);
        assert_eq!(key.symbol, "ETHUSDT");
        assert_eq!(key.side, Side::Buy);
    }

    #[test]
    fn closed_is_terminal() {
        let mut monitor = test_monitor();
        monitor.remaining_size = Decimal::ZERO;
        monitor.close().expect("closable");

        let err = monitor.transition(Phase::Monitoring).expect_err("terminal");
        assert!(matches!(err, MonitorError::InvalidTransition { .. }));
    }

    #[test]
    fn adjusting_is_reentrant() {
        let mut monitor = test_monitor();
        monitor.transition(Phase::Adjusting).expect("enter");
        monitor.transition(Phase::Adjusting).expect("re-enter");
        monitor.transition(Phase::Monitoring).expect("back");
    }

    #[test]
    fn close_requires_zero_remaining() {
        let mut monitor = test_monitor();
        assert!(monitor.close().is_err());
    }

    #[test]
    fn target_size_includes_unfilled_entries() {
        let mut monitor = test_monitor();
        monitor.limit_entries.push(LimitEntry {
            order_id: "e1".to_string(),
            price: Decimal::from(59_000),
            qty: Decimal::from(30),
        });

        assert_eq!(monitor.target_size(), Decimal::from(130));
    }

    #[test]
    fn fill_missing_never_overwrites() {
        let mut monitor = test_monitor();
        monitor.fill_missing(&snapshot(500, 1));

        assert_eq!(monitor.position_size, Decimal::from(100));
        assert_eq!(monitor.avg_price, Decimal::from(60_000));
    }

    #[test]
    fn first_tp_fill_arms_breakeven() {
        let mut monitor = test_monitor();
        monitor.record_tp_fill(0, Decimal::from(85));

        assert!(monitor.tp1_hit);
        assert_eq!(monitor.filled_tps, vec![0]);
        assert_eq!(monitor.remaining_size, Decimal::from(15));
    }
}
