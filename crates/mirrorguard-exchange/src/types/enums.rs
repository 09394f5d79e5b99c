/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use serde::{Deserialize, Serialize};

/// Market category scoping every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Linear,
    Inverse,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Linear => "linear",
            Category::Inverse => "inverse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that closes a position opened on this side.
    pub fn closing(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Buy" | "buy" => Ok(Side::Buy),
            "Sell" | "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
    #[serde(rename = "PostOnly")]
    PostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Untriggered,
    Triggered,
    Deactivated,
}

impl OrderStatus {
    /// Statuses that still hold (or may still take) liquidity.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::New
                | OrderStatus::PartiallyFilled
                | OrderStatus::Untriggered
                | OrderStatus::Triggered
        )
    }
}

/// Purpose metadata the exchange attaches to conditional orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOrderType {
    TakeProfit,
    StopLoss,
    TrailingStop,
    PartialTakeProfit,
    PartialStopLoss,
}

/// Position index: 0 = one-way mode, 1/2 = hedge-mode long/short legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PositionIdx {
    OneWay,
    HedgeBuy,
    HedgeSell,
}

impl From<PositionIdx> for u8 {
    fn from(idx: PositionIdx) -> u8 {
        match idx {
            PositionIdx::OneWay => 0,
            PositionIdx::HedgeBuy => 1,
            PositionIdx::HedgeSell => 2,
        }
    }
}

impl TryFrom<u8> for PositionIdx {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PositionIdx::OneWay),
            1 => Ok(PositionIdx::HedgeBuy),
            2 => Ok(PositionIdx::HedgeSell),
            other => Err(format!("unknown position index: {other}")),
        }
    }
}

/// Which way price must move through the trigger for it to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TriggerDirection {
    /// Fires when price rises through the trigger.
    Rise,
    /// Fires when price falls through the trigger.
    Fall,
}

impl From<TriggerDirection> for u8 {
    fn from(direction: TriggerDirection) -> u8 {
        match direction {
            TriggerDirection::Rise => 1,
            TriggerDirection::Fall => 2,
        }
    }
}

impl TryFrom<u8> for TriggerDirection {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TriggerDirection::Rise),
            2 => Ok(TriggerDirection::Fall),
            other => Err(format!("unknown trigger direction: {other}")),
        }
    }
}
