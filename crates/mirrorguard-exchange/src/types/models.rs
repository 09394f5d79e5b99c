/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust structs with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{
    OrderStatus, OrderType, PositionIdx, Side, StopOrderType, TimeInForce, TriggerDirection,
};

/// A live or historical order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_opt",
        serialize_with = "serde_helpers::serialize_decimal_opt"
    )]
    pub price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub cum_exec_qty: Decimal,
    #[serde(rename = "orderStatus")]
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_order_type: Option<StopOrderType>,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_opt",
        serialize_with = "serde_helpers::serialize_decimal_opt"
    )]
    pub trigger_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_direction: Option<TriggerDirection>,
    #[serde(default = "default_position_idx")]
    pub position_idx: PositionIdx,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub updated_time: String,
}

fn default_position_idx() -> PositionIdx {
    PositionIdx::OneWay
}

impl Order {
    /// Quantity not yet executed.
    pub fn leaves_qty(&self) -> Decimal {
        if self.cum_exec_qty >= self.qty {
            Decimal::ZERO
        } else {
            self.qty - self.cum_exec_qty
        }
    }
}

/// An open position on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub avg_price: Decimal,
    #[serde(default = "default_position_idx")]
    pub position_idx: PositionIdx,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub mark_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub unrealised_pnl: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub leverage: Decimal,
    #[serde(default)]
    pub updated_time: String,
}

/// Latest prices for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub mark_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub index_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub bid1_price: Decimal,
    #[serde(
        default,
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero",
        serialize_with = "serde_helpers::serialize_decimal"
    )]
    pub ask1_price: Decimal,
}

impl Ticker {
    /// Best available reference price: mark price when present, else last.
    pub fn reference_price(&self) -> Decimal {
        if self.mark_price > Decimal::ZERO {
            self.mark_price
        } else {
            self.last_price
        }
    }
}

/// Trading constraints for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentInfo {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub tick_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty_step: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_order_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_order_qty: Decimal,
}

pub(crate) mod serde_helpers {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;
    use std::str::FromStr;

    pub fn deserialize_decimal_or_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(Decimal::ZERO);
        }

        if let Some(raw) = value.as_str() {
            if raw.trim().is_empty() {
                return Ok(Decimal::ZERO);
            }
            return Decimal::from_str(raw).map_err(serde::de::Error::custom);
        }

        if value.is_number() {
            return Decimal::from_str(&value.to_string()).map_err(serde::de::Error::custom);
        }

        Err(serde::de::Error::custom(format!(
            "expected decimal string or number, got {value}"
        )))
    }

    pub fn serialize_decimal<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_string().serialize(serializer)
    }

    /// Exchanges report absent prices as empty strings; map those to None.
    pub fn deserialize_decimal_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(None);
        }

        if let Some(raw) = value.as_str() {
            if raw.trim().is_empty() {
                return Ok(None);
            }
            return Decimal::from_str(raw)
                .map(Some)
                .map_err(serde::de::Error::custom);
        }

        if value.is_number() {
            return Decimal::from_str(&value.to_string())
                .map(Some)
                .map_err(serde::de::Error::custom);
        }

        Err(serde::de::Error::custom(format!(
            "expected decimal string, number or null, got {value}"
        )))
    }

    pub fn serialize_decimal_opt<S>(
        value: &Option<Decimal>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(decimal) => decimal.to_string().serialize(serializer),
            None => "".serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_deserializes_with_empty_price() {
        let json = serde_json::json!({
            "orderId": "abc-1",
            "orderLinkId": "MG_BTCUSDT_TP1",
            "symbol": "BTCUSDT",
            "side": "Sell",
            "orderType": "Limit",
            "price": "",
            "qty": "0.5",
            "cumExecQty": "0.1",
            "orderStatus": "PartiallyFilled",
            "timeInForce": "GTC",
            "reduceOnly": true,
            "triggerPrice": "65000.5",
            "positionIdx": 0
        });

        let order: Order = serde_json::from_value(json).unwrap();
        assert_eq!(order.price, None);
        assert_eq!(order.trigger_price.unwrap().to_string(), "65000.5");
        assert_eq!(order.leaves_qty().to_string(), "0.4");
        assert_eq!(order.position_idx, PositionIdx::OneWay);
    }

    #[test]
    fn ticker_reference_price_prefers_mark() {
        let with_mark = Ticker {
            symbol: "BTCUSDT".to_string(),
            last_price: Decimal::from(100),
            mark_price: Decimal::from(101),
            index_price: Decimal::ZERO,
            bid1_price: Decimal::ZERO,
            ask1_price: Decimal::ZERO,
        };
        assert_eq!(with_mark.reference_price(), Decimal::from(101));

        let without_mark = Ticker {
            mark_price: Decimal::ZERO,
            ..with_mark
        };
        assert_eq!(without_mark.reference_price(), Decimal::from(100));
    }
}
