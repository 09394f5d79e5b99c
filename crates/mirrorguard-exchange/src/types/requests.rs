/*
[INPUT]:  Order intent fields from the engine
[OUTPUT]: Typed request bodies for signed endpoints
[POS]:    Data layer - request type definitions
[UPDATE]: When adding new request parameters or endpoints
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{
    Category, OrderType, PositionIdx, Side, StopOrderType, TimeInForce, TriggerDirection,
};
use super::models::serde_helpers;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub category: Category,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(
        serialize_with = "serde_helpers::serialize_decimal",
        deserialize_with = "serde_helpers::deserialize_decimal_or_zero"
    )]
    pub qty: Decimal,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_decimal_opt_skip",
        deserialize_with = "serde_helpers::deserialize_decimal_opt"
    )]
    pub price: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_decimal_opt_skip",
        deserialize_with = "serde_helpers::deserialize_decimal_opt"
    )]
    pub trigger_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_direction: Option<TriggerDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_order_type: Option<StopOrderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_idx: Option<PositionIdx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_link_id: Option<String>,
}

impl PlaceOrderRequest {
    /// A reduce-only limit order, the shape used for take-profit tranches.
    pub fn reduce_only_limit(
        category: Category,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            category,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            trigger_price: None,
            trigger_direction: None,
            stop_order_type: None,
            time_in_force: Some(TimeInForce::Gtc),
            reduce_only: true,
            position_idx: None,
            order_link_id: None,
        }
    }

    /// A reduce-only conditional market order, the shape used for stop-losses.
    pub fn stop_market(
        category: Category,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        trigger_price: Decimal,
        trigger_direction: TriggerDirection,
    ) -> Self {
        Self {
            category,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            trigger_price: Some(trigger_price),
            trigger_direction: Some(trigger_direction),
            stop_order_type: Some(StopOrderType::StopLoss),
            time_in_force: Some(TimeInForce::Ioc),
            reduce_only: true,
            position_idx: None,
            order_link_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub category: Category,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_link_id: Option<String>,
}

impl CancelOrderRequest {
    pub fn by_order_id(category: Category, symbol: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            category,
            symbol: symbol.into(),
            order_id: Some(order_id.into()),
            order_link_id: None,
        }
    }
}

fn serialize_decimal_opt_skip<S>(
    value: &Option<Decimal>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::Serialize;
    // skip_serializing_if guarantees Some here
    match value {
        Some(decimal) => decimal.to_string().serialize(serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_market_serializes_trigger_fields() {
        let req = PlaceOrderRequest::stop_market(
            Category::Linear,
            "BTCUSDT",
            Side::Sell,
            Decimal::from(100),
            Decimal::from(60_000),
            TriggerDirection::Fall,
        );

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["triggerPrice"], "60000");
        assert_eq!(value["triggerDirection"], 2);
        assert_eq!(value["stopOrderType"], "StopLoss");
        assert_eq!(value["reduceOnly"], true);
        assert!(value.get("price").is_none());
    }
}
