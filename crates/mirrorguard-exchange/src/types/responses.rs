/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust response structs with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use serde::{Deserialize, Serialize};

use super::models::{InstrumentInfo, Order, Position, Ticker};

/// Standard `{retCode, retMsg, result}` envelope around every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default = "Option::default")]
    pub result: Option<T>,
}

/// Acknowledgement returned by place/cancel order endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderList {
    pub list: Vec<Order>,
    #[serde(default)]
    pub next_page_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionList {
    pub list: Vec<Position>,
    #[serde(default)]
    pub next_page_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerList {
    pub list: Vec<Ticker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentList {
    pub list: Vec<InstrumentInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes_error_without_result() {
        let json = r#"{"retCode":110001,"retMsg":"order not exists"}"#;
        let envelope: ApiResponse<OrderAck> = serde_json::from_str(json).unwrap();

        assert_eq!(envelope.ret_code, 110_001);
        assert!(envelope.result.is_none());
    }
}
