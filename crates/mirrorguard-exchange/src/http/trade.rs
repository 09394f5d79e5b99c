/*
[INPUT]:  Order requests with signed headers
[OUTPUT]: Order acknowledgements and open-order queries
[POS]:    HTTP layer - trading endpoints (require signing)
[UPDATE]: When adding new trading endpoints or changing order flow
*/

use crate::http::{ExchangeClient, Result};
use crate::types::{
    CancelOrderRequest, Category, OrderAck, OrderList, PlaceOrderRequest,
};

impl ExchangeClient {
    /// Place an order
    ///
    /// POST /v5/order/create
    /// Requires: signed headers
    pub async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck> {
        self.signed_post("/v5/order/create", req).await
    }

    /// Cancel an existing order
    ///
    /// POST /v5/order/cancel
    /// Requires: signed headers
    pub async fn cancel_order(&self, req: &CancelOrderRequest) -> Result<OrderAck> {
        self.signed_post("/v5/order/cancel", req).await
    }

    /// Query open (realtime) orders for a symbol
    ///
    /// GET /v5/order/realtime?category={category}&symbol={symbol}
    pub async fn query_open_orders(
        &self,
        category: Category,
        symbol: Option<&str>,
    ) -> Result<OrderList> {
        let mut params = vec![("category", category.as_str().to_string())];
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }

        self.signed_get("/v5/order/realtime", &params).await
    }
}
