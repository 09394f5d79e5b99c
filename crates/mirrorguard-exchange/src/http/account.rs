/*
[INPUT]:  Query parameters and signed headers
[OUTPUT]: Account data (positions)
[POS]:    HTTP layer - account endpoints (require signing)
[UPDATE]: When adding new account endpoints or changing query parameters
*/

use crate::http::{ExchangeClient, Result};
use crate::types::{Category, Position, PositionList};

impl ExchangeClient {
    /// Query open positions
    ///
    /// GET /v5/position/list?category={category}&symbol={symbol}
    pub async fn query_positions(
        &self,
        category: Category,
        symbol: Option<&str>,
    ) -> Result<Vec<Position>> {
        let mut params = vec![("category", category.as_str().to_string())];
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }

        let positions: PositionList = self.signed_get("/v5/position/list", &params).await?;
        Ok(positions.list)
    }
}
