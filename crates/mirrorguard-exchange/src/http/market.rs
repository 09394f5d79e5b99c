/*
[INPUT]:  Query parameters (no authentication)
[OUTPUT]: Market data (tickers, instrument constraints)
[POS]:    HTTP layer - public market endpoints
[UPDATE]: When adding new market endpoints or changing query parameters
*/

use crate::http::{ExchangeClient, ExchangeError, Result};
use crate::types::{Category, InstrumentInfo, InstrumentList, Ticker, TickerList};

impl ExchangeClient {
    /// Query latest prices for a symbol
    ///
    /// GET /v5/market/tickers?category={category}&symbol={symbol}
    pub async fn query_ticker(&self, category: Category, symbol: &str) -> Result<Ticker> {
        let params = [
            ("category", category.as_str().to_string()),
            ("symbol", symbol.to_string()),
        ];

        let tickers: TickerList = self.get_json("/v5/market/tickers", &params).await?;
        tickers
            .list
            .into_iter()
            .find(|ticker| ticker.symbol == symbol)
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(format!("no ticker returned for {symbol}"))
            })
    }

    /// Query trading constraints for a symbol
    ///
    /// GET /v5/market/instruments-info?category={category}&symbol={symbol}
    pub async fn query_instrument(
        &self,
        category: Category,
        symbol: &str,
    ) -> Result<InstrumentInfo> {
        let params = [
            ("category", category.as_str().to_string()),
            ("symbol", symbol.to_string()),
        ];

        let instruments: InstrumentList =
            self.get_json("/v5/market/instruments-info", &params).await?;
        instruments
            .list
            .into_iter()
            .find(|info| info.symbol == symbol)
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(format!("no instrument returned for {symbol}"))
            })
    }
}
