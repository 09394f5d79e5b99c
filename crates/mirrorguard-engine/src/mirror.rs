/*
[INPUT]:  Primary-account order operations and the mirror exchange client
[OUTPUT]: Replicated operations on the mirror account, outcomes never errors
[POS]:    Replication layer - mirrors the protective ladder to a second account
[UPDATE]: When replication rules or position-mode handling change
*/

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use mirrorguard_exchange::{
    CancelOrderRequest, Category, ExchangeClient, PositionIdx, Side,
    http::error::RET_ORDER_NOT_FOUND,
};

use crate::linkid;
use crate::reconcile::PlaceIntent;
use crate::resilience::{CallError, ResilienceLayer};

/// How long a detected position mode stays valid before re-detection.
const MODE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Position mode of the mirror account for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

impl PositionMode {
    /// The position index a reduce-only order closing `position_side` must
    /// carry under this mode.
    pub fn close_idx(self, position_side: Side) -> PositionIdx {
        match self {
            PositionMode::OneWay => PositionIdx::OneWay,
            PositionMode::Hedge => match position_side {
                Side::Buy => PositionIdx::HedgeBuy,
                Side::Sell => PositionIdx::HedgeSell,
            },
        }
    }
}

/// Result of one replication attempt. Replication never surfaces an error
/// to the caller; every failure collapses into a logged outcome so the
/// primary ladder is unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Placed { link_id: String, order_id: String },
    Cancelled { link_id: String },
    /// Nothing to do, e.g. cancelling an order the mirror never had.
    Skipped { reason: String },
    Failed { reason: String },
}

impl MirrorOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, MirrorOutcome::Failed { .. })
    }
}

struct CachedMode {
    mode: PositionMode,
    fetched_at: Instant,
}

/// Replicates protective orders onto the mirror account.
pub struct MirrorExecutor {
    client: ExchangeClient,
    category: Category,
    resilience: ResilienceLayer,
    mode_cache: Mutex<HashMap<String, CachedMode>>,
}

impl MirrorExecutor {
    pub fn new(client: ExchangeClient, category: Category) -> Self {
        Self {
            client,
            category,
            resilience: ResilienceLayer::new(),
            mode_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Detect the mirror account's position mode for a symbol, cached for
    /// five minutes. Detection failures fall back to one-way mode.
    pub async fn position_mode(&self, symbol: &str) -> PositionMode {
        {
            let cache = self.mode_cache.lock().expect("mode cache lock poisoned");
            if let Some(entry) = cache.get(symbol) {
                if entry.fetched_at.elapsed() < MODE_CACHE_TTL {
                    return entry.mode;
                }
            }
        }

        let category = self.category;
        let result = self
            .resilience
            .call(symbol, || self.client.query_positions(category, Some(symbol)))
            .await;

        let mode = match result {
            Ok(positions) => {
                let hedged = positions
                    .iter()
                    .any(|position| position.position_idx != PositionIdx::OneWay);
                if hedged {
                    PositionMode::Hedge
                } else {
                    PositionMode::OneWay
                }
            }
            Err(err) => {
                tracing::warn!(
                    symbol = %symbol,
                    error = %err,
                    "position mode detection failed, assuming one-way"
                );
                return PositionMode::OneWay;
            }
        };

        let mut cache = self.mode_cache.lock().expect("mode cache lock poisoned");
        cache.insert(
            symbol.to_string(),
            CachedMode {
                mode,
                fetched_at: Instant::now(),
            },
        );
        mode
    }

    /// All open positions on the mirror account, for adoption and
    /// divergence checks.
    pub async fn open_positions(&self) -> Result<Vec<mirrorguard_exchange::Position>, CallError> {
        self.resilience
            .call("mirror-account", || {
                self.client.query_positions(self.category, None)
            })
            .await
    }

    /// Open orders on the mirror account for one symbol, so the mirror
    /// ladder reconciles against its own live state.
    pub async fn open_orders(
        &self,
        symbol: &str,
    ) -> Result<mirrorguard_exchange::OrderList, CallError> {
        self.resilience
            .call(symbol, || {
                self.client.query_open_orders(self.category, Some(symbol))
            })
            .await
    }

    /// Place the mirror counterpart of a primary order. The link id gains
    /// the mirror suffix so both sides classify their own orders.
    pub async fn replicate_place(
        &self,
        intent: &PlaceIntent,
        market_price: Decimal,
    ) -> MirrorOutcome {
        let mode = self.position_mode(&intent.symbol).await;
        let position_idx = mode.close_idx(intent.position_side);

        let mut request = intent.to_request(self.category, market_price, position_idx);
        let mirror_link_id = linkid::to_mirror_link_id(&intent.link_id);
        request.order_link_id = Some(mirror_link_id.clone());

        let result = self
            .resilience
            .call(&intent.symbol, || self.client.place_order(&request))
            .await;

        match result {
            Ok(ack) => {
                tracing::info!(
                    symbol = %intent.symbol,
                    link_id = %mirror_link_id,
                    order_id = %ack.order_id,
                    "mirror order placed"
                );
                MirrorOutcome::Placed {
                    link_id: mirror_link_id,
                    order_id: ack.order_id,
                }
            }
            Err(err) => {
                tracing::warn!(
                    symbol = %intent.symbol,
                    link_id = %mirror_link_id,
                    error = %err,
                    "mirror place failed"
                );
                MirrorOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Cancel the mirror counterpart of a primary order, addressed by its
    /// mirrored link id. An order the mirror never had is not a failure.
    pub async fn replicate_cancel(&self, symbol: &str, primary_link_id: &str) -> MirrorOutcome {
        let mirror_link_id = linkid::to_mirror_link_id(primary_link_id);
        let request = CancelOrderRequest {
            category: self.category,
            symbol: symbol.to_string(),
            order_id: None,
            order_link_id: Some(mirror_link_id.clone()),
        };

        let result = self
            .resilience
            .call(symbol, || self.client.cancel_order(&request))
            .await;

        match result {
            Ok(_) => {
                tracing::info!(
                    symbol = %symbol,
                    link_id = %mirror_link_id,
                    "mirror order cancelled"
                );
                MirrorOutcome::Cancelled {
                    link_id: mirror_link_id,
                }
            }
            Err(CallError::Fatal(err)) if is_not_found(&err) => MirrorOutcome::Skipped {
                reason: format!("no mirror order for {mirror_link_id}"),
            },
            Err(err) => {
                tracing::warn!(
                    symbol = %symbol,
                    link_id = %mirror_link_id,
                    error = %err,
                    "mirror cancel failed"
                );
                MirrorOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

fn is_not_found(err: &mirrorguard_exchange::ExchangeError) -> bool {
    matches!(
        err,
        mirrorguard_exchange::ExchangeError::Api { code, .. } if *code == RET_ORDER_NOT_FOUND
    )
}
