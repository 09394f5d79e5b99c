/*
[INPUT]:  A monitor, its live exchange orders, and market context
[OUTPUT]: Minimal cancel/place operations converging orders to the ladder
[POS]:    Planning layer - pure order reconciliation, no I/O
[UPDATE]: When classification tiers or ladder math change
*/

use rust_decimal::Decimal;

use mirrorguard_exchange::{
    Category, Order, PlaceOrderRequest, PositionIdx, Side, StopOrderType, TriggerDirection,
};

use crate::linkid::{self, LinkRole};
use crate::monitor::Monitor;

/// Semantic role of one live order, decided by the classification tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    /// Unfilled entry order still building the position.
    LimitEntry,
    /// Take-profit; the tranche index is only known from a link id.
    TakeProfit { tranche: Option<usize> },
    StopLoss,
    /// Not recognizable; never touched.
    Other,
}

/// Market inputs for one planning pass.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub reference_price: Decimal,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    /// Relative price tolerance below which a live order is left untouched.
    pub price_tolerance: Decimal,
    /// Move the stop to entry once the first tranche has filled.
    pub breakeven_after_tp1: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelIntent {
    pub order_id: String,
    pub link_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaceKind {
    TakeProfit { price: Decimal, tranche: usize },
    StopLoss { trigger_price: Decimal },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceIntent {
    pub symbol: String,
    /// Side of the order itself (the closing side).
    pub side: Side,
    /// Side of the position being protected.
    pub position_side: Side,
    pub qty: Decimal,
    pub kind: PlaceKind,
    pub link_id: String,
}

impl PlaceIntent {
    /// Build the wire request for this intent. Stop triggers infer their
    /// direction from the current market price: below market fires on a
    /// fall, above fires on a rise.
    pub fn to_request(
        &self,
        category: Category,
        market_price: Decimal,
        position_idx: PositionIdx,
    ) -> PlaceOrderRequest {
        let mut request = match self.kind {
            PlaceKind::TakeProfit { price, .. } => PlaceOrderRequest::reduce_only_limit(
                category,
                self.symbol.clone(),
                self.side,
                self.qty,
                price,
            ),
            PlaceKind::StopLoss { trigger_price } => {
                let direction = if trigger_price < market_price {
                    TriggerDirection::Fall
                } else {
                    TriggerDirection::Rise
                };
                PlaceOrderRequest::stop_market(
                    category,
                    self.symbol.clone(),
                    self.side,
                    self.qty,
                    trigger_price,
                    direction,
                )
            }
        };
        request.order_link_id = Some(self.link_id.clone());
        request.position_idx = Some(position_idx);
        request
    }
}

/// One reconciliation operation. A replace is a cancel that must succeed
/// before its paired place is attempted, so coverage is never duplicated.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOp {
    Cancel(CancelIntent),
    Place(PlaceIntent),
    Replace {
        cancel: CancelIntent,
        place: PlaceIntent,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub ops: Vec<OrderOp>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Classify one live order against the monitored position.
///
/// Reduce-only orders run the three-tier scheme: link-id pattern first
/// (authoritative), exchange purpose metadata second, price-vs-entry last.
/// The final tier cannot decide within one tick of entry and yields `Other`.
pub fn classify_order(
    order: &Order,
    position_side: Side,
    entry_price: Decimal,
    tick_size: Decimal,
) -> OrderRole {
    if !order.reduce_only {
        if order.side == position_side {
            return OrderRole::LimitEntry;
        }
        return OrderRole::Other;
    }

    // Tier 1: link-id markers.
    if let Some(parsed) = linkid::parse_link_id(&order.order_link_id) {
        return match parsed.role {
            LinkRole::TakeProfit(index) => OrderRole::TakeProfit {
                tranche: Some(index),
            },
            LinkRole::StopLoss => OrderRole::StopLoss,
        };
    }

    // Tier 2: exchange-reported purpose metadata.
    if let Some(stop_type) = order.stop_order_type {
        return match stop_type {
            StopOrderType::TakeProfit | StopOrderType::PartialTakeProfit => {
                OrderRole::TakeProfit { tranche: None }
            }
            StopOrderType::StopLoss | StopOrderType::PartialStopLoss => OrderRole::StopLoss,
            StopOrderType::TrailingStop => OrderRole::Other,
        };
    }

    // Tier 3: price relative to entry. Last resort; ambiguous near
    // breakeven, so anything within one tick of entry stays untouched.
    let price = order.trigger_price.or(order.price);
    let Some(price) = price else {
        return OrderRole::Other;
    };
    if (price - entry_price).abs() <= tick_size {
        return OrderRole::Other;
    }

    let profitable = match position_side {
        Side::Buy => price > entry_price,
        Side::Sell => price < entry_price,
    };
    if profitable {
        OrderRole::TakeProfit { tranche: None }
    } else {
        OrderRole::StopLoss
    }
}

/// Floor a quantity to the instrument's step.
pub fn floor_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    (qty / step).floor() * step
}

/// Align a price to the tick grid, rounding in the direction the order
/// side tolerates (buys down, sells up).
pub fn align_price(price: Decimal, tick_size: Decimal, side: Side) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return price;
    }
    let ticks = price / tick_size;
    let rounded = match side {
        Side::Buy => ticks.floor(),
        Side::Sell => ticks.ceil(),
    };
    rounded * tick_size
}

/// Split `remaining` across percentage weights: every tranche but the last
/// is floored to the step, the last absorbs the remainder so the sum is
/// exactly `remaining`.
pub fn ladder_quantities(
    remaining: Decimal,
    percents: &[Decimal],
    qty_step: Decimal,
) -> Vec<Decimal> {
    if percents.is_empty() || remaining <= Decimal::ZERO {
        return Vec::new();
    }

    let total_pct: Decimal = percents.iter().copied().sum();
    if total_pct <= Decimal::ZERO {
        return Vec::new();
    }

    let mut quantities = Vec::with_capacity(percents.len());
    let mut allocated = Decimal::ZERO;
    for pct in &percents[..percents.len() - 1] {
        let qty = floor_to_step(remaining * *pct / total_pct, qty_step);
        allocated += qty;
        quantities.push(qty);
    }
    quantities.push(remaining - allocated);
    quantities
}

/// The trigger price the stop-loss should sit at right now: the plan price
/// until the first take-profit fills, then breakeven at entry.
pub fn effective_sl_trigger(monitor: &Monitor, breakeven_after_tp1: bool) -> Decimal {
    if breakeven_after_tp1 && monitor.tp1_hit {
        monitor.avg_price
    } else {
        monitor.sl_trigger
    }
}

fn within_tolerance(live: Decimal, target: Decimal, tolerance: Decimal) -> bool {
    if target.is_zero() {
        return live.is_zero();
    }
    ((live - target) / target).abs() <= tolerance
}

/// Compute the minimal operation set converging live orders to the target
/// ladder. Pure; a second call with unchanged inputs yields zero ops.
pub fn plan(monitor: &Monitor, live_orders: &[Order], ctx: &MarketContext) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    if monitor.phase.is_terminal() || monitor.remaining_size <= Decimal::ZERO {
        return plan;
    }

    let position_side = monitor.key.side;
    let close_side = position_side.closing();
    let mirror = monitor.key.role == crate::monitor::AccountRole::Mirror;

    // Target tranches: unfilled plan entries, weights renormalized so the
    // quantities sum to remaining_size exactly.
    let unfilled: Vec<(usize, &crate::monitor::Tranche)> = monitor
        .tranche_plan
        .iter()
        .enumerate()
        .filter(|(index, _)| !monitor.filled_tps.contains(index))
        .collect();
    let weights: Vec<Decimal> = unfilled.iter().map(|(_, tranche)| tranche.percent).collect();
    let quantities = ladder_quantities(monitor.remaining_size, &weights, ctx.qty_step);

    let mut live_tps: Vec<&Order> = Vec::new();
    let mut live_sls: Vec<&Order> = Vec::new();
    for order in live_orders {
        if order.symbol != monitor.key.symbol || !order.status.is_live() {
            continue;
        }
        match classify_order(order, position_side, monitor.avg_price, ctx.tick_size) {
            OrderRole::TakeProfit { .. } => live_tps.push(order),
            OrderRole::StopLoss => live_sls.push(order),
            OrderRole::LimitEntry | OrderRole::Other => {}
        }
    }

    let mut matched_tp_ids: Vec<&str> = Vec::new();
    let mut tranche_ops: Vec<OrderOp> = Vec::new();
    for ((index, tranche), qty) in unfilled.iter().zip(quantities.iter()) {
        if *qty <= Decimal::ZERO {
            continue;
        }
        let target_price = align_price(tranche.price, ctx.tick_size, close_side);
        let link_id =
            linkid::build_link_id(&monitor.key.symbol, LinkRole::TakeProfit(*index), mirror, None);

        // A live order for this tranche already at the right price and
        // exact quantity is left untouched.
        let existing = live_tps.iter().find(|order| {
            classify_order(order, position_side, monitor.avg_price, ctx.tick_size)
                == OrderRole::TakeProfit {
                    tranche: Some(*index),
                }
        });

        let place = PlaceIntent {
            symbol: monitor.key.symbol.clone(),
            side: close_side,
            position_side,
            qty: *qty,
            kind: PlaceKind::TakeProfit {
                price: target_price,
                tranche: *index,
            },
            link_id,
        };

        match existing {
            Some(order) => {
                matched_tp_ids.push(order.order_id.as_str());
                let live_price = order.price.or(order.trigger_price).unwrap_or_default();
                let price_ok = within_tolerance(live_price, target_price, ctx.price_tolerance);
                let qty_ok = order.leaves_qty() == *qty;
                if !(price_ok && qty_ok) {
                    tranche_ops.push(OrderOp::Replace {
                        cancel: CancelIntent {
                            order_id: order.order_id.clone(),
                            link_id: order.order_link_id.clone(),
                        },
                        place,
                    });
                }
            }
            None => tranche_ops.push(OrderOp::Place(place)),
        }
    }

    // Take-profits with no matching tranche (stale index, foreign count)
    // are cancelled before any placement so coverage is never duplicated
    // while both the old and the new order are live.
    for order in &live_tps {
        if !matched_tp_ids.contains(&order.order_id.as_str()) {
            plan.ops.push(OrderOp::Cancel(CancelIntent {
                order_id: order.order_id.clone(),
                link_id: order.order_link_id.clone(),
            }));
        }
    }
    plan.ops.append(&mut tranche_ops);

    // Stop-loss: quantity covers the target size, price from the plan (or
    // breakeven once the first tranche filled). A changed stop is always
    // cancel-then-place; trigger orders cannot be amended.
    let sl_qty = monitor.target_size();
    let sl_trigger = align_price(
        effective_sl_trigger(monitor, ctx.breakeven_after_tp1),
        ctx.tick_size,
        close_side,
    );
    let sl_link_id = linkid::build_link_id(&monitor.key.symbol, LinkRole::StopLoss, mirror, None);
    let sl_place = PlaceIntent {
        symbol: monitor.key.symbol.clone(),
        side: close_side,
        position_side,
        qty: sl_qty,
        kind: PlaceKind::StopLoss {
            trigger_price: sl_trigger,
        },
        link_id: sl_link_id,
    };

    match live_sls.split_first() {
        None => {
            if sl_qty > Decimal::ZERO {
                plan.ops.push(OrderOp::Place(sl_place));
            }
        }
        Some((keeper, extras)) => {
            let live_trigger = keeper.trigger_price.or(keeper.price).unwrap_or_default();
            let price_ok = within_tolerance(live_trigger, sl_trigger, ctx.price_tolerance);
            let qty_ok = keeper.leaves_qty() == sl_qty;
            if !(price_ok && qty_ok) {
                plan.ops.push(OrderOp::Replace {
                    cancel: CancelIntent {
                        order_id: keeper.order_id.clone(),
                        link_id: keeper.order_link_id.clone(),
                    },
                    place: sl_place,
                });
            }
            for extra in extras {
                plan.ops.push(OrderOp::Cancel(CancelIntent {
                    order_id: extra.order_id.clone(),
                    link_id: extra.order_link_id.clone(),
                }));
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{AccountRole, Approach, Monitor, MonitorKey, PositionSnapshot, Tranche};
    use mirrorguard_exchange::{OrderStatus, OrderType, PositionIdx, TimeInForce};

    fn dec(value: &str) -> Decimal {
        value.parse().expect("valid decimal")
    }

    fn ctx() -> MarketContext {
        MarketContext {
            reference_price: dec("60000"),
            tick_size: dec("0.5"),
            qty_step: Decimal::ONE,
            price_tolerance: dec("0.0005"),
            breakeven_after_tp1: true,
        }
    }

    fn ladder_monitor(remaining: i64) -> Monitor {
        let percents = [85, 5, 5, 5];
        let prices = ["61000", "62000", "63000", "64000"];
        let plan = percents
            .iter()
            .zip(prices.iter())
            .map(|(pct, price)| Tranche {
                price: dec(price),
                percent: Decimal::from(*pct),
            })
            .collect();

        Monitor::new(
            MonitorKey::new("BTCUSDT", Side::Buy, AccountRole::Primary),
            &PositionSnapshot {
                size: Decimal::from(remaining),
                avg_price: dec("60000"),
            },
            Approach::LadderTranches,
            plan,
            dec("58000"),
        )
    }

    fn live_order(
        order_id: &str,
        link_id: &str,
        side: Side,
        price: Option<&str>,
        trigger: Option<&str>,
        qty: &str,
        reduce_only: bool,
    ) -> Order {
        Order {
            order_id: order_id.to_string(),
            order_link_id: link_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: if trigger.is_some() {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            price: price.map(dec),
            qty: dec(qty),
            cum_exec_qty: Decimal::ZERO,
            status: OrderStatus::New,
            time_in_force: TimeInForce::Gtc,
            reduce_only,
            stop_order_type: None,
            trigger_price: trigger.map(dec),
            trigger_direction: None,
            position_idx: PositionIdx::OneWay,
            created_time: String::new(),
            updated_time: String::new(),
        }
    }

    fn full_ladder(monitor: &Monitor) -> Vec<Order> {
        let mut orders = vec![
            live_order("tp1", "MG_BTCUSDT_TP1", Side::Sell, Some("61000"), None, "850", true),
            live_order("tp2", "MG_BTCUSDT_TP2", Side::Sell, Some("62000"), None, "50", true),
            live_order("tp3", "MG_BTCUSDT_TP3", Side::Sell, Some("63000"), None, "50", true),
            live_order("tp4", "MG_BTCUSDT_TP4", Side::Sell, Some("64000"), None, "50", true),
        ];
        orders.push(live_order(
            "sl1",
            "MG_BTCUSDT_SL",
            Side::Sell,
            None,
            Some("58000"),
            &monitor.target_size().to_string(),
            true,
        ));
        orders
    }

    #[test]
    fn rounding_final_tranche_absorbs_remainder() {
        let quantities = ladder_quantities(
            Decimal::from(1000),
            &[
                Decimal::from(85),
                Decimal::from(5),
                Decimal::from(5),
                Decimal::from(5),
            ],
            Decimal::ONE,
        );

        assert_eq!(
            quantities,
            vec![
                Decimal::from(850),
                Decimal::from(50),
                Decimal::from(50),
                Decimal::from(50)
            ]
        );
        let total: Decimal = quantities.iter().copied().sum();
        assert_eq!(total, Decimal::from(1000));
    }

    #[test]
    fn rounding_remainder_with_awkward_size() {
        let quantities = ladder_quantities(
            dec("999"),
            &[
                Decimal::from(85),
                Decimal::from(5),
                Decimal::from(5),
                Decimal::from(5),
            ],
            Decimal::ONE,
        );

        let total: Decimal = quantities.iter().copied().sum();
        assert_eq!(total, dec("999"));
        assert_eq!(
            quantities,
            vec![
                Decimal::from(849),
                Decimal::from(49),
                Decimal::from(49),
                Decimal::from(52)
            ]
        );
    }

    #[test]
    fn stale_tp_cancelled_before_new_tranches_placed() {
        let monitor = ladder_monitor(1000);
        // A leftover order from a five-tranche layout has no tranche in the
        // current plan; its cancel must precede every placement so the
        // reduce-only budget is freed before new coverage goes out.
        let orders = vec![live_order(
            "stale",
            "MG_BTCUSDT_TP7",
            Side::Sell,
            Some("65000"),
            None,
            "100",
            true,
        )];

        let plan = plan(&monitor, &orders, &ctx());

        assert!(
            matches!(&plan.ops[0], OrderOp::Cancel(cancel) if cancel.order_id == "stale"),
            "first op must cancel the stale take-profit: {:?}",
            plan.ops
        );
        let cancel_pos = 0;
        let first_place = plan
            .ops
            .iter()
            .position(|op| matches!(op, OrderOp::Place(_) | OrderOp::Replace { .. }))
            .expect("placements planned");
        assert!(cancel_pos < first_place);
    }

    #[test]
    fn empty_plan_when_ladder_matches() {
        let monitor = ladder_monitor(1000);
        let orders = full_ladder(&monitor);

        let plan = plan(&monitor, &orders, &ctx());
        assert!(plan.is_empty(), "unexpected ops: {:?}", plan.ops);
    }

    #[test]
    fn plan_is_idempotent() {
        let monitor = ladder_monitor(1000);
        let orders = full_ladder(&monitor);

        let first = plan(&monitor, &orders, &ctx());
        let second = plan(&monitor, &orders, &ctx());
        assert_eq!(first, second);
    }

    #[test]
    fn tp_quantities_sum_to_remaining() {
        let monitor = ladder_monitor(1000);
        let plan = plan(&monitor, &[], &ctx());

        let tp_total: Decimal = plan
            .ops
            .iter()
            .filter_map(|op| match op {
                OrderOp::Place(place) => match place.kind {
                    PlaceKind::TakeProfit { .. } => Some(place.qty),
                    PlaceKind::StopLoss { .. } => None,
                },
                _ => None,
            })
            .sum();

        assert_eq!(tp_total, monitor.remaining_size);
    }

    #[test]
    fn sl_covers_unfilled_entries() {
        let mut monitor = ladder_monitor(100);
        monitor.limit_entries.push(crate::monitor::LimitEntry {
            order_id: "entry1".to_string(),
            price: dec("59000"),
            qty: Decimal::from(30),
        });

        // Live SL covers only the filled 100; must be replaced with 130 at
        // the unchanged trigger price.
        let orders = vec![live_order(
            "sl1",
            "MG_BTCUSDT_SL",
            Side::Sell,
            None,
            Some("58000"),
            "50",
            true,
        )];

        let plan = plan(&monitor, &orders, &ctx());
        let replace = plan
            .ops
            .iter()
            .find_map(|op| match op {
                OrderOp::Replace { cancel, place } => Some((cancel, place)),
                _ => None,
            })
            .expect("SL replace planned");

        assert_eq!(replace.0.order_id, "sl1");
        assert_eq!(replace.1.qty, Decimal::from(130));
        assert_eq!(
            replace.1.kind,
            PlaceKind::StopLoss {
                trigger_price: dec("58000")
            }
        );
    }

    #[test]
    fn sl_change_is_cancel_then_place_not_amend() {
        let monitor = ladder_monitor(100);
        let orders = vec![live_order(
            "sl1",
            "MG_BTCUSDT_SL",
            Side::Sell,
            None,
            Some("57000"),
            "100",
            true,
        )];

        let plan = plan(&monitor, &orders, &ctx());
        assert!(plan
            .ops
            .iter()
            .any(|op| matches!(op, OrderOp::Replace { .. })));
    }

    #[test]
    fn breakeven_sl_after_first_tp() {
        let mut monitor = ladder_monitor(1000);
        monitor.record_tp_fill(0, Decimal::from(850));

        assert_eq!(effective_sl_trigger(&monitor, true), dec("60000"));
        assert_eq!(effective_sl_trigger(&monitor, false), dec("58000"));
    }

    #[test]
    fn foreign_orders_left_untouched() {
        let monitor = ladder_monitor(1000);
        let mut orders = full_ladder(&monitor);
        orders.push(live_order(
            "manual",
            "somebody-else",
            Side::Sell,
            Some("60000.25"),
            None,
            "10",
            true,
        ));

        let plan = plan(&monitor, &orders, &ctx());
        assert!(plan.is_empty(), "unexpected ops: {:?}", plan.ops);
    }

    #[test]
    fn classification_tier_order() {
        let monitor = ladder_monitor(1000);

        // Tier 1 beats the price heuristic: SL marker below entry.
        let tier1 = live_order("a", "MG_BTCUSDT_SL", Side::Sell, None, Some("58000"), "1", true);
        assert_eq!(
            classify_order(&tier1, monitor.key.side, monitor.avg_price, dec("0.5")),
            OrderRole::StopLoss
        );

        // Tier 2: exchange metadata when no link id matches.
        let mut tier2 = live_order("b", "", Side::Sell, None, Some("58000"), "1", true);
        tier2.stop_order_type = Some(StopOrderType::TakeProfit);
        assert_eq!(
            classify_order(&tier2, monitor.key.side, monitor.avg_price, dec("0.5")),
            OrderRole::TakeProfit { tranche: None }
        );

        // Tier 3: price heuristic, long position, above entry is profit.
        let tier3 = live_order("c", "", Side::Sell, Some("61000"), None, "1", true);
        assert_eq!(
            classify_order(&tier3, monitor.key.side, monitor.avg_price, dec("0.5")),
            OrderRole::TakeProfit { tranche: None }
        );

        // Tier 3 near breakeven stays unclassified.
        let near = live_order("d", "", Side::Sell, Some("60000.4"), None, "1", true);
        assert_eq!(
            classify_order(&near, monitor.key.side, monitor.avg_price, dec("0.5")),
            OrderRole::Other
        );
    }

    #[test]
    fn stop_trigger_direction_follows_market() {
        let below = PlaceIntent {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            position_side: Side::Buy,
            qty: Decimal::from(100),
            kind: PlaceKind::StopLoss {
                trigger_price: dec("58000"),
            },
            link_id: "MG_BTCUSDT_SL".to_string(),
        };
        let request = below.to_request(Category::Linear, dec("60000"), PositionIdx::OneWay);
        assert_eq!(request.trigger_direction, Some(TriggerDirection::Fall));
        assert_eq!(request.order_link_id.as_deref(), Some("MG_BTCUSDT_SL"));

        let above = PlaceIntent {
            kind: PlaceKind::StopLoss {
                trigger_price: dec("62000"),
            },
            side: Side::Buy,
            position_side: Side::Sell,
            ..below
        };
        let request = above.to_request(Category::Linear, dec("60000"), PositionIdx::OneWay);
        assert_eq!(request.trigger_direction, Some(TriggerDirection::Rise));
    }

    #[test]
    fn entry_orders_classify_as_limit_entry() {
        let monitor = ladder_monitor(1000);
        let entry = live_order("e", "", Side::Buy, Some("59000"), None, "30", false);

        assert_eq!(
            classify_order(&entry, monitor.key.side, monitor.avg_price, dec("0.5")),
            OrderRole::LimitEntry
        );
    }
}
