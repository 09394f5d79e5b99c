/*
[INPUT]:  Exchange state (positions, orders, prices) and the monitor registry
[OUTPUT]: Converged protective ladders on both accounts, persisted each pass
[POS]:    Engine - scheduler plus one reconciliation worker per monitor
[UPDATE]: When the pass sequence or execution rules change
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use mirrorguard_exchange::{
    CancelOrderRequest, Category, ClientConfig, Credentials, ExchangeClient, ExchangeError,
    InstrumentInfo, Order, OrderAck, PositionIdx, Side,
    http::error::{RET_DUPLICATE_LINK_ID, RET_ORDER_NOT_FOUND},
};

use crate::config::EngineConfig;
use crate::linkid::{self, LinkRole};
use crate::merge::{self, MergeError};
use crate::mirror::{MirrorExecutor, MirrorOutcome};
use crate::monitor::{
    AccountRole, Approach, Monitor, MonitorKey, Phase, PositionSnapshot, SlOrder, TpOrder, Tranche,
};
use crate::reconcile::{self, CancelIntent, MarketContext, OrderOp, PlaceIntent, PlaceKind};
use crate::registry::MonitorRegistry;
use crate::resilience::{CallError, ResilienceLayer};
use crate::store::PersistedStore;
use crate::supervisor::Supervisor;

/// How long instrument constraints stay cached.
const INSTRUMENT_TTL: Duration = Duration::from_secs(300);

struct CachedInstrument {
    info: InstrumentInfo,
    fetched_at: Instant,
}

/// Latest position sizes per account, refreshed once per pass. `None`
/// means the last query failed, so fill attribution for that account must
/// wait rather than guess.
#[derive(Default)]
struct PositionBook {
    primary: Option<HashMap<(String, Side), Decimal>>,
    mirror: Option<HashMap<(String, Side), Decimal>>,
}

fn book_entries(
    positions: &[mirrorguard_exchange::Position],
) -> HashMap<(String, Side), Decimal> {
    positions
        .iter()
        .map(|position| ((position.symbol.clone(), position.side), position.size))
        .collect()
}

/// The monitoring engine. One instance per process; owns the primary
/// client, the optional mirror executor, and the registry.
pub struct Engine {
    config: EngineConfig,
    category: Category,
    primary: ExchangeClient,
    resilience: ResilienceLayer,
    mirror: Option<MirrorExecutor>,
    registry: Mutex<MonitorRegistry>,
    positions: StdMutex<PositionBook>,
    instruments: StdMutex<HashMap<String, CachedInstrument>>,
}

fn parse_category(raw: &str) -> Result<Category> {
    match raw {
        "linear" => Ok(Category::Linear),
        "inverse" => Ok(Category::Inverse),
        other => Err(anyhow!("unknown market category: {other}")),
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let category = parse_category(&config.category)?;

        let mut primary = ExchangeClient::with_config_and_base_url(
            ClientConfig::default(),
            &config.primary.base_url,
        )
        .context("building primary exchange client")?;
        primary.set_credentials(Credentials {
            api_key: config.primary.api_key.clone(),
            api_secret: config.primary.api_secret.clone(),
        });

        let mirror = match &config.mirror {
            Some(account) => {
                let mut client = ExchangeClient::with_config_and_base_url(
                    ClientConfig::default(),
                    &account.base_url,
                )
                .context("building mirror exchange client")?;
                client.set_credentials(Credentials {
                    api_key: account.api_key.clone(),
                    api_secret: account.api_secret.clone(),
                });
                Some(MirrorExecutor::new(client, category))
            }
            None => None,
        };

        let registry = MonitorRegistry::load(PersistedStore::new(&config.store_path))
            .context("loading monitor registry")?;

        Ok(Self::with_parts(config, category, primary, mirror, registry))
    }

    /// Assemble an engine from pre-built parts. Tests inject wiremock-backed
    /// clients through here.
    pub fn with_parts(
        config: EngineConfig,
        category: Category,
        primary: ExchangeClient,
        mirror: Option<MirrorExecutor>,
        registry: MonitorRegistry,
    ) -> Self {
        Self {
            config,
            category,
            primary,
            resilience: ResilienceLayer::new(),
            mirror,
            registry: Mutex::new(registry),
            positions: StdMutex::new(PositionBook::default()),
            instruments: StdMutex::new(HashMap::new()),
        }
    }

    /// Run until cancelled. Each scheduler pass refreshes account state,
    /// consolidates duplicate records, and keeps one reconciliation worker
    /// per monitor; workers retire when their record goes away. State is
    /// flushed once more on the way out so a restart resumes exactly where
    /// the loop stopped.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut workers = Supervisor::new();
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sync_accounts().await;
                    self.resolve_pending_merges().await;
                    Self::reconcile_workers(&self, &mut workers).await;
                    if let Err(err) = self.finish_pass().await {
                        tracing::error!(error = %err, "pass finalization failed");
                    }
                }
            }
        }

        if let Err(err) = workers.shutdown_and_wait().await {
            tracing::error!(error = %err, "worker shutdown incomplete");
        }
        let registry = self.registry.lock().await;
        if let Err(err) = registry.flush() {
            tracing::error!(error = %err, "final registry flush failed");
        }
        tracing::info!("monitoring engine stopped");
    }

    /// Align the worker set with the registry: spawn a task for every
    /// monitor that lacks one, stop tasks whose monitor is gone.
    async fn reconcile_workers(engine: &Arc<Self>, workers: &mut Supervisor) {
        let keys: Vec<MonitorKey> = {
            let registry = engine.registry.lock().await;
            registry.iter().map(|monitor| monitor.key.clone()).collect()
        };

        let running = workers.task_names();
        for key in &keys {
            let name = key.storage_key();
            if !running.contains(&name) {
                let engine = Arc::clone(engine);
                let key = key.clone();
                workers.spawn(name, move |token| engine.monitor_worker(key, token));
            }
        }

        let live: Vec<String> = keys.iter().map(MonitorKey::storage_key).collect();
        for name in running {
            if !live.contains(&name) {
                if let Err(err) = workers.stop_task(&name).await {
                    tracing::warn!(task = %name, error = %err, "worker did not stop cleanly");
                }
            }
        }
    }

    /// Per-monitor reconciliation loop. Exits on shutdown or once the
    /// record has been retired from the registry.
    async fn monitor_worker(self: Arc<Self>, key: MonitorKey, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let known = {
                        let registry = self.registry.lock().await;
                        registry.get(&key).is_some()
                    };
                    if !known {
                        tracing::info!(key = %key, "monitor retired, worker exiting");
                        break;
                    }
                    self.tick_one(&key).await;
                }
            }
        }
    }

    /// One full sequential pass over every monitor. The production loop
    /// runs workers instead; this drives single-shot runs and tests.
    pub async fn tick(&self) -> Result<()> {
        self.sync_accounts().await;
        self.resolve_pending_merges().await;

        let keys = {
            let registry = self.registry.lock().await;
            let mut keys = registry.keys_for_role(AccountRole::Primary);
            keys.extend(registry.keys_for_role(AccountRole::Mirror));
            keys
        };

        for key in keys {
            self.tick_one(&key).await;
        }

        self.finish_pass().await
    }

    /// Reconcile one monitor, dispatched by account role. Failures are
    /// logged, never propagated: one monitor cannot block another.
    async fn tick_one(&self, key: &MonitorKey) {
        if self.resilience.is_open(&key.symbol) {
            tracing::debug!(symbol = %key.symbol, "breaker open, skipping symbol");
            return;
        }
        let result = match key.role {
            AccountRole::Primary => self.tick_monitor(key).await,
            AccountRole::Mirror => self.tick_mirror_monitor(key).await,
        };
        if let Err(err) = result {
            tracing::warn!(key = %key, error = %err, "monitor tick failed");
        }
    }

    async fn finish_pass(&self) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.check_divergence(&registry);
        registry.retire_closed();
        registry.flush().context("persisting registry after pass")?;
        Ok(())
    }

    async fn sync_accounts(&self) {
        self.sync_primary_positions().await;
        self.sync_mirror_positions().await;
    }

    async fn sync_primary_positions(&self) {
        let result = self
            .resilience
            .call("primary-account", || {
                self.primary.query_positions(self.category, None)
            })
            .await;

        match result {
            Ok(positions) => {
                {
                    let mut book = self.positions.lock().expect("position book poisoned");
                    book.primary = Some(book_entries(&positions));
                }
                let mut registry = self.registry.lock().await;
                self.adopt_positions(&mut registry, AccountRole::Primary, &positions);
                registry.sweep_orphans(AccountRole::Primary, &positions);
            }
            // A failed query must not orphan anything; skip the sweep and
            // mark the sizes stale.
            Err(err) => {
                let mut book = self.positions.lock().expect("position book poisoned");
                book.primary = None;
                tracing::warn!(error = %err, "primary position query failed, skipping sweep");
            }
        }
    }

    async fn sync_mirror_positions(&self) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        match mirror.open_positions().await {
            Ok(positions) => {
                {
                    let mut book = self.positions.lock().expect("position book poisoned");
                    book.mirror = Some(book_entries(&positions));
                }
                let mut registry = self.registry.lock().await;
                self.adopt_positions(&mut registry, AccountRole::Mirror, &positions);
                registry.sweep_orphans(AccountRole::Mirror, &positions);
            }
            Err(err) => {
                let mut book = self.positions.lock().expect("position book poisoned");
                book.mirror = None;
                tracing::warn!(error = %err, "mirror position query failed, skipping sweep");
            }
        }
    }

    /// Current exchange-reported size for a monitor's position. `None`
    /// while the account's last position query failed; `Some(0)` when the
    /// query succeeded and the position is gone.
    fn live_size(&self, key: &MonitorKey) -> Option<Decimal> {
        let book = self.positions.lock().expect("position book poisoned");
        let sizes = match key.role {
            AccountRole::Primary => book.primary.as_ref(),
            AccountRole::Mirror => book.mirror.as_ref(),
        };
        sizes.map(|map| {
            map.get(&(key.symbol.clone(), key.side))
                .copied()
                .unwrap_or(Decimal::ZERO)
        })
    }

    fn adopt_positions(
        &self,
        registry: &mut MonitorRegistry,
        role: AccountRole,
        positions: &[mirrorguard_exchange::Position],
    ) {
        for position in positions {
            if position.size <= Decimal::ZERO {
                continue;
            }
            let key = MonitorKey::new(position.symbol.clone(), position.side, role);
            let snapshot = PositionSnapshot {
                size: position.size,
                avg_price: position.avg_price,
            };
            let (tranche_plan, sl_trigger) = self.derive_plan(position.side, position.avg_price);
            let approach = if self.config.tranche_percents.len() == 1 {
                Approach::SingleTranche
            } else {
                Approach::LadderTranches
            };
            registry.get_or_create(key, &snapshot, approach, tranche_plan, sl_trigger);
        }
    }

    /// Derive the intended ladder from entry price and configured offsets.
    fn derive_plan(&self, side: Side, avg_price: Decimal) -> (Vec<Tranche>, Decimal) {
        let hundred = Decimal::from(100);
        let plan = self
            .config
            .tp_offsets_pct
            .iter()
            .zip(self.config.tranche_percents.iter())
            .map(|(offset, percent)| {
                let factor = match side {
                    Side::Buy => hundred + *offset,
                    Side::Sell => hundred - *offset,
                } / hundred;
                Tranche {
                    price: avg_price * factor,
                    percent: *percent,
                }
            })
            .collect();

        let sl_factor = match side {
            Side::Buy => hundred - self.config.sl_offset_pct,
            Side::Sell => hundred + self.config.sl_offset_pct,
        } / hundred;
        (plan, avg_price * sl_factor)
    }

    /// Consolidate duplicate records queued by the store's key migration.
    /// Each duplicate merges with the record holding its slot; merges that
    /// fail on market state are retried next pass.
    async fn resolve_pending_merges(&self) {
        let pending = {
            let mut registry = self.registry.lock().await;
            registry.take_pending_merges()
        };
        for duplicate in pending {
            self.try_merge(duplicate).await;
        }
    }

    async fn try_merge(&self, duplicate: Monitor) {
        let key = duplicate.key.clone();
        let current = {
            let registry = self.registry.lock().await;
            registry.get(&key).cloned()
        };
        let Some(current) = current else {
            // The slot freed up since load; the displaced record takes it.
            let mut registry = self.registry.lock().await;
            registry.put(duplicate);
            return;
        };

        let symbol = key.symbol.clone();
        let orders = match key.role {
            AccountRole::Primary => {
                self.resilience
                    .call(&symbol, || {
                        self.primary.query_open_orders(self.category, Some(&symbol))
                    })
                    .await
            }
            AccountRole::Mirror => match &self.mirror {
                Some(mirror) => mirror.open_orders(&symbol).await,
                None => {
                    tracing::error!(
                        key = %key,
                        "duplicate mirror record with no mirror account configured, dropping"
                    );
                    return;
                }
            },
        };
        let orders = match orders {
            Ok(list) => list.list,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "order query failed, deferring merge");
                self.registry.lock().await.defer_merge(duplicate);
                return;
            }
        };
        let ticker = match self
            .resilience
            .call(&symbol, || self.primary.query_ticker(self.category, &symbol))
            .await
        {
            Ok(ticker) => ticker,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "ticker query failed, deferring merge");
                self.registry.lock().await.defer_merge(duplicate);
                return;
            }
        };

        let (older, newer) = if duplicate.created_at <= current.created_at {
            (&duplicate, &current)
        } else {
            (&current, &duplicate)
        };
        match merge::plan_merge(older, newer, &orders, &orders, ticker.reference_price()) {
            Ok(merged) => {
                let mut registry = self.registry.lock().await;
                registry.put(merged);
            }
            // Market-state gate; prices move, so this can pass later.
            Err(MergeError::Validation { detail }) => {
                tracing::warn!(key = %key, detail = %detail, "merge validation failed, deferring");
                self.registry.lock().await.defer_merge(duplicate);
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "duplicate record cannot be merged, dropping");
            }
        }
    }

    async fn tick_monitor(&self, key: &MonitorKey) -> Result<()> {
        let symbol = key.symbol.clone();

        let orders = self
            .resilience
            .call(&symbol, || {
                self.primary.query_open_orders(self.category, Some(&symbol))
            })
            .await?;
        let ticker = self
            .resilience
            .call(&symbol, || self.primary.query_ticker(self.category, &symbol))
            .await?;
        let instrument = self.instrument(&symbol).await?;

        let mut monitor = {
            let registry = self.registry.lock().await;
            match registry.get(key) {
                Some(monitor) => monitor.clone(),
                None => return Ok(()),
            }
        };
        if monitor.phase.is_terminal() {
            return Ok(());
        }

        self.apply_fills(&mut monitor, &orders.list, self.live_size(key));

        let ctx = MarketContext {
            reference_price: ticker.reference_price(),
            tick_size: instrument.tick_size,
            qty_step: instrument.qty_step,
            price_tolerance: self.config.price_tolerance,
            breakeven_after_tp1: self.config.breakeven_after_tp1,
        };
        let plan = reconcile::plan(&monitor, &orders.list, &ctx);

        if !plan.is_empty() {
            if monitor.phase == Phase::Building {
                let _ = monitor.transition(Phase::Monitoring);
            }
            let _ = monitor.transition(Phase::Adjusting);
            for op in plan.ops {
                self.execute_op(&mut monitor, op, ctx.reference_price)
                    .await;
            }
            let _ = monitor.transition(Phase::Monitoring);
        }
        monitor.touch();

        // Re-validate before writing back: the record may have been retired
        // while orders were in flight.
        let mut registry = self.registry.lock().await;
        if let Some(current) = registry.get_mut(key) {
            if !current.phase.is_terminal() {
                *current = monitor;
            }
        }
        Ok(())
    }

    /// Reconcile a mirror monitor against the mirror account's own orders
    /// and size. The ladder is planned from this monitor's remaining size,
    /// never copied from the primary's quantities.
    async fn tick_mirror_monitor(&self, key: &MonitorKey) -> Result<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let symbol = key.symbol.clone();

        let orders = mirror.open_orders(&symbol).await?;
        let ticker = self
            .resilience
            .call(&symbol, || self.primary.query_ticker(self.category, &symbol))
            .await?;
        let instrument = self.instrument(&symbol).await?;

        let mut monitor = {
            let registry = self.registry.lock().await;
            match registry.get(key) {
                Some(monitor) => monitor.clone(),
                None => return Ok(()),
            }
        };
        if monitor.phase.is_terminal() {
            return Ok(());
        }

        self.apply_fills(&mut monitor, &orders.list, self.live_size(key));

        let ctx = MarketContext {
            reference_price: ticker.reference_price(),
            tick_size: instrument.tick_size,
            qty_step: instrument.qty_step,
            price_tolerance: self.config.price_tolerance,
            breakeven_after_tp1: self.config.breakeven_after_tp1,
        };
        let plan = reconcile::plan(&monitor, &orders.list, &ctx);

        if !plan.is_empty() {
            if monitor.phase == Phase::Building {
                let _ = monitor.transition(Phase::Monitoring);
            }
            let _ = monitor.transition(Phase::Adjusting);
            for op in plan.ops {
                self.execute_mirror_op(mirror, &mut monitor, op, ctx.reference_price)
                    .await;
            }
            let _ = monitor.transition(Phase::Monitoring);
        }
        monitor.touch();

        let mut registry = self.registry.lock().await;
        if let Some(current) = registry.get_mut(key) {
            if !current.phase.is_terminal() {
                *current = monitor;
            }
        }
        Ok(())
    }

    /// Reflect fills observed since the last look: tracked orders missing
    /// from the live set executed, unless the position size says otherwise.
    /// A fill shrinks (TP) or grows (entry) the position; an order that
    /// vanished with the size unchanged was cancelled externally and is
    /// dropped without recording a fill, so the next plan re-places it.
    /// Without a fresh size the orders stay tracked until one arrives.
    fn apply_fills(&self, monitor: &mut Monitor, live_orders: &[Order], live_size: Option<Decimal>) {
        let live_ids: Vec<&str> = live_orders
            .iter()
            .filter(|order| order.status.is_live())
            .map(|order| order.order_id.as_str())
            .collect();

        let mut shrink_budget =
            live_size.map(|size| (monitor.remaining_size - size).max(Decimal::ZERO));
        let mut growth_budget =
            live_size.map(|size| (size - monitor.remaining_size).max(Decimal::ZERO));

        let tracked: Vec<TpOrder> = monitor.tp_orders.values().cloned().collect();
        for tp in tracked {
            if live_ids.contains(&tp.order_id.as_str()) {
                continue;
            }
            match shrink_budget {
                None => {}
                Some(budget) if budget > Decimal::ZERO => {
                    let filled = tp.qty.min(budget);
                    shrink_budget = Some(budget - filled);
                    monitor.tp_orders.remove(&tp.order_id);
                    if !monitor.filled_tps.contains(&tp.tranche_index) {
                        tracing::info!(
                            key = %monitor.key,
                            tranche = tp.tranche_index,
                            qty = %filled,
                            "take-profit tranche filled"
                        );
                        monitor.record_tp_fill(tp.tranche_index, filled);
                    }
                }
                Some(_) => {
                    tracing::warn!(
                        key = %monitor.key,
                        tranche = tp.tranche_index,
                        order_id = %tp.order_id,
                        "take-profit vanished with position unchanged, treating as external cancel"
                    );
                    monitor.tp_orders.remove(&tp.order_id);
                }
            }
        }

        if let Some(sl) = monitor.sl_order.clone() {
            if !live_ids.contains(&sl.order_id.as_str()) {
                tracing::warn!(key = %monitor.key, "stop-loss order no longer live");
                monitor.sl_order = None;
            }
        }

        let entries = monitor.limit_entries.clone();
        for entry in entries {
            if live_ids.contains(&entry.order_id.as_str()) {
                continue;
            }
            match growth_budget {
                None => {}
                Some(budget) if budget > Decimal::ZERO => {
                    let filled = entry.qty.min(budget);
                    growth_budget = Some(budget - filled);
                    tracing::info!(
                        key = %monitor.key,
                        order_id = %entry.order_id,
                        qty = %filled,
                        "limit entry filled"
                    );
                    monitor.record_entry_fill(&entry.order_id, filled);
                }
                Some(_) => {
                    tracing::warn!(
                        key = %monitor.key,
                        order_id = %entry.order_id,
                        "limit entry vanished with position unchanged, dropping"
                    );
                    monitor
                        .limit_entries
                        .retain(|tracked| tracked.order_id != entry.order_id);
                }
            }
        }

        // Pick up entry orders placed outside this process.
        for order in live_orders {
            if !order.status.is_live() || order.symbol != monitor.key.symbol {
                continue;
            }
            if !order.reduce_only
                && order.side == monitor.key.side
                && !monitor
                    .limit_entries
                    .iter()
                    .any(|entry| entry.order_id == order.order_id)
            {
                monitor.limit_entries.push(crate::monitor::LimitEntry {
                    order_id: order.order_id.clone(),
                    price: order.price.unwrap_or_default(),
                    qty: order.leaves_qty(),
                });
            }
        }
    }

    async fn execute_op(&self, monitor: &mut Monitor, op: OrderOp, market_price: Decimal) {
        match op {
            OrderOp::Cancel(cancel) => {
                if self.cancel_primary(&monitor.key.symbol, &cancel).await {
                    self.forget_order(monitor, &cancel.order_id);
                }
            }
            OrderOp::Place(place) => {
                self.place_and_track(monitor, &place, market_price).await;
            }
            OrderOp::Replace { cancel, place } => {
                // The cancel must land before the replacement; a failed
                // cancel leaves the old order as coverage.
                if !self.cancel_primary(&monitor.key.symbol, &cancel).await {
                    tracing::warn!(
                        key = %monitor.key,
                        order_id = %cancel.order_id,
                        "cancel failed, keeping existing order instead of replacing"
                    );
                    return;
                }
                self.forget_order(monitor, &cancel.order_id);
                self.place_and_track(monitor, &place, market_price).await;
            }
        }
    }

    /// Mirror-side counterpart of `execute_op`. Outcomes are absorbed, so
    /// a refusing mirror account never fails the worker.
    async fn execute_mirror_op(
        &self,
        mirror: &MirrorExecutor,
        monitor: &mut Monitor,
        op: OrderOp,
        market_price: Decimal,
    ) {
        match op {
            OrderOp::Cancel(cancel) => {
                let outcome = mirror
                    .replicate_cancel(&monitor.key.symbol, &cancel.link_id)
                    .await;
                if outcome.is_failure() {
                    tracing::warn!(key = %monitor.key, ?outcome, "mirror cancel failed");
                } else {
                    self.forget_order(monitor, &cancel.order_id);
                }
            }
            OrderOp::Place(place) => {
                self.place_mirror(mirror, monitor, &place, market_price).await;
            }
            OrderOp::Replace { cancel, place } => {
                let outcome = mirror
                    .replicate_cancel(&monitor.key.symbol, &cancel.link_id)
                    .await;
                if outcome.is_failure() {
                    tracing::warn!(
                        key = %monitor.key,
                        order_id = %cancel.order_id,
                        "cancel failed, keeping existing mirror order instead of replacing"
                    );
                    return;
                }
                self.forget_order(monitor, &cancel.order_id);
                self.place_mirror(mirror, monitor, &place, market_price).await;
            }
        }
    }

    async fn place_mirror(
        &self,
        mirror: &MirrorExecutor,
        monitor: &mut Monitor,
        place: &PlaceIntent,
        market_price: Decimal,
    ) {
        let breakeven_move = matches!(place.kind, PlaceKind::StopLoss { .. })
            && self.config.breakeven_after_tp1
            && monitor.tp1_hit
            && !monitor.sl_moved_to_breakeven;
        if breakeven_move {
            monitor.sl_move_attempts += 1;
        }

        match mirror.replicate_place(place, market_price).await {
            MirrorOutcome::Placed { link_id, order_id } => match place.kind {
                PlaceKind::TakeProfit { price, tranche } => {
                    monitor.tp_orders.insert(
                        order_id.clone(),
                        TpOrder {
                            order_id,
                            link_id,
                            price,
                            qty: place.qty,
                            tranche_index: tranche,
                        },
                    );
                }
                PlaceKind::StopLoss { trigger_price } => {
                    monitor.sl_order = Some(SlOrder {
                        order_id,
                        link_id,
                        trigger_price,
                        qty: place.qty,
                    });
                    if breakeven_move {
                        monitor.sl_moved_to_breakeven = true;
                        tracing::info!(key = %monitor.key, "mirror stop-loss moved to breakeven");
                    }
                }
            },
            outcome => {
                if outcome.is_failure() {
                    tracing::warn!(key = %monitor.key, ?outcome, "mirror place failed");
                }
            }
        }
    }

    fn forget_order(&self, monitor: &mut Monitor, order_id: &str) {
        monitor.tp_orders.remove(order_id);
        if monitor
            .sl_order
            .as_ref()
            .is_some_and(|sl| sl.order_id == order_id)
        {
            monitor.sl_order = None;
        }
    }

    async fn cancel_primary(&self, symbol: &str, cancel: &CancelIntent) -> bool {
        let request = CancelOrderRequest::by_order_id(self.category, symbol, &cancel.order_id);
        match self
            .resilience
            .call(symbol, || self.primary.cancel_order(&request))
            .await
        {
            Ok(_) => true,
            Err(CallError::Fatal(ExchangeError::Api { code, .. }))
                if code == RET_ORDER_NOT_FOUND =>
            {
                // Already gone; nothing left to cancel.
                true
            }
            Err(err) => {
                tracing::warn!(symbol = %symbol, order_id = %cancel.order_id, error = %err, "cancel failed");
                false
            }
        }
    }

    async fn place_and_track(
        &self,
        monitor: &mut Monitor,
        place: &PlaceIntent,
        market_price: Decimal,
    ) {
        let breakeven_move = matches!(place.kind, PlaceKind::StopLoss { .. })
            && self.config.breakeven_after_tp1
            && monitor.tp1_hit
            && !monitor.sl_moved_to_breakeven;
        if breakeven_move {
            monitor.sl_move_attempts += 1;
        }

        let Some((ack, link_id)) = self.place_primary(place, market_price).await else {
            return;
        };

        match place.kind {
            PlaceKind::TakeProfit { price, tranche } => {
                monitor.tp_orders.insert(
                    ack.order_id.clone(),
                    TpOrder {
                        order_id: ack.order_id.clone(),
                        link_id: link_id.clone(),
                        price,
                        qty: place.qty,
                        tranche_index: tranche,
                    },
                );
            }
            PlaceKind::StopLoss { trigger_price } => {
                monitor.sl_order = Some(SlOrder {
                    order_id: ack.order_id.clone(),
                    link_id: link_id.clone(),
                    trigger_price,
                    qty: place.qty,
                });
                if breakeven_move {
                    monitor.sl_moved_to_breakeven = true;
                    tracing::info!(key = %monitor.key, "stop-loss moved to breakeven");
                }
            }
        }
    }

    /// Place on the primary account. A duplicate-link-id rejection gets one
    /// retry under a disambiguated id. Returns the ack and the id used.
    async fn place_primary(
        &self,
        place: &PlaceIntent,
        market_price: Decimal,
    ) -> Option<(OrderAck, String)> {
        let request = place.to_request(self.category, market_price, PositionIdx::OneWay);
        match self
            .resilience
            .call(&place.symbol, || self.primary.place_order(&request))
            .await
        {
            Ok(ack) => Some((ack, place.link_id.clone())),
            Err(CallError::Fatal(ExchangeError::Api { code, .. }))
                if code == RET_DUPLICATE_LINK_ID =>
            {
                let role = match place.kind {
                    PlaceKind::TakeProfit { tranche, .. } => LinkRole::TakeProfit(tranche),
                    PlaceKind::StopLoss { .. } => LinkRole::StopLoss,
                };
                let suffix = uuid::Uuid::new_v4().simple().to_string()[..6].to_string();
                let fresh_id =
                    linkid::build_link_id(&place.symbol, role, false, Some(&suffix));
                tracing::warn!(
                    symbol = %place.symbol,
                    link_id = %place.link_id,
                    retry_id = %fresh_id,
                    "duplicate link id, retrying with disambiguator"
                );
                let mut retry = request.clone();
                retry.order_link_id = Some(fresh_id.clone());
                match self
                    .resilience
                    .call(&place.symbol, || self.primary.place_order(&retry))
                    .await
                {
                    Ok(ack) => Some((ack, fresh_id)),
                    Err(err) => {
                        tracing::warn!(symbol = %place.symbol, error = %err, "place retry failed");
                        None
                    }
                }
            }
            Err(err) => {
                tracing::warn!(symbol = %place.symbol, link_id = %place.link_id, error = %err, "place failed");
                None
            }
        }
    }

    /// Warn when primary and mirror remaining sizes diverge beyond the
    /// tolerance. Deliberately defers correction to later passes instead of
    /// firing a corrective burst.
    fn check_divergence(&self, registry: &MonitorRegistry) {
        if self.mirror.is_none() {
            return;
        }
        for primary in registry.iter() {
            if primary.key.role != AccountRole::Primary || primary.remaining_size.is_zero() {
                continue;
            }
            let mirror_key = MonitorKey::new(
                primary.key.symbol.clone(),
                primary.key.side,
                AccountRole::Mirror,
            );
            let Some(mirror) = registry.get(&mirror_key) else {
                continue;
            };
            let diff = (primary.remaining_size - mirror.remaining_size).abs();
            let tolerance = primary.remaining_size * self.config.mirror_qty_tolerance;
            if diff > tolerance {
                tracing::warn!(
                    key = %primary.key,
                    primary_size = %primary.remaining_size,
                    mirror_size = %mirror.remaining_size,
                    "cross-account divergence beyond tolerance, deferring to next pass"
                );
            }
        }
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo, CallError> {
        {
            let cache = self.instruments.lock().expect("instrument cache poisoned");
            if let Some(entry) = cache.get(symbol) {
                if entry.fetched_at.elapsed() < INSTRUMENT_TTL {
                    return Ok(entry.info.clone());
                }
            }
        }

        let info = self
            .resilience
            .call(symbol, || {
                self.primary.query_instrument(self.category, symbol)
            })
            .await?;

        let mut cache = self.instruments.lock().expect("instrument cache poisoned");
        cache.insert(
            symbol.to_string(),
            CachedInstrument {
                info: info.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(info)
    }
}
