/*
[INPUT]:  Mock exchange servers (wiremock) and engine configuration
[OUTPUT]: End-to-end assertions on full monitoring ticks
[POS]:    Integration tests - engine against a mock exchange
[UPDATE]: When tick behavior or wire contracts change
*/

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use mirrorguard_exchange::{Category, ClientConfig, Credentials, ExchangeClient, Side};
use mirrorguard_engine::mirror::MirrorExecutor;
use mirrorguard_engine::monitor::{Approach, PositionSnapshot, Tranche};
use mirrorguard_engine::{
    AccountRole, Engine, EngineConfig, Monitor, MonitorKey, MonitorRegistry, PersistedStore,
};

fn test_config(store_path: &std::path::Path) -> EngineConfig {
    let mut config: EngineConfig = serde_yaml::from_str(
        r#"
primary:
  api_key: key
  api_secret: secret
"#,
    )
    .expect("valid config");
    config.store_path = store_path.to_path_buf();
    config
}

fn client_for(server: &MockServer) -> ExchangeClient {
    let mut client =
        ExchangeClient::with_config_and_base_url(ClientConfig::default(), &server.uri())
            .expect("client should build");
    client.set_credentials(Credentials {
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
    });
    client
}

fn envelope(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "retCode": 0,
        "retMsg": "OK",
        "result": result,
    }))
}

/// Responds to order placement with a unique order id per call.
struct UniqueAck {
    counter: AtomicU32,
}

impl UniqueAck {
    fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }
}

impl Respond for UniqueAck {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": { "orderId": format!("ord-{n}"), "orderLinkId": "" },
        }))
    }
}

async fn mount_market_data(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .respond_with(envelope(json!({
            "list": [{ "symbol": "BTCUSDT", "lastPrice": "60000", "markPrice": "60000" }]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v5/market/instruments-info"))
        .respond_with(envelope(json!({
            "list": [{
                "symbol": "BTCUSDT",
                "tickSize": "0.5",
                "qtyStep": "1",
                "minOrderQty": "1",
                "maxOrderQty": "1000000"
            }]
        })))
        .mount(server)
        .await;
}

async fn mount_position(server: &MockServer, size: &str) {
    Mock::given(method("GET"))
        .and(path("/v5/position/list"))
        .respond_with(envelope(json!({
            "list": [{
                "symbol": "BTCUSDT",
                "side": "Buy",
                "size": size,
                "avgPrice": "60000"
            }],
            "nextPageCursor": ""
        })))
        .mount(server)
        .await;
}

fn tp_order(index: u32, price: &str, qty: &str) -> serde_json::Value {
    json!({
        "orderId": format!("live-tp-{index}"),
        "orderLinkId": format!("MG_BTCUSDT_TP{index}"),
        "symbol": "BTCUSDT",
        "side": "Sell",
        "orderType": "Limit",
        "price": price,
        "qty": qty,
        "orderStatus": "New",
        "timeInForce": "GTC",
        "reduceOnly": true
    })
}

#[tokio::test]
async fn full_tick_builds_ladder_from_bare_position() {
    let server = MockServer::start().await;
    mount_market_data(&server).await;
    mount_position(&server, "1000").await;

    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(json!({ "list": [], "nextPageCursor": "" })))
        .mount(&server)
        .await;

    // 4 take-profit tranches plus one stop-loss.
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(UniqueAck::new())
        .expect(5)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("monitors.json");
    let config = test_config(&store_path);
    let registry = MonitorRegistry::load(PersistedStore::new(&store_path)).unwrap();
    let engine = Engine::with_parts(
        config,
        Category::Linear,
        client_for(&server),
        None,
        registry,
    );

    engine.tick().await.unwrap();

    // The tick flushed the registry; inspect the persisted document.
    let raw = std::fs::read_to_string(&store_path).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let monitor = &document["monitors"]["BTCUSDT_Buy_primary"];

    assert_eq!(monitor["remaining_size"], "1000");
    assert_eq!(monitor["tp_orders"].as_object().unwrap().len(), 4);
    assert!(monitor["sl_order"].is_object());
    assert_eq!(monitor["sl_order"]["qty"], "1000");
}

#[tokio::test]
async fn converged_ladder_issues_no_operations() {
    let server = MockServer::start().await;
    mount_market_data(&server).await;
    mount_position(&server, "1000").await;

    // The live set already matches the derived ladder exactly: TPs at
    // entry+2/4/6/8 percent with 85/5/5/5 split, SL at entry-5%.
    let live = json!({
        "list": [
            tp_order(1, "61200", "850"),
            tp_order(2, "62400", "50"),
            tp_order(3, "63600", "50"),
            tp_order(4, "64800", "50"),
            {
                "orderId": "live-sl",
                "orderLinkId": "MG_BTCUSDT_SL",
                "symbol": "BTCUSDT",
                "side": "Sell",
                "orderType": "Market",
                "qty": "1000",
                "orderStatus": "Untriggered",
                "timeInForce": "IOC",
                "reduceOnly": true,
                "triggerPrice": "57000",
                "triggerDirection": 2,
                "stopOrderType": "StopLoss"
            }
        ],
        "nextPageCursor": ""
    });
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(live))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(UniqueAck::new())
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/cancel"))
        .respond_with(envelope(json!({ "orderId": "x", "orderLinkId": "" })))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("monitors.json");
    let config = test_config(&store_path);
    let registry = MonitorRegistry::load(PersistedStore::new(&store_path)).unwrap();
    let engine = Engine::with_parts(
        config,
        Category::Linear,
        client_for(&server),
        None,
        registry,
    );

    engine.tick().await.unwrap();
    engine.tick().await.unwrap();
}

#[tokio::test]
async fn mirror_failure_never_blocks_primary() {
    let primary_server = MockServer::start().await;
    mount_market_data(&primary_server).await;
    mount_position(&primary_server, "100").await;

    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(json!({ "list": [], "nextPageCursor": "" })))
        .mount(&primary_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(UniqueAck::new())
        .expect(5)
        .mount(&primary_server)
        .await;

    // The mirror account holds a position but rejects every placement
    // with a fatal code.
    let mirror_server = MockServer::start().await;
    mount_position(&mirror_server, "500").await;
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(json!({ "list": [], "nextPageCursor": "" })))
        .mount(&mirror_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 10001,
            "retMsg": "params error"
        })))
        .mount(&mirror_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("monitors.json");
    let config = test_config(&store_path);
    let registry = MonitorRegistry::load(PersistedStore::new(&store_path)).unwrap();
    let mirror = MirrorExecutor::new(client_for(&mirror_server), Category::Linear);
    let engine = Engine::with_parts(
        config,
        Category::Linear,
        client_for(&primary_server),
        Some(mirror),
        registry,
    );

    // Primary placements must all land despite every mirror call failing.
    engine.tick().await.unwrap();

    let raw = std::fs::read_to_string(&store_path).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let monitor = &document["monitors"]["BTCUSDT_Buy_primary"];
    assert_eq!(monitor["tp_orders"].as_object().unwrap().len(), 4);
    assert!(monitor["sl_order"].is_object());

    // The mirror monitor survives with nothing tracked; its ladder is
    // retried on later passes.
    let mirror_monitor = &document["monitors"]["BTCUSDT_Buy_mirror"];
    assert_eq!(mirror_monitor["remaining_size"], "500");
    assert_eq!(mirror_monitor["tp_orders"].as_object().unwrap().len(), 0);
    assert!(mirror_monitor["sl_order"].is_null());
}

#[tokio::test]
async fn mirror_ladder_sized_to_mirror_position() {
    let primary_server = MockServer::start().await;
    mount_market_data(&primary_server).await;
    mount_position(&primary_server, "1000").await;

    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(json!({ "list": [], "nextPageCursor": "" })))
        .mount(&primary_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(UniqueAck::new())
        .expect(5)
        .mount(&primary_server)
        .await;

    // The mirror holds half the primary size; its ladder must be cut from
    // its own 500, not copied from the primary's 1000.
    let mirror_server = MockServer::start().await;
    mount_position(&mirror_server, "500").await;
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(json!({ "list": [], "nextPageCursor": "" })))
        .mount(&mirror_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(UniqueAck::new())
        .expect(5)
        .mount(&mirror_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("monitors.json");
    let config = test_config(&store_path);
    let registry = MonitorRegistry::load(PersistedStore::new(&store_path)).unwrap();
    let mirror = MirrorExecutor::new(client_for(&mirror_server), Category::Linear);
    let engine = Engine::with_parts(
        config,
        Category::Linear,
        client_for(&primary_server),
        Some(mirror),
        registry,
    );

    engine.tick().await.unwrap();

    let raw = std::fs::read_to_string(&store_path).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let mirror_monitor = &document["monitors"]["BTCUSDT_Buy_mirror"];

    let tp_orders = mirror_monitor["tp_orders"].as_object().unwrap();
    assert_eq!(tp_orders.len(), 4);
    let mut quantities: Vec<i64> = tp_orders
        .values()
        .map(|tp| tp["qty"].as_str().unwrap().parse().unwrap())
        .collect();
    quantities.sort_unstable();
    assert_eq!(quantities, vec![25, 25, 25, 425]);
    assert_eq!(mirror_monitor["sl_order"]["qty"], "500");
    for tp in tp_orders.values() {
        assert!(tp["link_id"].as_str().unwrap().contains("_MIRROR"));
    }
}

#[tokio::test]
async fn duplicate_store_records_merge_on_tick() {
    let server = MockServer::start().await;
    mount_market_data(&server).await;
    mount_position(&server, "150").await;

    // A live owned order keeps the position eligible for merging.
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .respond_with(envelope(json!({
            "list": [tp_order(1, "61200", "100")],
            "nextPageCursor": ""
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .respond_with(UniqueAck::new())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/cancel"))
        .respond_with(envelope(json!({ "orderId": "x", "orderLinkId": "" })))
        .mount(&server)
        .await;

    let bare_monitor = |size: &str| {
        Monitor::new(
            MonitorKey::new("BTCUSDT", Side::Buy, AccountRole::Primary),
            &PositionSnapshot {
                size: size.parse().unwrap(),
                avg_price: "60000".parse().unwrap(),
            },
            Approach::LadderTranches,
            vec![Tranche {
                price: "61200".parse().unwrap(),
                percent: "100".parse().unwrap(),
            }],
            "57000".parse().unwrap(),
        )
    };
    let mut legacy = bare_monitor("100");
    legacy.created_at = chrono::Utc::now() - chrono::Duration::minutes(5);
    let canonical = bare_monitor("50");

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("monitors.json");
    // A pre-migration store: the same position recorded under its legacy
    // key and its canonical key.
    let raw = json!({
        "monitors": {
            "BTCUSDT_Buy": legacy,
            "BTCUSDT_Buy_primary": canonical,
        }
    });
    std::fs::write(&store_path, serde_json::to_string(&raw).unwrap()).unwrap();

    let config = test_config(&store_path);
    let registry = MonitorRegistry::load(PersistedStore::new(&store_path)).unwrap();
    let engine = Engine::with_parts(
        config,
        Category::Linear,
        client_for(&server),
        None,
        registry,
    );

    engine.tick().await.unwrap();

    let raw = std::fs::read_to_string(&store_path).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(document["monitors"]["BTCUSDT_Buy"].is_null());
    let monitor = &document["monitors"]["BTCUSDT_Buy_primary"];
    assert_eq!(monitor["position_size"], "150");
    assert_eq!(monitor["remaining_size"], "150");
}
