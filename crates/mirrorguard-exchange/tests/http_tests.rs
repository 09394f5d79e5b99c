/*
[INPUT]:  Mock HTTP responses
[OUTPUT]: Test results for HTTP client
[POS]:    Integration tests - HTTP endpoints
[UPDATE]: When HTTP endpoints change
*/

mod common;

use common::{client_for, setup_mock_server, test_credentials};
use mirrorguard_exchange::{
    CancelOrderRequest, Category, ClientConfig, ExchangeClient, ExchangeError,
    PlaceOrderRequest, Side, TriggerDirection,
};
use rstest::rstest;
use rust_decimal::Decimal;
use tokio_test::assert_ok;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

#[test]
fn test_client_creation() {
    let _client = assert_ok!(ExchangeClient::new());
    let _client = assert_ok!(ExchangeClient::with_config(ClientConfig::default()));
}

#[test]
fn test_client_credentials() {
    let mut client = assert_ok!(ExchangeClient::new());
    assert!(!client.has_credentials());

    client.set_credentials(test_credentials());
    assert!(client.has_credentials());
}

#[tokio::test]
async fn test_query_ticker() {
    let server = setup_mock_server().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .and(query_param("category", "linear"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [{
                    "symbol": "BTCUSDT",
                    "lastPrice": "64000.5",
                    "markPrice": "64001",
                    "indexPrice": "64000.8",
                    "bid1Price": "64000",
                    "ask1Price": "64001"
                }]
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let ticker = assert_ok!(client.query_ticker(Category::Linear, "BTCUSDT").await);

    assert_eq!(ticker.last_price.to_string(), "64000.5");
    assert_eq!(ticker.reference_price().to_string(), "64001");
}

#[tokio::test]
async fn test_query_positions_sends_signed_headers() {
    let server = setup_mock_server().await;
    Mock::given(method("GET"))
        .and(path("/v5/position/list"))
        .and(query_param("category", "linear"))
        .and(header_exists("X-API-KEY"))
        .and(header_exists("X-TIMESTAMP"))
        .and(header_exists("X-SIGN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [{
                    "symbol": "BTCUSDT",
                    "side": "Buy",
                    "size": "0.25",
                    "avgPrice": "63000",
                    "positionIdx": 1,
                    "markPrice": "64000",
                    "unrealisedPnl": "250",
                    "leverage": "10"
                }]
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let positions = assert_ok!(client.query_positions(Category::Linear, None).await);

    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].size.to_string(), "0.25");
    assert_eq!(u8::from(positions[0].position_idx), 1);
}

#[tokio::test]
async fn test_place_order_roundtrip() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .and(header_exists("X-SIGN"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "orderId": "1234",
                "orderLinkId": "MG_BTCUSDT_SL"
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let req = PlaceOrderRequest::stop_market(
        Category::Linear,
        "BTCUSDT",
        Side::Sell,
        Decimal::from(1),
        Decimal::from(60_000),
        TriggerDirection::Fall,
    );

    let ack = assert_ok!(client.place_order(&req).await);
    assert_eq!(ack.order_id, "1234");
    assert_eq!(ack.order_link_id, "MG_BTCUSDT_SL");
}

#[tokio::test]
async fn test_api_error_surfaces_ret_code() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path("/v5/order/cancel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "retCode": 110001,
            "retMsg": "order not exists or too late to cancel"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let req = CancelOrderRequest::by_order_id(Category::Linear, "BTCUSDT", "missing");

    let err = client.cancel_order(&req).await.expect_err("should fail");
    match err {
        ExchangeError::Api { code, .. } => assert_eq!(code, 110_001),
        other => panic!("expected Api error, got {other:?}"),
    }
    assert!(!client
        .cancel_order(&req)
        .await
        .expect_err("should fail")
        .is_retryable());
}

#[tokio::test]
async fn test_missing_credentials_rejected_without_network() {
    let client = assert_ok!(ExchangeClient::new());

    let err = client
        .query_positions(Category::Linear, Some("BTCUSDT"))
        .await
        .expect_err("should fail");

    assert!(matches!(err, ExchangeError::MissingCredentials { .. }));
}

#[rstest]
#[case(10_002, true)]
#[case(10_006, true)]
#[case(110_007, true)]
#[case(10_001, false)]
#[case(110_072, false)]
fn test_ret_code_classification(#[case] code: i64, #[case] retryable: bool) {
    let err = ExchangeError::Api {
        code,
        message: String::new(),
    };
    assert_eq!(err.is_retryable(), retryable);
}
