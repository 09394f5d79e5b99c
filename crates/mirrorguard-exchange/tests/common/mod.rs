/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for mirrorguard-exchange tests

use mirrorguard_exchange::{ClientConfig, Credentials, ExchangeClient};
use wiremock::MockServer;

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Build a client pointed at a mock server with test credentials
pub fn client_for(server: &MockServer) -> ExchangeClient {
    let mut client =
        ExchangeClient::with_config_and_base_url(ClientConfig::default(), &server.uri())
            .expect("client should build");
    client.set_credentials(test_credentials());
    client
}

pub fn test_credentials() -> Credentials {
    Credentials {
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
    }
}
