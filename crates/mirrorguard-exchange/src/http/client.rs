/*
[INPUT]:  HTTP configuration (base URL, timeouts, credentials)
[OUTPUT]: Configured reqwest client ready for signed API calls
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing client behavior
*/

use reqwest::{Client, Method, RequestBuilder, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::http::error::{ExchangeError, Result};
use crate::http::signature::RequestSigner;
use crate::types::ApiResponse;

/// Base URL for the derivatives REST API
const API_BASE_URL: &str = "https://api.exchange.example";

const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub recv_window: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            recv_window: DEFAULT_RECV_WINDOW_MS,
        }
    }
}

/// Credentials for authenticated requests
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Main HTTP client for the derivatives API
#[derive(Debug)]
pub struct ExchangeClient {
    http_client: Client,
    base_url: Url,
    recv_window: u64,
    signer: Option<RequestSigner>,
}

impl ExchangeClient {
    /// Create a new client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        Self::with_config_and_base_url(config, API_BASE_URL)
    }

    /// Create a new client against a custom base URL.
    ///
    /// This is primarily intended for tests where callers inject wiremock
    /// base URLs.
    pub fn with_config_and_base_url(config: ClientConfig, base_url: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
            recv_window: config.recv_window,
            signer: None,
        })
    }

    /// Set credentials for authenticated requests
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.signer = Some(RequestSigner::new(
            credentials.api_key,
            credentials.api_secret,
            self.recv_window,
        ));
    }

    /// Returns true when credentials have been set
    pub fn has_credentials(&self) -> bool {
        self.signer.is_some()
    }

    /// Build full URL for an endpoint
    fn url(&self, endpoint: &str) -> Result<Url> {
        Ok(self.base_url.join(endpoint)?)
    }

    fn signer_for(&self, endpoint: &str) -> Result<&RequestSigner> {
        self.signer
            .as_ref()
            .ok_or_else(|| ExchangeError::MissingCredentials {
                endpoint: endpoint.to_string(),
            })
    }

    fn timestamp_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn signed_headers(builder: RequestBuilder, signer: &RequestSigner, timestamp_ms: u64, signature: &str) -> RequestBuilder {
        builder
            .header("X-API-KEY", signer.api_key())
            .header("X-TIMESTAMP", timestamp_ms.to_string())
            .header("X-RECV-WINDOW", signer.recv_window().to_string())
            .header("X-SIGN", signature)
    }

    /// Issue a public (unsigned) GET request and decode the envelope.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(endpoint)?;
        let builder = self.http_client.request(Method::GET, url).query(query);
        self.send_json(builder).await
    }

    /// Issue a signed GET request and decode the envelope.
    pub(crate) async fn signed_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let signer = self.signer_for(endpoint)?;
        let timestamp_ms = Self::timestamp_ms();

        let query_string = query
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = signer.sign(timestamp_ms, &query_string)?;

        let url = self.url(endpoint)?;
        let builder = self.http_client.request(Method::GET, url).query(query);
        let builder = Self::signed_headers(builder, signer, timestamp_ms, &signature);
        self.send_json(builder).await
    }

    /// Issue a signed POST request with a JSON body and decode the envelope.
    pub(crate) async fn signed_post<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let signer = self.signer_for(endpoint)?;
        let timestamp_ms = Self::timestamp_ms();

        let body_json = serde_json::to_string(body)?;
        let signature = signer.sign(timestamp_ms, &body_json)?;

        let url = self.url(endpoint)?;
        let builder = self
            .http_client
            .request(Method::POST, url)
            .header("Content-Type", "application/json")
            .body(body_json);
        let builder = Self::signed_headers(builder, signer, timestamp_ms, &signature);
        self.send_json(builder).await
    }

    /// Send a request and unwrap the `{retCode, retMsg, result}` envelope.
    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: ApiResponse<T> = serde_json::from_str(&text).map_err(|err| {
            ExchangeError::InvalidResponse(format!(
                "status {status}: failed to decode envelope: {err}"
            ))
        })?;

        if envelope.ret_code != 0 {
            tracing::warn!(
                ret_code = envelope.ret_code,
                ret_msg = %envelope.ret_msg,
                "API envelope returned error"
            );
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        envelope.result.ok_or_else(|| {
            ExchangeError::InvalidResponse("envelope retCode 0 but result missing".to_string())
        })
    }
}
