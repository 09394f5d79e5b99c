/*
[INPUT]:  Request parameters and the account API secret
[OUTPUT]: Signed request headers (X-SIGN / X-API-KEY / X-TIMESTAMP)
[POS]:    HTTP layer - request signing for authenticated endpoints
[UPDATE]: When changing signing algorithm or header format
*/

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::http::error::{ExchangeError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signs HTTP requests for authenticated endpoints.
///
/// Signature payload: `{timestamp}{api_key}{recv_window}{payload}` where
/// payload is the query string for GET and the JSON body for POST.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    api_key: String,
    api_secret: String,
    recv_window: u64,
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, recv_window: u64) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn recv_window(&self) -> u64 {
        self.recv_window
    }

    /// Produce the hex-encoded HMAC-SHA256 signature for a request.
    pub fn sign(&self, timestamp_ms: u64, payload: &str) -> Result<String> {
        let message = format!(
            "{timestamp_ms}{}{}{payload}",
            self.api_key, self.recv_window
        );

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).map_err(|err| {
            ExchangeError::Signing {
                message: format!("invalid key length: {err}"),
            }
        })?;
        mac.update(message.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
