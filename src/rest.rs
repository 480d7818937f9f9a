//! Minimal REST helper, used for the symbol catalog,
//! order-book snapshots, Kucoin's bullet-public token mint, and Bingx's
//! REST-polled trades/ticker. Failures return `None`; callers MUST treat
//! `None` as "try again later", never as "stream unsupported".

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(9);

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl RestClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Form-encoded GET with optional headers; returns the response body as
    /// text, or `None` on any failure.
    pub async fn get_text(&self, url: &str, headers: Option<&HashMap<String, String>>) -> Option<String> {
        let mut req = self.client.get(url).timeout(self.timeout);
        if let Some(headers) = headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }

        match req.send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(%url, error = %err, "failed to read response body");
                    None
                }
            },
            Err(err) => {
                warn!(%url, error = %err, "GET request failed");
                None
            }
        }
    }

    /// POST with a JSON or form body; used by Kucoin's bullet-public token
    /// mint. Returns the response body as text, or `None` on failure.
    pub async fn post_text(&self, url: &str, headers: Option<&HashMap<String, String>>) -> Option<String> {
        let mut req = self.client.post(url).timeout(self.timeout);
        if let Some(headers) = headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }

        match req.send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(%url, error = %err, "failed to read response body");
                    None
                }
            },
            Err(err) => {
                warn!(%url, error = %err, "POST request failed");
                None
            }
        }
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Option<T> {
        let text = self.get_text(url, None).await?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%url, error = %err, "failed to deserialize JSON response");
                None
            }
        }
    }

    pub async fn post_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Option<T> {
        let text = self.post_text(url, None).await?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%url, error = %err, "failed to deserialize JSON response");
                None
            }
        }
    }
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_text_returns_none_on_connection_failure() {
        let client = RestClient::with_timeout(Duration::from_millis(200));
        let result = client.get_text("http://127.0.0.1:1/unreachable", None).await;
        assert!(result.is_none());
    }
}
