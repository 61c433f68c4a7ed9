//! The HTTP seam shared by the config feed, the telemetry sink and the
//! messaging sink. Everything above it only sees response bodies.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};
use std::time::Duration;

use crate::error::TransportError;

/// Minimal request surface the node needs. Bodies come back as text; the
/// caller decides what they mean.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn get(&self, url: &Url) -> Result<String, TransportError>;

    /// POST an already-encoded `application/x-www-form-urlencoded` body.
    async fn post_form(&self, url: &Url, body: String) -> Result<String, TransportError>;
}

/// Build a URL from a base and query pairs, mapping parse failures into the
/// transport error space.
/// No params means no query at all, not a trailing `?`.
pub fn build_url(base: &str, params: &[(&str, String)]) -> Result<Url, TransportError> {
    let parsed = if params.is_empty() {
        Url::parse(base)
    } else {
        Url::parse_with_params(base, params)
    };
    parsed.map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))
}

/// Host part only; paths and queries may carry keys or bot tokens.
fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or("?").to_string()
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// `reqwest` client with a hard per-request timeout, so a stalled exchange
/// can never outlive the watchdog.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build http client: {e}"))?;
        Ok(Self { client })
    }

    async fn read_body(url: &Url, response: Response) -> Result<String, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                host: host_of(url),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|e| TransportError::Request {
            host: host_of(url),
            reason: e.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<String, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError::Request {
                host: host_of(url),
                reason: e.without_url().to_string(),
            })?;
        Self::read_body(url, response).await
    }

    async fn post_form(&self, url: &Url, body: String) -> Result<String, TransportError> {
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                host: host_of(url),
                reason: e.without_url().to_string(),
            })?;
        Self::read_body(url, response).await
    }
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_encodes_params() {
        let url = build_url(
            "https://api.example.com/update",
            &[("api_key", "K Y".to_string()), ("field1", "21".to_string())],
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/update?api_key=K+Y&field1=21");
    }

    #[test]
    fn build_url_without_params_has_no_query() {
        let url = build_url("https://bot.example.com/bot123:abc/sendMessage", &[]).unwrap();
        assert_eq!(url.as_str(), "https://bot.example.com/bot123:abc/sendMessage");
        assert_eq!(url.query(), None);
    }

    #[test]
    fn build_url_rejects_garbage() {
        let err = build_url("not a url", &[]).unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[test]
    fn host_of_hides_path_and_query() {
        let url = Url::parse("https://api.telegram.org/bot123:secret/sendMessage?x=1").unwrap();
        assert_eq!(host_of(&url), "api.telegram.org");
    }

    #[test]
    fn transport_builds_with_timeout() {
        HttpTransport::new(Duration::from_secs(5)).unwrap();
    }
}
