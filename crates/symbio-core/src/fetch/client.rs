use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use url::Url;

use super::config::FetchConfig;

const BUILTIN_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
];

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl TransportError {
    /// Whether retrying the same request can help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_) | Self::UrlParse(_))
    }
}

/// Status, content type and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// One GET request, no retries.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, locator: &str, user_agent: &str) -> Result<TransportResponse, TransportError>;
}

/// `reqwest` transport with hard timeouts and browser-like headers.
pub struct HttpTransport {
    inner: Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let inner = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self { inner })
    }

    fn validate_locator(locator: &str) -> Result<Url, TransportError> {
        let parsed = Url::parse(locator)?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(TransportError::InvalidUrl("No host in URL".to_string()));
        }

        Ok(parsed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, locator: &str, user_agent: &str) -> Result<TransportResponse, TransportError> {
        let url = Self::validate_locator(locator)?;

        let response = self
            .inner
            .get(url)
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { TransportError::Timeout } else { e.into() })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response
            .bytes()
            .await
            .map_err(|e| if e.is_timeout() { TransportError::Timeout } else { e.into() })?
            .to_vec();

        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Rotating pool of user-agent strings.
#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl UserAgentPool {
    #[must_use]
    pub fn new(agents: &[String]) -> Self {
        let agents = if agents.is_empty() {
            BUILTIN_USER_AGENTS.iter().map(|a| (*a).to_string()).collect()
        } else {
            agents.to_vec()
        };
        Self { agents }
    }

    #[must_use]
    pub fn random_user_agent(&self) -> String {
        let mut rng = rand::rng();
        self.agents[rng.random_range(0..self.agents.len())].clone()
    }

    /// A random agent different from `current` when the pool allows it.
    #[must_use]
    pub fn rotate(&self, current: &str) -> String {
        let others: Vec<&String> = self.agents.iter().filter(|a| *a != current).collect();
        if others.is_empty() {
            return self.random_user_agent();
        }
        let mut rng = rand::rng();
        others[rng.random_range(0..others.len())].clone()
    }
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_invalid_url() {
        assert!(matches!(
            HttpTransport::validate_locator("not-a-url"),
            Err(TransportError::UrlParse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_http_scheme() {
        let err = HttpTransport::validate_locator("file:///etc/passwd").unwrap_err();

        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_accepts_https() {
        assert!(HttpTransport::validate_locator("https://echa.europa.eu/data.csv").is_ok());
    }

    #[test]
    fn test_random_user_agent_is_valid() {
        let ua = UserAgentPool::default().random_user_agent();

        assert!(ua.contains("Mozilla"));
    }

    #[test]
    fn test_rotate_picks_a_different_agent() {
        let pool = UserAgentPool::default();
        let current = pool.random_user_agent();

        for _ in 0..20 {
            assert_ne!(pool.rotate(&current), current);
        }
    }

    #[test]
    fn test_single_agent_pool() {
        let pool = UserAgentPool::new(&["symbio-bot/1.0".to_string()]);

        assert_eq!(pool.rotate("symbio-bot/1.0"), "symbio-bot/1.0");
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(TransportError::Timeout.is_retryable());
    }
}
