//! HTTP access to the queue service and log storage.
//!
//! `HttpFetch` is the seam between the pipeline and the network: production
//! uses `ReqwestFetcher` over the process-wide `reqwest::Client`, tests plug
//! in canned responses.

use async_trait::async_trait;
use thiserror::Error;

/// A fully read HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, `None` when it is not JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Errors raised while fetching a task or a log.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced a response (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a status worth retrying.
    #[error("unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    /// The server answered with a well-formed client error; retrying will not
    /// change the answer.
    #[error("request to {url} rejected with {status}: {message}")]
    Rejected {
        url: String,
        status: u16,
        message: String,
    },

    /// The body could not be decoded as expected.
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    /// The requested log artifact is confirmed to not exist.
    #[error("no logs exist: {0}")]
    NoLogsExist(String),
}

impl FetchError {
    /// Whether the error is final and retries should stop.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Rejected { .. } | FetchError::NoLogsExist(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Transport(e.to_string())
    }
}

/// Issue a GET and return the whole response.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

/// `HttpFetch` backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();

        tracing::debug!(
            url,
            status,
            content_encoding = response
                .headers()
                .get(reqwest::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none"),
            "HTTP response received"
        );

        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}
