//! Outbound HTTP used by the back-ends. Tests substitute a recorder.

use async_trait::async_trait;
use pulse_engine::plugin::NotifierError;

/// Issue one outbound request and report the response status.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// POST `body` as JSON, with a bearer token when `bearer` is set.
    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<u16, NotifierError>;

    /// PUT raw bytes with the given headers.
    async fn put(&self, url: &str, headers: &[(&str, &str)], body: Vec<u8>) -> Result<u16, NotifierError>;
}

/// `Outbound` over the process-wide `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestOutbound {
    client: reqwest::Client,
}

impl ReqwestOutbound {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Outbound for ReqwestOutbound {
    async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<u16, NotifierError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }

    async fn put(&self, url: &str, headers: &[(&str, &str)], body: Vec<u8>) -> Result<u16, NotifierError> {
        let mut request = self.client.put(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.body(body).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Turn a non-2xx status into an error so the attempt is retried.
pub fn ensure_success(url: &str, status: u16) -> Result<(), NotifierError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(NotifierError::Status {
            url: url.to_string(),
            status,
        })
    }
}
