use std::time::Duration;

use crate::error::AppError;

/// Create the process-wide HTTP client.
///
/// The client owns a connection pool and is meant to be built once in `main`
/// and shared (it is cheaply cloneable) with everything that talks HTTP.
pub fn create_http_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("pulse-notify/", env!("CARGO_PKG_VERSION")))
        .build()?;

    tracing::info!(timeout_secs = timeout.as_secs(), "HTTP client ready");
    Ok(client)
}
