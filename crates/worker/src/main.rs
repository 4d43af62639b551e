mod consumer;

use std::sync::Arc;

use pulse_common::config::AppConfig;
use pulse_common::http::create_http_client;
use pulse_common::identities::IdentityRegistry;
use pulse_engine::dispatcher::Dispatcher;
use pulse_engine::fetch::ReqwestFetcher;
use pulse_engine::queue::QueueClient;
use pulse_engine::retry::RetryPolicy;

use crate::consumer::PulseConsumer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_worker=info,pulse_engine=info,pulse_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Pulse Notify worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // One HTTP client for task fetches, log fetches and notifications
    let http = create_http_client(config.http_timeout())?;

    let identities = Arc::new(IdentityRegistry::load(&config.id_config_path)?);
    let notifiers = pulse_notifier::build_registry(&config, http.clone());

    let queue = QueueClient::new(
        Arc::new(ReqwestFetcher::new(http)),
        config.queue_base_url.clone(),
        RetryPolicy::new(config.retry_interval()),
    );
    let dispatcher = Dispatcher::new(queue, identities, notifiers);

    let consumer = PulseConsumer::connect(&config).await?;

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = consumer.run(&dispatcher) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pulse consumer exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Pulse Notify worker stopped.");
    Ok(())
}
