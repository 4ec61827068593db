use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use github_checkpoint::config::Settings;
use github_checkpoint::signature::HmacVerifier;
use github_checkpoint::{channel, consumer, server, SourceRegistry, WebhookPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "github_checkpoint=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    let registry = Arc::new(SourceRegistry::load(&settings.data_file).await?);

    // The consumer owns the only receiver; the pipeline holds the sender.
    let (events_tx, events_rx) = channel();
    tokio::spawn(consumer::run(events_rx, registry.clone()));

    let pipeline = WebhookPipeline::new(
        &settings,
        registry.clone(),
        Arc::new(HmacVerifier),
        events_tx,
    );

    let port = settings.port.unwrap_or_else(|| registry.port());
    let bind_address = format!("{}:{}", settings.host, port);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(
        "Server starting on {} (webhook path {})",
        bind_address, settings.webhook_path
    );

    server::serve(listener, pipeline).await
}
