use anyhow::Result;
use aura_provider::{Agent, Cli, OllamaEngine, ProviderConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = ProviderConfig::try_from(Cli::parse())?;
    info!(
        endpoint = %config.provider_endpoint(),
        engine_url = %config.engine_url,
        name = %config.name,
        auth = config.authorization.is_some(),
        "starting aura provider"
    );

    let engine = OllamaEngine::new(config.engine_url.clone(), config.temperature);
    let agent = Agent::new(config, engine);

    agent
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received; shutting down");
        })
        .await;
    Ok(())
}
