use anyhow::Result;
use aura_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(config.otel_stdout)?;
    info!(
        listen_addr = %config.listen_addr,
        auth_enabled = config.auth_enabled(),
        connection_buffer = config.broker.per_connection_buffer,
        stats_attempts = config.broker.stats_attempts,
        seeded = config.broker.rng_seed.is_some(),
        "starting aura relay"
    );

    aura_server::run(config, Some(telemetry.metrics_handle())).await
}
