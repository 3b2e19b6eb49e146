use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

use crate::{
    auth::Credentials,
    broadcast::DEFAULT_STATS_ATTEMPTS,
    broker::{BrokerConfig, DEFAULT_CONNECTION_BUFFER},
};

#[derive(Debug, Parser)]
#[command(
    name = "aura-server",
    author,
    version,
    about = "Aura relay: routes client generation requests to providers"
)]
pub struct Cli {
    /// Address to bind the HTTP/websocket listener to.
    #[arg(long, env = "AURA_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Basic-auth username required on both websocket endpoints.
    #[arg(long, env = "AURA_USERNAME")]
    pub username: Option<String>,

    /// Basic-auth password required on both websocket endpoints.
    #[arg(long, env = "AURA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Outbound frames buffered per connection before it is dropped as too slow.
    #[arg(long, env = "AURA_CONNECTION_BUFFER", default_value_t = DEFAULT_CONNECTION_BUFFER)]
    pub connection_buffer: usize,

    /// Attempts made to deliver a round of pool-size updates.
    #[arg(long, env = "AURA_STATS_ATTEMPTS", default_value_t = DEFAULT_STATS_ATTEMPTS)]
    pub stats_attempts: usize,

    /// Seed for tag generation and provider selection.
    #[arg(long, env = "AURA_RNG_SEED")]
    pub rng_seed: Option<u64>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "AURA_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "AURA_OTEL_STDOUT")]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub credentials: Option<Credentials>,
    pub broker: BrokerConfig,
    pub shutdown_grace: Duration,
    pub otel_stdout: bool,
}

impl ServerConfig {
    pub fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let credentials = match (cli.username, cli.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => bail!("username and password must be configured together"),
        };

        if cli.connection_buffer == 0 {
            bail!("connection buffer must be at least one frame");
        }
        if cli.stats_attempts == 0 {
            bail!("stats attempts must be at least one");
        }

        Ok(ServerConfig {
            listen_addr,
            credentials,
            broker: BrokerConfig {
                per_connection_buffer: cli.connection_buffer,
                stats_attempts: cli.stats_attempts,
                rng_seed: cli.rng_seed,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            otel_stdout: cli.otel_stdout,
        })
    }
}
