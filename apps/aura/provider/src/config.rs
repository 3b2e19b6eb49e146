use std::time::Duration;

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;

pub const DEFAULT_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 45;

#[derive(Debug, Parser)]
#[command(
    name = "aura-provider",
    author,
    version,
    about = "Aura provider: answers relay generation requests with a local model server"
)]
pub struct Cli {
    /// Base websocket URL of the relay (the provider path is appended).
    #[arg(long, env = "AURA_RELAY_URL", default_value = "ws://127.0.0.1:3000")]
    pub relay_url: String,

    /// Basic-auth username presented to the relay.
    #[arg(long, env = "AURA_USERNAME")]
    pub username: Option<String>,

    /// Basic-auth password presented to the relay.
    #[arg(long, env = "AURA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Base URL of the Ollama-compatible generation server.
    #[arg(long, env = "AURA_ENGINE_URL", default_value = "http://localhost:11434")]
    pub engine_url: String,

    /// Name reported in answer to `identify`.
    #[arg(long, env = "AURA_PROVIDER_NAME", default_value = "aura-provider")]
    pub name: String,

    /// Sampling temperature passed to the engine.
    #[arg(long, env = "AURA_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Delay before reconnecting after the relay connection drops.
    #[arg(long, env = "AURA_RECONNECT_DELAY_SECS", default_value_t = 5)]
    pub reconnect_delay_secs: u64,

    /// Interval between keepalive `ping` envelopes; 0 disables them.
    #[arg(long, env = "AURA_KEEPALIVE_SECS", default_value_t = DEFAULT_KEEPALIVE_SECS)]
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub relay_url: String,
    pub authorization: Option<String>,
    pub engine_url: String,
    pub name: String,
    pub temperature: f32,
    pub reconnect_delay: Duration,
    pub keepalive: Option<Duration>,
}

impl ProviderConfig {
    /// Full URL of the relay's provider endpoint.
    pub fn provider_endpoint(&self) -> String {
        format!("{}/aura/provider", self.relay_url.trim_end_matches('/'))
    }
}

impl TryFrom<Cli> for ProviderConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if !(cli.relay_url.starts_with("ws://") || cli.relay_url.starts_with("wss://")) {
            bail!("relay url must use ws:// or wss://: {}", cli.relay_url);
        }
        reqwest::Url::parse(&cli.engine_url)
            .with_context(|| format!("invalid engine url: {}", cli.engine_url))?;

        let authorization = match (cli.username, cli.password) {
            (Some(username), Some(password)) => Some(basic_authorization(&username, &password)),
            (None, None) => None,
            _ => bail!("username and password must be configured together"),
        };

        if !cli.temperature.is_finite() || cli.temperature < 0.0 {
            bail!("temperature must be a non-negative number");
        }

        Ok(Self {
            relay_url: cli.relay_url,
            authorization,
            engine_url: cli.engine_url,
            name: cli.name,
            temperature: cli.temperature,
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
            keepalive: (cli.keepalive_secs > 0).then(|| Duration::from_secs(cli.keepalive_secs)),
        })
    }
}

pub fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ProviderConfig> {
        let mut argv = vec!["aura-provider"];
        argv.extend_from_slice(args);
        ProviderConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.provider_endpoint(), "ws://127.0.0.1:3000/aura/provider");
        assert_eq!(config.engine_url, "http://localhost:11434");
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.keepalive, Some(Duration::from_secs(45)));
        assert!(config.authorization.is_none());
    }

    #[test]
    fn credentials_become_basic_header() {
        let config = parse(&["--username", "aura", "--password", "hunter2"]).unwrap();
        assert_eq!(
            config.authorization.as_deref(),
            Some("Basic YXVyYTpodW50ZXIy")
        );
    }

    #[test]
    fn rejects_half_configured_credentials() {
        assert!(parse(&["--username", "aura"]).is_err());
    }

    #[test]
    fn rejects_http_relay_url() {
        assert!(parse(&["--relay-url", "http://relay:3000"]).is_err());
    }

    #[test]
    fn trailing_slash_is_not_doubled() {
        let config = parse(&["--relay-url", "wss://relay.example/", "--keepalive-secs", "0"]).unwrap();
        assert_eq!(config.provider_endpoint(), "wss://relay.example/aura/provider");
        assert_eq!(config.keepalive, None);
    }
}
