use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Verb carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Generate,
    Identify,
    Stop,
    Response,
    ResponseEnd,
    Error,
    Clients,
    Providers,
    Ping,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Generate => "generate",
            Action::Identify => "identify",
            Action::Stop => "stop",
            Action::Response => "response",
            Action::ResponseEnd => "response-end",
            Action::Error => "error",
            Action::Clients => "clients",
            Action::Providers => "providers",
            Action::Ping => "ping",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation parameters forwarded untouched from a client to a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    /// Continuation state returned by a previous generation. Empty starts fresh.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<i64>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<i64>) -> Self {
        self.context = context;
        self
    }
}

/// The message unit exchanged over every relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation tag of the client a message belongs to.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty_tag"
    )]
    pub tag: Option<String>,
    pub action: Action,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<GenerateRequest>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Envelope {
    pub fn new(action: Action, data: impl Into<String>) -> Self {
        Self {
            tag: None,
            action,
            data: data.into(),
            generate: None,
        }
    }

    pub fn generate(request: GenerateRequest) -> Self {
        Self {
            generate: Some(request),
            ..Self::new(Action::Generate, "")
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Action::Error, message)
    }

    /// Pool size announcement (`clients` / `providers`).
    pub fn stat(action: Action, count: usize) -> Self {
        Self::new(action, count.to_string())
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn without_tag(mut self) -> Self {
        self.tag = None;
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn decode(bytes: impl AsRef<[u8]>) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes.as_ref())?)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn non_empty_tag<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let tag = Option::<String>::deserialize(deserializer)?;
    Ok(tag.filter(|value| !value.is_empty()))
}
