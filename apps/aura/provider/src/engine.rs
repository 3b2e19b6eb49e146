use std::{collections::VecDeque, pin::Pin};

use async_trait::async_trait;
use aura_core::GenerateRequest;
use futures_util::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type ChunkStream = BoxStream<'static, Result<GenerateChunk, EngineError>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("engine returned {status}: {message}")]
    UnexpectedStatus { status: StatusCode, message: String },
    #[error("engine reported an error: {0}")]
    Remote(String),
    #[error("malformed engine chunk: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One streamed piece of a generation, as produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<i64>,
    /// Timing and bookkeeping fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerateChunk {
    pub fn text(model: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            response: response.into(),
            done: false,
            context: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn finished(mut self, context: Vec<i64>) -> Self {
        self.done = true;
        self.context = context;
        self
    }
}

/// Something that can turn a prompt into a stream of chunks.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<ChunkStream, EngineError>;
}

/// Engine backed by an Ollama-compatible `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaEngine {
    http: Client,
    base_url: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "no_context")]
    context: &'a [i64],
    stream: bool,
    options: OllamaOptions,
}

fn no_context(context: &&[i64]) -> bool {
    context.is_empty()
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

impl OllamaEngine {
    pub fn new(base_url: impl Into<String>, temperature: f32) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            temperature,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }

    fn body<'a>(&self, request: &'a GenerateRequest) -> OllamaRequest<'a> {
        OllamaRequest {
            model: &request.model,
            prompt: &request.prompt,
            context: &request.context,
            stream: true,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        }
    }
}

#[async_trait]
impl GenerationEngine for OllamaEngine {
    async fn generate(&self, request: &GenerateRequest) -> Result<ChunkStream, EngineError> {
        let res = self
            .http
            .post(self.endpoint())
            .json(&self.body(request))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::UnexpectedStatus {
                status,
                message: remote_message(&body),
            });
        }

        Ok(ndjson_chunks(res.bytes_stream()))
    }
}

/// Pulls the `error` field out of an engine error body, falling back to the raw text.
fn remote_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned())
}

/// Splits a newline-delimited JSON byte stream into chunks. Lines may arrive
/// split across reads; a final line without a newline is still decoded.
pub fn ndjson_chunks<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<EngineError> + Send + 'static,
{
    let state = NdjsonState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => state.push(bytes.as_ref()),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err.into()), state));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    state.decode_line(&rest);
                }
            }
        }
    })
    .boxed()
}

struct NdjsonState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    ready: VecDeque<Result<GenerateChunk, EngineError>>,
    finished: bool,
}

impl<S> NdjsonState<S> {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line);
        }
    }

    fn decode_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let item = serde_json::from_str::<Value>(text)
            .map_err(EngineError::from)
            .and_then(|value| match value.get("error").and_then(Value::as_str) {
                Some(message) => Err(EngineError::Remote(message.to_owned())),
                None => serde_json::from_value(value).map_err(EngineError::from),
            });
        self.ready.push_back(item);
    }
}
