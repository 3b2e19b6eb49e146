use std::{future::Future, sync::Arc, time::Duration};

use aura_core::{Action, Envelope, EnvelopeError};
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    time::{interval_at, timeout, Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, header::InvalidHeaderValue, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{config::ProviderConfig, engine::GenerationEngine};

const REPLY_BUFFER: usize = 64;

/// How long to wait for the relay to answer our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub const MISSING_PAYLOAD: &str = "generate request without a generate payload";

pub type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("relay websocket error: {0}")]
    Websocket(#[from] tungstenite::Error),
    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("failed to encode envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("failed to encode engine chunk: {0}")]
    Chunk(#[from] serde_json::Error),
    #[error("relay connection closed")]
    Closed,
}

/// Why [`Agent::serve`] stopped serving a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    RelayClosed,
    Shutdown,
}

/// Keeps one provider connection to the relay alive and answers what arrives on it.
pub struct Agent<E> {
    config: ProviderConfig,
    engine: Arc<E>,
}

impl<E: GenerationEngine> Agent<E> {
    pub fn new(config: ProviderConfig, engine: E) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
        }
    }

    /// Connects, serves until the connection drops, waits, repeats. Returns
    /// once `shutdown` resolves, after closing the live connection.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let endpoint = self.config.provider_endpoint();
        loop {
            let connected = tokio::select! {
                connected = self.connect() => connected,
                _ = &mut shutdown => return,
            };
            match connected {
                Ok(socket) => {
                    info!(endpoint = %endpoint, name = %self.config.name, "connected to relay");
                    match self.serve(socket, &mut shutdown).await {
                        Ok(Exit::Shutdown) => return,
                        Ok(Exit::RelayClosed) => info!("relay closed the connection"),
                        Err(err) => warn!(error = %err, "relay connection lost"),
                    }
                }
                Err(err) => warn!(endpoint = %endpoint, error = %err, "failed to connect to relay"),
            }
            info!(
                delay_secs = self.config.reconnect_delay.as_secs(),
                "reconnecting after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    pub async fn connect(&self) -> Result<RelaySocket, AgentError> {
        let mut request = self.config.provider_endpoint().into_client_request()?;
        if let Some(authorization) = &self.config.authorization {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(authorization)?);
        }
        let (socket, _) = connect_async(request).await?;
        Ok(socket)
    }

    /// Serves one relay connection until the relay closes it or `shutdown`
    /// resolves. Requests are answered one at a time so the chunks of a
    /// generation never interleave with another's. On shutdown a normal
    /// close frame is sent and the relay's reply awaited briefly.
    pub async fn serve<S, F>(
        &self,
        socket: WebSocketStream<S>,
        mut shutdown: F,
    ) -> Result<Exit, AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Unpin,
    {
        let (sink, mut stream) = socket.split();
        let (replies, outbound) = mpsc::channel::<Envelope>(REPLY_BUFFER);
        let writer = tokio::spawn(write_loop(sink, outbound, self.config.keepalive));

        let result = loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = &mut shutdown => break Ok(Exit::Shutdown),
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => break Err(AgentError::from(err)),
                None => break Ok(Exit::RelayClosed),
            };
            let decoded = match frame {
                Message::Text(text) => Envelope::decode(text.as_bytes()),
                Message::Binary(bytes) => Envelope::decode(&bytes[..]),
                Message::Close(_) => break Ok(Exit::RelayClosed),
                _ => continue,
            };
            match decoded {
                Ok(envelope) => tokio::select! {
                    answered = self.respond(envelope, &replies) => {
                        if let Err(err) = answered {
                            break Err(err);
                        }
                    }
                    _ = &mut shutdown => break Ok(Exit::Shutdown),
                },
                Err(err) => warn!(error = %err, "ignoring malformed envelope from relay"),
            }
        };

        drop(replies);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "relay writer stopped"),
            Err(err) => warn!(error = %err, "relay writer task failed"),
        }

        if matches!(result, Ok(Exit::Shutdown)) {
            let drained = timeout(CLOSE_GRACE, async {
                while let Some(Ok(frame)) = stream.next().await {
                    if frame.is_close() {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                debug!("relay did not acknowledge close in time");
            }
            info!("provider connection closed for shutdown");
        }
        result
    }

    /// Answers a single envelope from the relay.
    pub async fn respond(
        &self,
        request: Envelope,
        replies: &mpsc::Sender<Envelope>,
    ) -> Result<(), AgentError> {
        let tag = request.tag.clone();
        match request.action {
            Action::Generate => self.generate(request, replies).await,
            Action::Identify => {
                info!(tag = ?tag, "identify requested");
                let reply = Envelope::new(Action::Identify, self.config.name.clone());
                send(replies, tagged(reply, &tag)).await
            }
            Action::Stop => {
                info!(tag = ?tag, "stop requested; generations run to completion");
                Ok(())
            }
            other => {
                debug!(action = %other, tag = ?tag, "ignoring envelope");
                Ok(())
            }
        }
    }

    async fn generate(
        &self,
        request: Envelope,
        replies: &mpsc::Sender<Envelope>,
    ) -> Result<(), AgentError> {
        let tag = request.tag.clone();
        let Some(generate) = request.generate else {
            warn!(tag = ?tag, "generate request without a payload");
            return send(replies, tagged(Envelope::error(MISSING_PAYLOAD), &tag)).await;
        };

        info!(tag = ?tag, model = %generate.model, "generating");
        let mut chunks = match self.engine.generate(&generate).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(tag = ?tag, error = %err, "generation failed to start");
                return send(replies, tagged(Envelope::error(err.to_string()), &tag)).await;
            }
        };

        let mut streamed = 0usize;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    let data = serde_json::to_string(&chunk)?;
                    send(replies, tagged(Envelope::new(Action::Response, data), &tag)).await?;
                    streamed += 1;
                }
                Err(err) => {
                    warn!(tag = ?tag, error = %err, chunks = streamed, "generation failed mid-stream");
                    return send(replies, tagged(Envelope::error(err.to_string()), &tag)).await;
                }
            }
        }

        debug!(tag = ?tag, chunks = streamed, "generation complete");
        send(replies, tagged(Envelope::new(Action::ResponseEnd, ""), &tag)).await
    }
}

fn tagged(envelope: Envelope, tag: &Option<String>) -> Envelope {
    match tag {
        Some(tag) => envelope.with_tag(tag.clone()),
        None => envelope,
    }
}

async fn send(replies: &mpsc::Sender<Envelope>, envelope: Envelope) -> Result<(), AgentError> {
    replies.send(envelope).await.map_err(|_| AgentError::Closed)
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Envelope>,
    keepalive: Option<Duration>,
) -> Result<(), AgentError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ticker = keepalive.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(envelope) => sink.send(Message::Text(envelope.encode()?.into())).await?,
                None => break,
            },
            _ = next_tick(&mut ticker) => {
                let ping = Envelope::new(Action::Ping, "");
                sink.send(Message::Text(ping.encode()?.into())).await?;
            }
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await;
    let _ = sink.close().await;
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChunkStream, EngineError, GenerateChunk};
    use async_trait::async_trait;
    use aura_core::GenerateRequest;
    use futures_util::stream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Streams the prompt back one word at a time; fails on the prompt "fail".
    struct EchoEngine;

    #[async_trait]
    impl GenerationEngine for EchoEngine {
        async fn generate(&self, request: &GenerateRequest) -> Result<ChunkStream, EngineError> {
            if request.prompt == "fail" {
                return Err(EngineError::Remote("model not loaded".into()));
            }
            let model = request.model.clone();
            let mut chunks: Vec<Result<GenerateChunk, EngineError>> = request
                .prompt
                .split_whitespace()
                .map(|word| Ok(GenerateChunk::text(model.clone(), word)))
                .collect();
            if request.prompt.ends_with('!') {
                chunks.push(Err(EngineError::Remote("out of memory".into())));
            }
            Ok(stream::iter(chunks).boxed())
        }
    }

    fn agent() -> Agent<EchoEngine> {
        let config = ProviderConfig {
            relay_url: "ws://127.0.0.1:3000".into(),
            authorization: None,
            engine_url: "http://localhost:11434".into(),
            name: "echo".into(),
            temperature: 0.8,
            reconnect_delay: Duration::from_millis(10),
            keepalive: None,
        };
        Agent::new(config, EchoEngine)
    }

    async fn answer(request: Envelope) -> Vec<Envelope> {
        let (tx, mut rx) = mpsc::channel(16);
        agent().respond(request, &tx).await.unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Some(envelope) = rx.recv().await {
            out.push(envelope);
        }
        out
    }

    fn chunk_text(envelope: &Envelope) -> String {
        serde_json::from_str::<GenerateChunk>(&envelope.data)
            .unwrap()
            .response
    }

    #[tokio::test]
    async fn generate_streams_tagged_chunks_then_end() {
        let request = Envelope::generate(GenerateRequest::new("m", "hello there")).with_tag("t1");
        let out = answer(request).await;

        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|e| e.tag() == Some("t1")));
        assert_eq!(out[0].action, Action::Response);
        assert_eq!(chunk_text(&out[0]), "hello");
        assert_eq!(chunk_text(&out[1]), "there");
        assert_eq!(out[2], Envelope::new(Action::ResponseEnd, "").with_tag("t1"));
    }

    #[tokio::test]
    async fn engine_failure_becomes_error_envelope() {
        let request = Envelope::generate(GenerateRequest::new("m", "fail")).with_tag("t2");
        let out = answer(request).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, Action::Error);
        assert_eq!(out[0].tag(), Some("t2"));
        assert!(out[0].data.contains("model not loaded"));
    }

    #[tokio::test]
    async fn mid_stream_failure_stops_without_end() {
        let request = Envelope::generate(GenerateRequest::new("m", "a b!")).with_tag("t3");
        let out = answer(request).await;

        let actions: Vec<Action> = out.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![Action::Response, Action::Response, Action::Error]);
    }

    #[tokio::test]
    async fn generate_without_payload_is_answered_with_error() {
        let out = answer(Envelope::new(Action::Generate, "").with_tag("t4")).await;
        assert_eq!(out, vec![Envelope::error(MISSING_PAYLOAD).with_tag("t4")]);
    }

    #[tokio::test]
    async fn identify_reports_configured_name() {
        let out = answer(Envelope::new(Action::Identify, "").with_tag("t5")).await;
        assert_eq!(out, vec![Envelope::new(Action::Identify, "echo").with_tag("t5")]);
    }

    #[tokio::test]
    async fn stop_and_ping_are_ignored() {
        assert!(answer(Envelope::new(Action::Stop, "").with_tag("t6")).await.is_empty());
        assert!(answer(Envelope::new(Action::Ping, "").with_tag("t6")).await.is_empty());
    }

    #[tokio::test]
    async fn closed_reply_channel_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = agent()
            .respond(Envelope::new(Action::Identify, "").with_tag("t7"), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Closed));
    }

    #[tokio::test]
    async fn shutdown_sends_normal_close_and_returns() {
        let (near, far) = tokio::io::duplex(4096);
        let (socket, mut relay) = tokio::join!(
            WebSocketStream::from_raw_socket(near, Role::Client, None),
            WebSocketStream::from_raw_socket(far, Role::Server, None),
        );
        let (stop, stopped) = oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            let shutdown = Box::pin(async move {
                let _ = stopped.await;
            });
            agent().serve(socket, shutdown).await
        });

        let identify = Envelope::new(Action::Identify, "").with_tag("t8");
        relay
            .send(Message::Text(identify.encode().unwrap().into()))
            .await
            .unwrap();
        let Message::Text(reply) = relay.next().await.unwrap().unwrap() else {
            panic!("expected a text reply");
        };
        assert_eq!(
            Envelope::decode(reply.as_bytes()).unwrap(),
            Envelope::new(Action::Identify, "echo").with_tag("t8")
        );

        stop.send(()).unwrap();
        match relay.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected a close frame, got {other:?}"),
        }
        while relay.next().await.is_some() {}

        let exit = timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, Exit::Shutdown);
    }

    #[tokio::test]
    async fn relay_close_ends_serving() {
        let (near, far) = tokio::io::duplex(4096);
        let (socket, mut relay) = tokio::join!(
            WebSocketStream::from_raw_socket(near, Role::Client, None),
            WebSocketStream::from_raw_socket(far, Role::Server, None),
        );
        relay.close(None).await.unwrap();
        let exit = agent()
            .serve(socket, std::future::pending::<()>())
            .await
            .unwrap();
        assert_eq!(exit, Exit::RelayClosed);
    }
}
