use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::session::{ChatMessage, CompletionRequest, FailureKind, ModelService, ServiceFailure};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = futures_util::stream::SplitSink<WsStream, Message>;

const DEFAULT_RECONNECT_ATTEMPTS: u8 = 2;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to build websocket request: {0}")]
    RequestBuild(String),
    #[error("failed to connect to inference engine: {0}")]
    ConnectFailed(String),
    #[error("failed to serialize engine request: {0}")]
    Serialize(String),
    #[error("failed to send engine request: {0}")]
    WebSocketSend(String),
    #[error("engine connection closed before replying")]
    Closed,
    #[error("unexpected engine reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum EngineRequest<'a> {
    Load {
        id: u64,
        model_id: &'a str,
    },
    Unload {
        id: u64,
    },
    Complete {
        id: u64,
        messages: &'a [ChatMessage],
        max_tokens: u32,
        temperature: f32,
    },
}

/// Frames sent by the inference worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    Loaded {
        id: u64,
    },
    Unloaded {
        id: u64,
    },
    Completion {
        id: u64,
        text: String,
    },
    /// Model download/initialisation progress, unsolicited.
    Progress {
        #[serde(default)]
        progress: f32,
        #[serde(default)]
        text: String,
    },
    Error {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        kind: Option<FailureKind>,
    },
    #[serde(other)]
    Unknown,
}

impl EngineEvent {
    /// Request id this frame answers. Untagged errors answer whatever is in
    /// flight.
    fn answers(&self, request_id: u64) -> bool {
        match self {
            Self::Loaded { id } | Self::Unloaded { id } | Self::Completion { id, .. } => {
                *id == request_id
            }
            Self::Error { id, .. } => id.is_none_or(|id| id == request_id),
            Self::Progress { .. } | Self::Unknown => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Progress { progress: f32, text: String },
    TransportError(String),
}

struct ManagedConnection {
    writer: WsWriter,
    replies: mpsc::UnboundedReceiver<EngineEvent>,
    reader_task: JoinHandle<()>,
}

impl ManagedConnection {
    async fn shutdown(mut self) {
        let close_result = self.writer.send(Message::Close(None)).await;
        self.reader_task.abort();
        if let Err(err) = close_result {
            if !is_expected_close_error(&err) {
                warn!("failed to close engine connection: {err}");
            }
        }
    }
}

/// `ModelService` over a WebSocket to a local inference worker.
///
/// Requests carry an id and the client waits for the matching reply; the
/// session's `&mut` access guarantees a single request in flight.
pub struct EngineClient {
    url: String,
    reconnect_attempts: u8,
    connection: Option<ManagedConnection>,
    next_request_id: u64,
    event_tx: broadcast::Sender<NetworkEvent>,
}

impl EngineClient {
    pub fn new(url: impl Into<String>, event_tx: broadcast::Sender<NetworkEvent>) -> Self {
        Self {
            url: url.into(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            connection: None,
            next_request_id: 1,
            event_tx,
        }
    }

    pub async fn ensure_connected(&mut self) -> Result<(), NetworkError> {
        if self.connection.is_none() {
            let connection = self.connect_with_retry().await?;
            self.connection = Some(connection);
            info!(url = %self.url, "engine connection created");
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    async fn call(&mut self, request: &EngineRequest<'_>, id: u64) -> Result<EngineEvent, NetworkError> {
        let serialized =
            serde_json::to_string(request).map_err(|err| NetworkError::Serialize(err.to_string()))?;
        self.send_text_with_reconnect(serialized).await?;
        self.await_reply(id).await
    }

    async fn send_text_with_reconnect(&mut self, message: String) -> Result<(), NetworkError> {
        let mut attempts_remaining = 1_u8;
        loop {
            self.ensure_connected().await?;

            let send_result = match self.connection.as_mut() {
                Some(connection) => connection.writer.send(Message::Text(message.clone().into())).await,
                None => return Err(NetworkError::Closed),
            };

            match send_result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("engine send failed, invalidating connection: {err}");
                    self.disconnect().await;
                    if attempts_remaining == 0 {
                        return Err(NetworkError::WebSocketSend(err.to_string()));
                    }
                    attempts_remaining -= 1;
                }
            }
        }
    }

    async fn await_reply(&mut self, id: u64) -> Result<EngineEvent, NetworkError> {
        loop {
            let next = match self.connection.as_mut() {
                Some(connection) => connection.replies.recv().await,
                None => None,
            };
            match next {
                Some(event) if event.answers(id) => return Ok(event),
                Some(event) => debug!(?event, request_id = id, "dropping reply for an earlier request"),
                None => {
                    self.disconnect().await;
                    return Err(NetworkError::Closed);
                }
            }
        }
    }

    async fn connect_with_retry(&self) -> Result<ManagedConnection, NetworkError> {
        let mut last_error = None;
        for attempt in 0..=self.reconnect_attempts {
            match self.connect_once().await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    last_error = Some(err.to_string());
                    let _ = self.event_tx.send(NetworkEvent::TransportError(format!(
                        "connection attempt {} failed: {}",
                        attempt + 1,
                        err
                    )));
                    if attempt < self.reconnect_attempts {
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }

        Err(NetworkError::ConnectFailed(
            last_error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }

    async fn connect_once(&self) -> Result<ManagedConnection, NetworkError> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| NetworkError::RequestBuild(err.to_string()))?;

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| NetworkError::ConnectFailed(err.to_string()))?;
        let (writer, mut reader) = ws_stream.split();
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let event_tx = self.event_tx.clone();

        let reader_task = tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<EngineEvent>(&text) {
                            Ok(EngineEvent::Progress { progress, text }) => {
                                debug!(progress, "{text}");
                                let _ = event_tx.send(NetworkEvent::Progress { progress, text });
                            }
                            Ok(EngineEvent::Unknown) => {
                                warn!("received unknown engine frame: {text}");
                            }
                            Ok(event) => {
                                if reply_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                if let Some(extracted) = extract_engine_error_message(&text) {
                                    let _ = reply_tx.send(EngineEvent::Error {
                                        id: None,
                                        message: extracted,
                                        kind: None,
                                    });
                                } else {
                                    warn!("failed to parse engine frame: {err}; payload={text}");
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("ignored engine binary payload");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .as_ref()
                            .map(|close| close.reason.to_string())
                            .filter(|reason| !reason.trim().is_empty())
                            .unwrap_or_else(|| "remote closed".to_string());
                        let _ = event_tx.send(NetworkEvent::TransportError(format!(
                            "engine connection closed: {reason}"
                        )));
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        let _ = event_tx.send(NetworkEvent::TransportError(format!(
                            "engine receive error: {err}"
                        )));
                        break;
                    }
                    None => {
                        let _ = event_tx.send(NetworkEvent::TransportError(
                            "engine stream ended".to_string(),
                        ));
                        break;
                    }
                }
            }
        });

        Ok(ManagedConnection {
            writer,
            replies,
            reader_task,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

impl ModelService for EngineClient {
    async fn load(&mut self, model_id: &str) -> Result<(), ServiceFailure> {
        let id = self.allocate_id();
        match self.call(&EngineRequest::Load { id, model_id }, id).await {
            Ok(EngineEvent::Loaded { .. }) => Ok(()),
            Ok(other) => Err(reply_failure(other)),
            Err(err) => Err(ServiceFailure::Other(err.to_string())),
        }
    }

    async fn unload(&mut self) -> Result<(), ServiceFailure> {
        let id = self.allocate_id();
        match self.call(&EngineRequest::Unload { id }, id).await {
            Ok(EngineEvent::Unloaded { .. }) => Ok(()),
            Ok(other) => Err(reply_failure(other)),
            Err(err) => Err(ServiceFailure::Other(err.to_string())),
        }
    }

    async fn complete(&mut self, request: &CompletionRequest) -> Result<String, ServiceFailure> {
        let id = self.allocate_id();
        let frame = EngineRequest::Complete {
            id,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        match self.call(&frame, id).await {
            Ok(EngineEvent::Completion { text, .. }) => Ok(text),
            Ok(other) => Err(reply_failure(other)),
            Err(err) => Err(ServiceFailure::Other(err.to_string())),
        }
    }
}

fn reply_failure(event: EngineEvent) -> ServiceFailure {
    match event {
        EngineEvent::Error { message, kind, .. } => ServiceFailure::from_kind(kind, &message),
        other => ServiceFailure::Other(NetworkError::UnexpectedReply(format!("{other:?}")).to_string()),
    }
}

fn extract_engine_error_message(payload: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(payload).ok()?;
    let message = value
        .get("message")
        .and_then(|item| item.as_str())
        .or_else(|| value.get("error").and_then(|item| item.as_str()))?;
    (!message.trim().is_empty()).then(|| message.to_string())
}

fn is_expected_close_error(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::AlreadyClosed | tungstenite::Error::ConnectionClosed
    ) || err
        .to_string()
        .contains("Sending after closing is not allowed")
}
