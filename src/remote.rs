//! Remote streaming session: the message contract plus the websocket
//! implementation.
//!
//! The remote side is an opaque bidirectional session. The engine only
//! relies on the contract here: a `setup` message opens the session, frames
//! go out as `realtimeInput`, and an ordered stream of `opened` /
//! `serverAudio` / `transcript` / `interrupted` / `closed` / `error`
//! messages comes back.

use crate::codec::{FrameKind, TransportFrame};
use crate::error::SessionError;
use crate::transcript::Speaker;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Configuration for one remote session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub persona: Option<String>,
    pub voice: Option<String>,
    pub modality: ResponseModality,
}

impl SessionConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            persona: None,
            voice: None,
            modality: ResponseModality::Audio,
        }
    }
}

/// Desired output modality for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
    Text,
}

impl ResponseModality {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Text => "TEXT",
        }
    }
}

/// Inbound messages, already lifted out of the wire format.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Opened,
    Audio { data: String, sample_rate: u32 },
    Transcript { speaker: Speaker, text: String },
    Interrupted,
    Closed,
    Error(String),
}

/// An open remote session: ordered sink out, ordered event stream in.
pub struct RemoteSession {
    pub sink: Box<dyn RemoteSink>,
    pub events: mpsc::Receiver<ServerEvent>,
}

#[async_trait]
pub trait RemoteSink: Send {
    async fn send_frame(&mut self, frame: &TransportFrame) -> Result<(), SessionError>;
    /// Close the session if still open. Idempotent.
    async fn close(&mut self);
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<RemoteSession, SessionError>;
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct SetupMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<String>,
    response_modalities: Vec<String>,
}

#[derive(Debug, Serialize)]
struct MediaChunk<'a> {
    data: &'a str,
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerAudio {
    data: String,
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct ServerTranscript {
    speaker: Speaker,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    message: String,
}

/// Server -> client wire messages.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerMessage {
    Opened {
        #[serde(rename = "opened")]
        _opened: serde_json::Value,
    },
    Audio {
        #[serde(rename = "serverAudio")]
        server_audio: ServerAudio,
    },
    Transcript {
        #[serde(rename = "transcript")]
        transcript: ServerTranscript,
    },
    Interrupted {
        #[serde(rename = "interrupted")]
        _interrupted: serde_json::Value,
    },
    Closed {
        #[serde(rename = "closed")]
        _closed: serde_json::Value,
    },
    Error {
        #[serde(rename = "error")]
        error: ServerError,
    },
}

fn setup_json(config: &SessionConfig) -> Result<String, SessionError> {
    let setup = SetupMessage {
        persona: config.persona.clone(),
        voice: config.voice.clone(),
        response_modalities: vec![config.modality.as_str().to_string()],
    };
    Ok(serde_json::json!({ "setup": setup }).to_string())
}

fn frame_json(frame: &TransportFrame) -> String {
    let chunk = MediaChunk {
        data: &frame.data,
        mime_type: &frame.mime_type,
    };
    let input = match frame.kind {
        FrameKind::Audio => serde_json::json!({ "audio": chunk }),
        FrameKind::Image => serde_json::json!({ "video": chunk }),
    };
    serde_json::json!({ "realtimeInput": input }).to_string()
}

fn lift(message: ServerMessage) -> ServerEvent {
    match message {
        ServerMessage::Opened { .. } => ServerEvent::Opened,
        ServerMessage::Audio { server_audio } => ServerEvent::Audio {
            data: server_audio.data,
            sample_rate: server_audio.sample_rate,
        },
        ServerMessage::Transcript { transcript } => ServerEvent::Transcript {
            speaker: transcript.speaker,
            text: transcript.text,
        },
        ServerMessage::Interrupted { .. } => ServerEvent::Interrupted,
        ServerMessage::Closed { .. } => ServerEvent::Closed,
        ServerMessage::Error { error } => ServerEvent::Error(error.message),
    }
}

// ---------------------------------------------------------------------------
// Websocket implementation
// ---------------------------------------------------------------------------

type WsSinkHalf = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

pub struct WsConnector;

#[async_trait]
impl RemoteConnector for WsConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<RemoteSession, SessionError> {
        info!("connecting to remote session at {}", config.url);
        let (ws, _resp) = connect_async(config.url.as_str())
            .await
            .map_err(|e| SessionError::RemoteConnect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(setup_json(config)?.into()))
            .await
            .map_err(|e| SessionError::RemoteConnect(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(100);
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                if event_tx.send(lift(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // Unknown or malformed messages are skipped;
                                // they are not fatal to the session.
                                warn!("unparseable server message: {} ({})", text, e);
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!("remote closed the session: {:?}", frame);
                        let _ = event_tx.send(ServerEvent::Closed).await;
                        break;
                    }
                    Ok(_) => {} // ping/pong
                    Err(e) => {
                        let _ = event_tx.send(ServerEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            debug!("inbound message task finished");
        });

        Ok(RemoteSession {
            sink: Box::new(WsSink { sink, closed: false }),
            events: event_rx,
        })
    }
}

struct WsSink {
    sink: WsSinkHalf,
    closed: bool,
}

#[async_trait]
impl RemoteSink for WsSink {
    async fn send_frame(&mut self, frame: &TransportFrame) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::RemoteSession("session closed".into()));
        }
        self.sink
            .send(Message::Text(frame_json(frame).into()))
            .await?;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.sink.send(Message::Close(None)).await;
        }
    }
}
