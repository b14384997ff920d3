//! WebSocket transport for the vendor's live (BidiGenerateContent) endpoint.
//!
//! ## Lifecycle
//!
//! ```text
//! connect_async(url?key=…)
//!   → send {"setup": …}
//!   → wait for {"setupComplete": {}}   (bounded by setup_timeout)
//!   → spawn transport task, return ChannelHandle
//! ```
//!
//! The transport task is the only owner of the socket. It forwards outbound
//! frames as `realtimeInput.audio` messages and turns `serverContent` into
//! [`ChannelEvent`]s. It always ends by emitting `Closed` or `Error`.

use std::time::Duration;

use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{
    protocol::{parse_server_message, ClientSetup, RealtimeInputMessage},
    ChannelCommand, ChannelConnector, ChannelEndpoint, ChannelEvent, ChannelHandle, SessionSetup,
};
use crate::error::{LiveError, Result};

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CAPACITY: usize = 256;

type LiveSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens live sessions over WebSocket.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    api_key: Option<String>,
    endpoint: String,
    setup_timeout: Duration,
    capacity: usize,
}

impl GeminiLiveConnector {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            endpoint: LIVE_ENDPOINT.to_string(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }
}

impl ChannelConnector for GeminiLiveConnector {
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, Result<ChannelHandle>> {
        let this = self.clone();
        Box::pin(async move { this.open(setup).await })
    }
}

impl GeminiLiveConnector {
    async fn open(self, setup: SessionSetup) -> Result<ChannelHandle> {
        let key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LiveError::ChannelOpen("no API key configured (set API_KEY)".into()))?;

        let url = format!("{}?key={}", self.endpoint, key);
        info!(model = %setup.model, voice = %setup.voice_name, "opening live session");

        let (mut socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| LiveError::ChannelOpen(e.to_string()))?;

        let setup_json = serde_json::to_string(&ClientSetup::from(&setup))
            .map_err(|e| LiveError::ChannelOpen(format!("setup encode: {e}")))?;
        socket
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| LiveError::ChannelOpen(e.to_string()))?;

        match tokio::time::timeout(self.setup_timeout, await_setup_complete(&mut socket)).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = socket.close(None).await;
                return Err(LiveError::ChannelOpen(format!(
                    "no setupComplete within {:?}",
                    self.setup_timeout
                )));
            }
        }
        info!("live session established");

        let (handle, endpoint) = ChannelHandle::pair(self.capacity);
        tokio::spawn(run_transport(socket, endpoint));
        Ok(handle)
    }
}

/// JSON payload of a data frame. The server sometimes sends JSON as binary.
fn message_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

async fn await_setup_complete(socket: &mut LiveSocket) -> Result<()> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| LiveError::ChannelOpen(e.to_string()))?;
        if let Message::Close(frame) = &msg {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .unwrap_or_default();
            return Err(LiveError::ChannelOpen(format!(
                "server closed during setup: {reason}"
            )));
        }
        let Some(text) = message_text(&msg) else {
            continue;
        };
        match parse_server_message(text) {
            Ok(parsed) if parsed.is_setup_complete() => return Ok(()),
            Ok(_) => debug!("ignoring message received before setupComplete"),
            Err(e) => warn!("unparseable message during setup: {e}"),
        }
    }
    Err(LiveError::ChannelOpen(
        "connection ended before setupComplete".into(),
    ))
}

async fn run_transport(socket: LiveSocket, mut endpoint: ChannelEndpoint) {
    let (mut sink, mut stream) = socket.split();
    let mut closing = false;

    let reason: Option<String> = loop {
        tokio::select! {
            command = endpoint.next_command(), if !closing => match command {
                Some(ChannelCommand::Frame(frame)) => {
                    let json = match serde_json::to_string(&RealtimeInputMessage::audio(&frame)) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to encode audio frame: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        let _ = endpoint.events.send(ChannelEvent::Error(e.to_string())).await;
                        return;
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    debug!("closing live session");
                    closing = true;
                    if sink.send(Message::Close(None)).await.is_err() {
                        break None;
                    }
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                }
                Some(Ok(msg)) => {
                    let Some(text) = message_text(&msg) else {
                        continue;
                    };
                    let parsed = match parse_server_message(text) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!("unparseable server message: {e}");
                            continue;
                        }
                    };
                    if let Some(go_away) = &parsed.go_away {
                        warn!(time_left = ?go_away.time_left, "server announced session end");
                    }
                    for event in parsed.into_events() {
                        if endpoint.events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    if closing {
                        break None;
                    }
                    error!("live session transport error: {e}");
                    let _ = endpoint.events.send(ChannelEvent::Error(e.to_string())).await;
                    return;
                }
                None => break None,
            },
        }
    };

    info!(reason = ?reason, "live session closed");
    let _ = endpoint.events.send(ChannelEvent::Closed { reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_json_is_treated_as_text() {
        let msg = Message::Binary(br#"{"setupComplete":{}}"#.to_vec());
        assert_eq!(message_text(&msg), Some(r#"{"setupComplete":{}}"#));
        assert_eq!(message_text(&Message::Binary(vec![0, 1, 2])), None);
        assert_eq!(message_text(&Message::Ping(vec![])), None);
    }

    fn session() -> SessionSetup {
        SessionSetup {
            model: "m".into(),
            voice_name: "Kore".into(),
            system_instruction: None,
        }
    }

    /// One-connection live server. Returns its URL and the text messages it
    /// received. With `answer_setup` it confirms the setup and speaks once.
    async fn serve_once(answer_setup: bool) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => {
                        let is_setup = text.starts_with(r#"{"setup""#);
                        received.push(text);
                        if is_setup && answer_setup {
                            let replies = [
                                json!({ "setupComplete": {} }),
                                json!({ "serverContent": {
                                    "modelTurn": { "parts": [{ "inlineData": {
                                        "mimeType": "audio/pcm;rate=24000", "data": "AAA="
                                    }}]},
                                    "turnComplete": true
                                }}),
                            ];
                            for reply in replies {
                                ws.send(Message::Text(reply.to_string())).await.unwrap();
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            let _ = ws.close(None).await;
            received
        });
        (url, task)
    }

    #[tokio::test]
    async fn session_round_trip_against_local_server() {
        let (url, server) = serve_once(true).await;
        let connector = GeminiLiveConnector::new(Some("test-key".into())).with_endpoint(url);
        let mut handle = connector.connect(session()).await.unwrap();

        assert!(matches!(handle.events.recv().await, Some(ChannelEvent::Audio(_))));
        assert_eq!(handle.events.recv().await, Some(ChannelEvent::TurnComplete));

        handle.close(Duration::from_secs(2)).await;
        let received = server.await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].contains(r#""voiceName":"Kore""#));
    }

    #[tokio::test]
    async fn setup_without_confirmation_times_out() {
        let (url, server) = serve_once(false).await;
        let connector = GeminiLiveConnector::new(Some("test-key".into()))
            .with_endpoint(url)
            .with_setup_timeout(Duration::from_millis(100));

        let reason = match connector.connect(session()).await {
            Err(LiveError::ChannelOpen(reason)) => reason,
            other => panic!("expected ChannelOpen, got {:?}", other.map(|_| ())),
        };
        assert!(reason.contains("setupComplete"), "{reason}");
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_channel_open_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let connector = GeminiLiveConnector::new(Some("test-key".into())).with_endpoint(url);
        let err = connector.connect(session()).await.unwrap_err();
        assert!(matches!(err, LiveError::ChannelOpen(_)));
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_dialing() {
        let connector = GeminiLiveConnector::new(Some("   ".into()));
        let err = connector.connect(session()).await.unwrap_err();
        assert!(matches!(err, LiveError::ChannelOpen(_)));
    }
}
