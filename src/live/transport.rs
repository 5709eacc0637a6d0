//! Streaming connection to the live model endpoint

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::protocol::{ClientMessage, ServerEvent, Setup, parse_server_message};
use crate::{Error, Result};

/// Time allowed for the close handshake before the socket is dropped
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket close code for a normal shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection-level event delivered to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Server accepted the setup
    Open,
    /// Validated server event
    Server(ServerEvent),
    /// Inbound message failed validation and was dropped
    Malformed(String),
    /// Transport failure
    Error(String),
    /// Connection closed by the server or the network
    ///
    /// `code` is the WebSocket close code, `None` if the stream ended
    /// without a close frame.
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Opens streaming connections
#[async_trait(?Send)]
pub trait Connector {
    /// Connect and send the session setup
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the endpoint cannot be reached
    async fn connect(&self, setup: &Setup) -> Result<Connection>;
}

/// Session side of an open connection
///
/// Outbound sends never wait: frames queue in the transport when the socket
/// is slower than capture.
#[derive(Debug)]
pub struct Connection {
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

/// Transport side of a [`Connection`]
#[derive(Debug)]
pub struct ConnectionPeer {
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl ConnectionPeer {
    /// Deliver an event to the session, ignoring a session already gone
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.inbound.send(event);
    }

    /// Validate a raw server message and deliver its events
    pub fn emit_message(&self, text: &str) {
        match parse_server_message(text) {
            Ok(events) => {
                for event in events {
                    let event = match event {
                        ServerEvent::SetupComplete => TransportEvent::Open,
                        other => TransportEvent::Server(other),
                    };
                    self.emit(event);
                }
            }
            Err(e) => self.emit(TransportEvent::Malformed(e.to_string())),
        }
    }
}

impl Connection {
    /// Create a connected session/transport pair
    #[must_use]
    pub fn channel() -> (Self, ConnectionPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: Some(out_tx),
                inbound: in_rx,
                task: None,
            },
            ConnectionPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Attach the background I/O task
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Queue a message without waiting
    ///
    /// Returns false if the connection is closed.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Next inbound event, `None` once the transport side is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Whether `close` has not been called yet
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    /// Close the connection
    ///
    /// Dropping the outbound sender tells the I/O task to run the close
    /// handshake (bounded by [`CLOSE_TIMEOUT`]) and exit. The task is handed
    /// back on the first call so the caller can wait for it; later calls
    /// return `None`.
    pub fn close(&mut self) -> Option<JoinHandle<()>> {
        self.outbound.take()?;
        self.inbound.close();
        let task = self.task.take();
        tracing::debug!(
            finished = task.as_ref().is_none_or(JoinHandle::is_finished),
            "connection closed"
        );
        task
    }
}

/// WebSocket connector for the live model endpoint
#[derive(Debug)]
pub struct WebSocketConnector {
    endpoint: Url,
    api_key: SecretString,
}

impl WebSocketConnector {
    /// Create a connector for `endpoint`
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is not a `ws`/`wss` URL
    pub fn new(endpoint: &str, api_key: &SecretString) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid live endpoint: {e}")))?;

        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "live endpoint must be ws:// or wss://, got {}://",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            endpoint,
            api_key: SecretString::from(api_key.expose_secret().to_owned()),
        })
    }

    fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        url
    }
}

#[async_trait(?Send)]
impl Connector for WebSocketConnector {
    async fn connect(&self, setup: &Setup) -> Result<Connection> {
        tracing::debug!(
            host = self.endpoint.host_str().unwrap_or_default(),
            model = %setup.model,
            "connecting to live endpoint"
        );

        let (ws, _response) = tokio_tungstenite::connect_async(self.request_url().as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (mut sink, stream) = ws.split();

        let setup = serde_json::to_string(&ClientMessage::Setup(setup.clone()))?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| Error::Connection(format!("failed to send setup: {e}")))?;

        let (connection, peer) = Connection::channel();
        let task = tokio::spawn(pump(sink, stream, peer));

        Ok(connection.with_task(task))
    }
}

/// Move messages between the socket and the session until either side closes
async fn pump(
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    mut peer: ConnectionPeer,
) {
    loop {
        tokio::select! {
            outgoing = peer.outbound.recv() => {
                let Some(message) = outgoing else {
                    // Session dropped its sender
                    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                        tracing::debug!("close handshake timed out");
                    }
                    break;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    peer.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => peer.emit_message(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => peer.emit_message(&text),
                        Err(e) => peer.emit(TransportEvent::Malformed(e.to_string())),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        peer.emit(TransportEvent::Closed {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame
                                .map(|f| f.reason.into_owned())
                                .filter(|r| !r.is_empty()),
                        });
                        break;
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        peer.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        peer.emit(TransportEvent::Closed {
                            code: None,
                            reason: None,
                        });
                        break;
                    }
                }
            }
        }
    }
}
