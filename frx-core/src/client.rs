//! Client side of the relay protocol.
//!
//! Used by the load-test binary and the integration tests. The client can
//! be split into a sending and a receiving half so frames can be streamed
//! while results are read concurrently.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::FrameCodec;
use crate::error::FrxError;
use crate::protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── ClientSender ─────────────────────────────────────────────────

pub struct ClientSender {
    sink: SplitSink<WsStream, Message>,
    codec: FrameCodec,
}

impl ClientSender {
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), FrxError> {
        self.send_text(message.to_json()?).await
    }

    /// Send an arbitrary text message, bypassing serialization.
    pub async fn send_text(&mut self, text: String) -> Result<(), FrxError> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Register the identity image (a JPEG).
    pub async fn send_source_face(&mut self, image: &[u8]) -> Result<(), FrxError> {
        self.send(&ClientMessage::SourceFace {
            data: self.codec.encode_image(image),
            protocol_version: Some(PROTOCOL_VERSION),
        })
        .await
    }

    /// Send one JPEG frame stamped with `timestamp`.
    pub async fn send_frame(&mut self, image: &[u8], timestamp: f64) -> Result<(), FrxError> {
        self.send(&ClientMessage::Frame {
            data: self.codec.encode_image(image),
            timestamp,
        })
        .await
    }

    pub async fn request_stats(&mut self) -> Result<(), FrxError> {
        self.send(&ClientMessage::StatsRequest).await
    }

    pub async fn ping(&mut self) -> Result<(), FrxError> {
        self.send(&ClientMessage::Ping).await
    }

    pub async fn close(&mut self) -> Result<(), FrxError> {
        self.sink.close().await?;
        Ok(())
    }
}

// ── ClientReceiver ───────────────────────────────────────────────

pub struct ClientReceiver {
    source: SplitStream<WsStream>,
}

impl ClientReceiver {
    /// Next server message, or `None` once the server closed the
    /// connection. Non-text frames are skipped.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, FrxError> {
        while let Some(message) = self.source.next().await {
            match message? {
                Message::Text(text) => return ServerMessage::parse(text.as_str()).map(Some),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }
}

// ── RelayClient ──────────────────────────────────────────────────

/// A connected relay client.
pub struct RelayClient {
    tx: ClientSender,
    rx: ClientReceiver,
}

impl RelayClient {
    /// Connect to a `ws://` URL.
    pub async fn connect(url: &str) -> Result<Self, FrxError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, source) = ws.split();
        Ok(Self {
            tx: ClientSender {
                sink,
                codec: FrameCodec,
            },
            rx: ClientReceiver { source },
        })
    }

    pub fn into_split(self) -> (ClientSender, ClientReceiver) {
        (self.tx, self.rx)
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), FrxError> {
        self.tx.send(message).await
    }

    pub async fn send_text(&mut self, text: String) -> Result<(), FrxError> {
        self.tx.send_text(text).await
    }

    pub async fn send_source_face(&mut self, image: &[u8]) -> Result<(), FrxError> {
        self.tx.send_source_face(image).await
    }

    pub async fn send_frame(&mut self, image: &[u8], timestamp: f64) -> Result<(), FrxError> {
        self.tx.send_frame(image, timestamp).await
    }

    pub async fn request_stats(&mut self) -> Result<(), FrxError> {
        self.tx.request_stats().await
    }

    pub async fn ping(&mut self) -> Result<(), FrxError> {
        self.tx.ping().await
    }

    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, FrxError> {
        self.rx.recv().await
    }

    pub async fn close(&mut self) -> Result<(), FrxError> {
        self.tx.close().await
    }
}
