use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{FrameCodec, MAX_MESSAGE_SIZE};
use crate::error::{DecodeError, FrxError};
use crate::frame::SourceIdentity;
use crate::network::RelayContext;
use crate::protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage};
use crate::session::{ClientSession, SubmitOutcome};
use crate::state::SessionId;

/// Capacity of the per-connection control queue (stats, pong,
/// confirmations). Frame results never go through it.
const CONTROL_QUEUE: usize = 32;

/// A relay connection to a single client.
///
/// The reader side (this struct) decodes inbound messages and feeds the
/// session; a spawned writer task drains the control queue and the
/// session's outbound slot, always preferring control replies so a stats
/// answer is never stuck behind a frame.
pub struct RelayConnection {
    session: Arc<ClientSession>,
    ctx: Arc<RelayContext>,
    control_tx: mpsc::Sender<ServerMessage>,
    codec: FrameCodec,
}

impl RelayConnection {
    /// Run the WebSocket handshake on `stream` and serve the client until
    /// it disconnects, idles out, breaks protocol, or the server shuts
    /// down.
    pub async fn serve<S>(stream: S, peer: SocketAddr, ctx: Arc<RelayContext>) -> Result<(), FrxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = ctx.handshake_timeout;
        let ws = tokio::time::timeout(limit, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| FrxError::Timeout(limit))??;
        let (sink, source) = ws.split();

        let session = Arc::new(ClientSession::new(SessionId::next(), Some(peer)));
        let id = session.id();
        ctx.registry.register(Arc::clone(&session));
        info!(session = %id, %peer, clients = ctx.registry.len(), "client connected");

        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let writer_gone = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            sink,
            Arc::clone(&session),
            Arc::clone(&ctx),
            control_rx,
            writer_gone.clone(),
        ));

        let conn = Self {
            session: Arc::clone(&session),
            ctx: Arc::clone(&ctx),
            control_tx,
            codec: FrameCodec,
        };
        let result = conn.read_loop(source, &writer_gone).await;

        if let Err(FrxError::Protocol(reason)) = &result {
            warn!(session = %id, "protocol error: {reason}");
            let _ = conn
                .control_tx
                .send(ServerMessage::confirmation_err(reason.clone()))
                .await;
        }
        // Dropping the last control sender stops the writer once it has
        // flushed whatever is queued.
        drop(conn);
        let _ = writer.await;

        teardown(&session, &ctx);
        match &result {
            Ok(()) => info!(session = %id, "client disconnected"),
            Err(e) => info!(session = %id, "client dropped: {e}"),
        }
        result
    }

    async fn read_loop<S>(
        &self,
        mut source: SplitStream<WebSocketStream<S>>,
        writer_gone: &CancellationToken,
    ) -> Result<(), FrxError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle_timeout = self.ctx.idle_timeout;
        loop {
            let next = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Ok(()),
                _ = writer_gone.cancelled() => {
                    return Err(FrxError::Transport("write side closed".into()));
                }
                next = tokio::time::timeout(idle_timeout, source.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    info!(session = %self.session.id(), ?idle_timeout, "idle timeout");
                    return Err(FrxError::Timeout(idle_timeout));
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(message))) => message,
            };
            self.session.touch();

            let outcome = match message {
                Message::Text(text) => self.handle_text(text.as_str()).await,
                Message::Binary(_) => Err(DecodeError::Malformed("binary messages are not supported".into()).into()),
                Message::Close(_) => return Ok(()),
                // Ping/pong frames are answered by the transport.
                _ => Ok(()),
            };

            if let Err(e) = outcome {
                if e.is_terminal() {
                    return Err(e);
                }
                if matches!(e, FrxError::Decode(_)) {
                    self.ctx.stats.record_decode_error();
                }
                warn!(session = %self.session.id(), "message dropped: {e}");
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), FrxError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        match ClientMessage::parse(text)? {
            ClientMessage::Frame { data, timestamp } => self.on_frame(&data, timestamp),
            ClientMessage::SourceFace {
                data,
                protocol_version,
            } => self.on_source_face(&data, protocol_version).await,
            ClientMessage::StatsRequest => {
                let data = self.ctx.stats.snapshot();
                self.reply(ServerMessage::Stats { data }).await
            }
            ClientMessage::Ping => self.reply(ServerMessage::pong()).await,
            ClientMessage::Unknown => {
                debug!(session = %self.session.id(), "ignoring unknown message type");
                Ok(())
            }
        }
    }

    fn on_frame(&self, data: &str, timestamp: f64) -> Result<(), FrxError> {
        let seq = self.session.next_sequence();
        let frame = self.codec.decode(data, timestamp, seq)?;
        self.ctx.stats.record_received();

        match self.session.submit_frame(frame)? {
            SubmitOutcome::Queued {
                superseded,
                became_ready,
            } => {
                if superseded {
                    self.ctx.stats.record_dropped();
                }
                if became_ready {
                    self.ctx.scheduler.frame_ready(self.session.id())?;
                }
            }
            SubmitOutcome::NotConfigured => {
                self.ctx.stats.record_dropped();
                debug!(session = %self.session.id(), seq, "frame before source_face dropped");
            }
        }
        Ok(())
    }

    async fn on_source_face(&self, data: &str, version: Option<u32>) -> Result<(), FrxError> {
        if let Some(v) = version {
            if v != PROTOCOL_VERSION {
                return Err(FrxError::Protocol(format!(
                    "unsupported protocol version {v} (server speaks {PROTOCOL_VERSION})"
                )));
            }
        }
        let image = self
            .codec
            .decode_image(data)
            .map_err(|e| FrxError::Protocol(format!("invalid source image: {e}")))?;

        if let Some(current) = self.session.identity() {
            if current.fingerprint() == SourceIdentity::fingerprint_of(&image) {
                return self
                    .reply(ServerMessage::confirmation_ok("Source face unchanged"))
                    .await;
            }
        }

        match self.ctx.transformer.prepare_identity(image).await {
            Ok(identity) => {
                let fingerprint = identity.short_fingerprint();
                self.session.configure(Arc::new(identity))?;
                info!(session = %self.session.id(), %fingerprint, "source face registered");
                self.reply(ServerMessage::confirmation_ok(
                    "Source face registered successfully",
                ))
                .await
            }
            Err(e) => {
                warn!(session = %self.session.id(), "source face rejected: {e}");
                self.reply(ServerMessage::confirmation_err(e.to_string()))
                    .await
            }
        }
    }

    async fn reply(&self, message: ServerMessage) -> Result<(), FrxError> {
        Ok(self.control_tx.send(message).await?)
    }
}

/// Move the session to `Draining` and hand it to the scheduler, which
/// closes and unregisters it once no job is outstanding.
fn teardown(session: &Arc<ClientSession>, ctx: &RelayContext) {
    let id = session.id();
    let active_for = session.state().active_duration();
    debug!(session = %id, ?active_for, "draining");
    match session.begin_drain() {
        Ok(Some(_)) => ctx.stats.record_dropped(),
        Ok(None) => {}
        Err(e) => debug!(session = %id, "drain skipped: {e}"),
    }
    if ctx.scheduler.session_draining(id).is_err() {
        // Scheduler already stopped; nothing can be in flight.
        ctx.registry.unregister(id);
        session.close();
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    session: Arc<ClientSession>,
    ctx: Arc<RelayContext>,
    mut control_rx: mpsc::Receiver<ServerMessage>,
    writer_gone: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = FrameCodec;
    loop {
        let message = tokio::select! {
            biased;
            control = control_rx.recv() => match control {
                Some(message) => message,
                None => break,
            },
            _ = session.result_notified() => match session.take_result() {
                Ok(Some(frame)) => ServerMessage::ProcessedFrame {
                    data: codec.encode(&frame),
                    timestamp: frame.timestamp(),
                },
                Ok(None) => continue,
                Err(_) => break,
            },
        };

        let is_frame = matches!(message, ServerMessage::ProcessedFrame { .. });
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(session = %session.id(), "failed to encode reply: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(session = %session.id(), "network write error: {e}");
            break;
        }
        if is_frame {
            session.record_sent();
            ctx.stats.record_sent();
        }
    }
    writer_gone.cancel();
    let _ = sink.close().await;
}
