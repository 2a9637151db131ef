//! Persistent push transport: a TCP stream carrying newline-delimited
//! JSON frames, authenticated during the handshake with a presigned URL
//! (or a plain bearer token when the session carries no signing material).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::credentials::Session;
use crate::error::TransportError;
use crate::sign::Signer;

use super::{ChannelEvent, PushChannel, PushTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_BUFFER: usize = 64;

/// One frame on the wire, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SocketFrame {
    Subscribe {
        topic: Box<str>,
    },
    Unsubscribe {
        topic: Box<str>,
    },
    Message {
        topic: Box<str>,
        payload: serde_json::Value,
    },
    /// Broker confirmation of a subscribe or unsubscribe.
    Ack {
        topic: Box<str>,
    },
    Error {
        #[serde(default)]
        topic: Option<Box<str>>,
        #[serde(default)]
        code: Option<Box<str>>,
        message: Box<str>,
    },
    Ping,
}

/// Connects to the broker over TCP, presigning the handshake URL with
/// the session's signing credentials.
pub struct SignedSocketTransport {
    host: Box<str>,
    port: u16,
    path: Box<str>,
    region: Box<str>,
    service: Box<str>,
}

impl SignedSocketTransport {
    pub fn new(
        host: impl Into<Box<str>>,
        port: u16,
        path: impl Into<Box<str>>,
        region: impl Into<Box<str>>,
        service: impl Into<Box<str>>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            region: region.into(),
            service: service.into(),
        }
    }

    fn handshake_target(&self, session: &Session) -> String {
        match &session.signing {
            Some(signing) => Signer::new(signing, &self.region, &self.service).presign(
                &self.host,
                &self.path,
                jiff::Timestamp::now(),
            ),
            // Token-only sessions fall back to bearer-style query auth.
            None => format!("{}?access_token={}", self.path, session.token),
        }
    }
}

#[async_trait]
impl PushTransport for SignedSocketTransport {
    type Channel = SocketChannel;

    async fn connect(&self, session: &Session) -> Result<SocketChannel, TransportError> {
        let target = self.handshake_target(session);
        let addr = format!("{}:{}", self.host, self.port);

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportError::service("TIMEOUT", format!("connect to {addr} timed out"))
            })??;

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        // Handshake happens before the reader/writer tasks exist, so a
        // rejected connection surfaces as an error here and not as a
        // spurious `Closed` event later.
        writer.write_all(format!("CONNECT {target}\n").as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        let n = tokio::time::timeout(CONNECT_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| TransportError::service("TIMEOUT", "handshake response timed out"))??;
        if n == 0 {
            return Err(TransportError::message("broker closed during handshake"));
        }
        match serde_json::from_str::<SocketFrame>(line.trim())? {
            SocketFrame::Ack { .. } => {}
            SocketFrame::Error { code, message, .. } => {
                return Err(match code {
                    Some(code) => TransportError::service(code, message),
                    None => TransportError::message(message),
                });
            }
            other => {
                warn!(?other, "unexpected handshake frame");
                return Err(TransportError::message("unexpected handshake frame"));
            }
        }

        debug!(%addr, "socket channel established");
        Ok(SocketChannel::spawn(reader, writer))
    }
}

type AckMap = Arc<DashMap<Box<str>, oneshot::Sender<Result<(), TransportError>>>>;

/// An established broker connection. Frames are pumped by two spawned
/// tasks so slow consumers never block the stream.
pub struct SocketChannel {
    out: mpsc::Sender<SocketFrame>,
    events: mpsc::Receiver<ChannelEvent>,
    pending_acks: AckMap,
}

impl SocketChannel {
    fn spawn<R, W>(mut reader: BufReader<R>, mut writer: BufWriter<W>) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<SocketFrame>(FRAME_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(FRAME_BUFFER);
        let pending_acks: AckMap = Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let mut line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "dropping unserializable frame");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, "socket writer failed");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, "socket writer failed");
                    break;
                }
            }
        });

        let acks = pending_acks.clone();
        let pong = out_tx.clone();
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                let event = match reader.read_line(&mut line).await {
                    Ok(0) => ChannelEvent::Closed,
                    Ok(_) => match serde_json::from_str::<SocketFrame>(line.trim()) {
                        Ok(SocketFrame::Message { topic, payload }) => {
                            ChannelEvent::Message { topic, payload }
                        }
                        Ok(SocketFrame::Ack { topic }) => {
                            if let Some((_, tx)) = acks.remove(&topic) {
                                let _ = tx.send(Ok(()));
                            } else {
                                warn!(%topic, "ack without a waiter");
                            }
                            continue;
                        }
                        Ok(SocketFrame::Error {
                            topic,
                            code,
                            message,
                        }) => {
                            let err = match code {
                                Some(code) => TransportError::service(code, message),
                                None => TransportError::message(message),
                            };
                            if let Some(topic) = topic
                                && let Some((_, tx)) = acks.remove(&topic)
                            {
                                let _ = tx.send(Err(err));
                                continue;
                            }
                            ChannelEvent::Error(err)
                        }
                        Ok(SocketFrame::Ping) => {
                            let _ = pong.try_send(SocketFrame::Ping);
                            continue;
                        }
                        Ok(other) => {
                            warn!(?other, "unexpected inbound frame");
                            continue;
                        }
                        Err(e) => ChannelEvent::Error(e.into()),
                    },
                    Err(e) => {
                        error!(error = %e, "socket reader failed");
                        ChannelEvent::Closed
                    }
                };

                let closed = matches!(event, ChannelEvent::Closed);
                if event_tx.send(event).await.is_err() || closed {
                    break;
                }
            }
        });

        Self {
            out: out_tx,
            events: event_rx,
            pending_acks,
        }
    }

    async fn send_acked(&self, topic: &str, frame: SocketFrame) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.insert(topic.into(), tx);

        if self.out.send(frame).await.is_err() {
            self.pending_acks.remove(topic);
            return Err(TransportError::message("socket channel is closed"));
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::message("socket channel is closed")),
            Err(_) => {
                self.pending_acks.remove(topic);
                Err(TransportError::service(
                    "TIMEOUT",
                    format!("no ack for {topic}"),
                ))
            }
        }
    }
}

#[async_trait]
impl PushChannel for SocketChannel {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.send_acked(topic, SocketFrame::Subscribe { topic: topic.into() })
            .await
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.send_acked(topic, SocketFrame::Unsubscribe { topic: topic.into() })
            .await
    }

    async fn next_event(&mut self) -> ChannelEvent {
        self.events.recv().await.unwrap_or(ChannelEvent::Closed)
    }
}
